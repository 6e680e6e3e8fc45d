//! Run-level state machine.
//!
//! ```text
//! running --done--------------> done
//! running --needs_human--> paused --resume signal--> running
//! running --error | fatal tool condition | budget--> failed
//! ```
//!
//! Each iteration is one [`ToolLoop`] round. Decisions are logged to
//! `iter_NN_decision.json`; a fatal tool condition is logged to `error.json`.

use anyhow::Result;
use tracing::{error, info, instrument, warn};

use crate::core::decision::Decision;
use crate::core::types::Message;
use crate::io::artifacts::ArtifactStore;
use crate::io::human_gate::HumanGate;
use crate::io::llm::ChatModel;
use crate::io::run_log::{
    ADMIN_STEPS_FILE, DecisionRecord, ERROR_FILE, ErrorRecord, RunStatus, decision_file_name,
    timestamp,
};
use crate::observer::RunObserver;
use crate::tool_loop::{Conversation, RoundOutcome, ToolLoop};
use crate::tools::{FatalCondition, SessionState, ToolRegistry};

pub const ITERATION_BUDGET_EXHAUSTED: &str = "iteration budget exhausted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub max_iters: u32,
    pub max_round_trips: u32,
}

/// Collaborators the run loop needs besides the tools themselves.
pub struct RunContext<'r, 'a, M: ChatModel + ?Sized> {
    pub model: &'r M,
    pub registry: &'r ToolRegistry<'a>,
    pub artifacts: &'r ArtifactStore,
    pub gate: &'r HumanGate,
    pub observer: &'r dyn RunObserver,
    pub limits: RunLimits,
}

/// How the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveOutcome {
    pub status: RunStatus,
    pub reason: Option<String>,
    pub iterations: u32,
}

/// Drive iterations until a terminal decision, a fatal condition or the budget.
///
/// Never returns an error: a model or artifact failure ends the run as
/// `failed` with an `error.json` of kind `runtime`. Files changed along the
/// way stay recorded in `state`.
#[instrument(skip_all, fields(max_iters = ctx.limits.max_iters))]
pub fn drive<M: ChatModel + ?Sized>(
    ctx: &RunContext<'_, '_, M>,
    conversation: &mut Conversation,
    state: &mut SessionState,
) -> DriveOutcome {
    let mut iteration = 0;
    match drive_iterations(ctx, conversation, state, &mut iteration) {
        Ok(outcome) => outcome,
        Err(err) => record_runtime_failure(ctx.artifacts, &err, state, iteration),
    }
}

fn drive_iterations<M: ChatModel + ?Sized>(
    ctx: &RunContext<'_, '_, M>,
    conversation: &mut Conversation,
    state: &mut SessionState,
    iteration: &mut u32,
) -> Result<DriveOutcome> {
    let tool_loop = ToolLoop::new(ctx.model, ctx.registry, ctx.limits.max_round_trips, ctx.observer);

    while *iteration < ctx.limits.max_iters {
        *iteration += 1;
        let iteration = *iteration;
        ctx.observer.on_iteration(iteration, ctx.limits.max_iters);
        let decision = match tool_loop.run_round(conversation, state)? {
            RoundOutcome::Fatal(fatal) => {
                record_fatal(ctx.artifacts, &fatal, state)?;
                warn!(iteration, kind = fatal.kind(), err = %fatal.message(), "run aborted by fatal tool condition");
                let reason = format!("{} error: {}", fatal.kind(), fatal.message());
                return Ok(finished(RunStatus::Failed, Some(reason), iteration));
            }
            RoundOutcome::Decided(decision) => decision,
        };

        ctx.artifacts.write_json(
            &decision_file_name(iteration),
            &DecisionRecord {
                iteration,
                status: decision.decision.status(),
                decision: &decision.raw,
            },
        )?;
        ctx.observer.on_decision(iteration, &decision.decision);

        match decision.decision {
            Decision::Done { .. } => {
                info!(iteration, "run done");
                return Ok(finished(RunStatus::Done, None, iteration));
            }
            Decision::Error { error } => {
                let reason = if error.trim().is_empty() {
                    "model reported an error".to_string()
                } else {
                    error
                };
                return Ok(finished(RunStatus::Failed, Some(reason), iteration));
            }
            Decision::Continue { notes } => {
                conversation.push(Message::user(continue_message(&notes)));
            }
            Decision::NeedsHuman { admin_steps, .. } => {
                let steps = admin_steps.trim();
                if !steps.is_empty() {
                    ctx.artifacts.write_text(ADMIN_STEPS_FILE, steps)?;
                }
                ctx.observer.on_paused(&ctx.artifacts.root().join(ADMIN_STEPS_FILE));
                let notes = ctx.gate.wait_for_resume()?;
                conversation.push(Message::user(resume_message(&notes)));
            }
        }
    }

    Ok(finished(
        RunStatus::Failed,
        Some(ITERATION_BUDGET_EXHAUSTED.to_string()),
        ctx.limits.max_iters,
    ))
}

/// Record an unexpected error as the end of the run.
pub fn record_runtime_failure(
    artifacts: &ArtifactStore,
    err: &anyhow::Error,
    state: &SessionState,
    iterations: u32,
) -> DriveOutcome {
    let message = format!("{err:#}");
    error!(iterations, err = %message, "run aborted");
    let record = ErrorRecord {
        kind: "runtime".to_string(),
        message: message.clone(),
        op_index: None,
        op_type: None,
        changed_files: state.changed_files.clone(),
        created_files: state.created_files.clone(),
        applied_ops: state.applied_ops.clone(),
        at: timestamp(),
    };
    if let Err(write_err) = artifacts.write_json(ERROR_FILE, &record) {
        warn!(err = %write_err, "failed to write error record");
    }
    finished(RunStatus::Failed, Some(message), iterations)
}

fn finished(status: RunStatus, reason: Option<String>, iterations: u32) -> DriveOutcome {
    DriveOutcome {
        status,
        reason,
        iterations,
    }
}

fn continue_message(notes: &str) -> String {
    let notes = notes.trim();
    if notes.is_empty() {
        "Continue with the task.".to_string()
    } else {
        format!("Continue with the task. Your previous notes:\n{notes}")
    }
}

fn resume_message(notes: &str) -> String {
    let notes = notes.trim();
    if notes.is_empty() {
        "The human has applied the admin steps. Continue with the task.".to_string()
    } else {
        format!("The human has applied the admin steps. Notes from the human:\n{notes}")
    }
}

/// Write `error.json` for a plan or apply failure.
pub fn record_fatal(artifacts: &ArtifactStore, fatal: &FatalCondition, state: &SessionState) -> Result<()> {
    let record = ErrorRecord {
        kind: fatal.kind().to_string(),
        message: fatal.message(),
        op_index: fatal.op_index(),
        op_type: fatal.op_type().map(str::to_string),
        changed_files: state.changed_files.clone(),
        created_files: state.created_files.clone(),
        applied_ops: state.applied_ops.clone(),
        at: timestamp(),
    };
    artifacts.write_json(ERROR_FILE, &record)?;
    Ok(())
}
