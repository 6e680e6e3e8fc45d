//! Orchestration for the CLI commands: a full agent run, offline plan
//! application and baseline maintenance.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::plan::PlanValidator;
use crate::io::artifacts::ArtifactStore;
use crate::io::baseline::{Baseline, BaselineStore};
use crate::io::config::AgentConfig;
use crate::io::human_gate::HumanGate;
use crate::io::llm::ChatModel;
use crate::io::patch::{ApplyReport, PatchEngine};
use crate::io::preview::PreviewServer;
use crate::io::prompt::{PromptEngine, PromptInputs};
use crate::io::protocol::ProtocolClient;
use crate::io::run_log::{
    RUN_SUMMARY_FILE, RunStatus, RunSummary, WORKSPACE_SUMMARY_FILE, create_run_dir, timestamp,
};
use crate::io::sandbox::CommandSandbox;
use crate::io::summary::{check_structure, summarize_workspace};
use crate::io::task::TaskBundle;
use crate::io::verify::{Verifier, VerifySettings};
use crate::io::workspace_fs::ScopedFileSystem;
use crate::observer::RunObserver;
use crate::run::{DriveOutcome, RunContext, RunLimits, drive, record_fatal, record_runtime_failure};
use crate::tool_loop::Conversation;
use crate::tools::artifacts::{WriteBase64, WriteText};
use crate::tools::bridge::{BridgeCall, BridgeListTools};
use crate::tools::human::PauseForAdmin;
use crate::tools::plan::PlanApply;
use crate::tools::verify::VerifyRun;
use crate::tools::workspace::{ListFiles, ReadFile, Search, WriteFile};
use crate::tools::{FatalCondition, SessionState, ToolRegistry};

pub const PREVIEW_LOG_FILE: &str = "preview.log";
pub const PLAN_FILE: &str = "plan.json";
pub const APPLY_REPORT_FILE: &str = "apply.json";

/// Where a run reads its inputs and writes its artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    /// Theme workspace root.
    pub workdir: PathBuf,
    /// Directory holding `task.md` and friends, and the human signal file.
    pub tasks_dir: PathBuf,
    /// Parent of every run directory and of the baseline store.
    pub runs_dir: PathBuf,
}

/// Result of a complete run, as recorded in `run.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub status: RunStatus,
    pub reason: Option<String>,
    pub iterations: u32,
    pub changed_files: Vec<String>,
    pub created_files: Vec<String>,
}

/// Execute one agent run end to end.
///
/// Errors are returned only for problems found before the run directory
/// exists (such as a missing `task.md`). Everything later, including bridge
/// handshake failures, ends the run as `failed` with `run.json` written.
#[instrument(skip_all, fields(workdir = %paths.workdir.display()))]
pub fn run_session<M: ChatModel + ?Sized>(
    paths: &SessionPaths,
    cfg: &AgentConfig,
    model: &M,
    observer: &dyn RunObserver,
) -> Result<RunOutcome> {
    let started_at = timestamp();
    check_structure(&paths.workdir, &cfg.workspace.required_dirs);
    let task = TaskBundle::load(&paths.tasks_dir)?;

    let (run_id, run_dir) = create_run_dir(&paths.runs_dir)?;
    let artifacts = ArtifactStore::new(&run_dir)?;
    info!(run_id = %run_id, run_dir = %run_dir.display(), "run started");

    let mut state = SessionState::default();
    let outcome = match execute(paths, cfg, model, observer, &task, &artifacts, &mut state) {
        Ok(outcome) => outcome,
        Err(err) => record_runtime_failure(&artifacts, &err, &state, 0),
    };

    let summary = RunSummary {
        run_id: run_id.clone(),
        workspace: paths.workdir.display().to_string(),
        status: outcome.status,
        reason: outcome.reason.clone(),
        iterations: outcome.iterations,
        changed_files: state.changed_files.clone(),
        created_files: state.created_files.clone(),
        last_verify: state.last_verify.clone(),
        started_at,
        finished_at: timestamp(),
    };
    artifacts.write_json(RUN_SUMMARY_FILE, &summary)?;
    info!(
        run_id = %run_id,
        status = outcome.status.as_str(),
        iterations = outcome.iterations,
        "run finished"
    );

    Ok(RunOutcome {
        run_id,
        run_dir,
        status: outcome.status,
        reason: outcome.reason,
        iterations: outcome.iterations,
        changed_files: summary.changed_files,
        created_files: summary.created_files,
    })
}

/// Set up the run's collaborators, drive the loop and shut everything down.
///
/// Bridges and the preview server are also stopped on early returns, when
/// their values drop.
fn execute<M: ChatModel + ?Sized>(
    paths: &SessionPaths,
    cfg: &AgentConfig,
    model: &M,
    observer: &dyn RunObserver,
    task: &TaskBundle,
    artifacts: &ArtifactStore,
    state: &mut SessionState,
) -> Result<DriveOutcome> {
    let asserts_path = task.copy_to(artifacts)?;
    let fs = ScopedFileSystem::new(&paths.workdir, cfg.workspace.clone())?;

    let summary = summarize_workspace(fs.root());
    artifacts.write_json(WORKSPACE_SUMMARY_FILE, &summary)?;
    let summary_json =
        serde_json::to_string_pretty(&summary).context("serialize workspace summary")?;

    let sandbox = CommandSandbox::from_config(&cfg.commands);
    let baselines = BaselineStore::under_runs_dir(&paths.runs_dir);

    let mut bridges = Vec::with_capacity(cfg.bridges.len());
    for bridge in &cfg.bridges {
        let client = ProtocolClient::spawn(bridge)
            .with_context(|| format!("start bridge {}", bridge.name))?;
        bridges.push(client);
    }

    let mut preview = if cfg.verify.base_url.is_none() {
        start_preview(&sandbox, cfg, fs.root(), artifacts)
    } else {
        None
    };
    let base_url = cfg
        .verify
        .base_url
        .clone()
        .or_else(|| preview.as_ref().map(|p| p.base_url().to_string()));

    let mut settings = VerifySettings::from_config(&cfg.verify);
    settings.base_url = base_url.clone();
    settings.asserts_path = asserts_path;

    let validator = PlanValidator::new(cfg.plan.clone(), cfg.workspace.allowed_top_dirs.clone());
    let gate = HumanGate::from_config(&paths.tasks_dir, &cfg.human);

    let outcome = {
        let mut registry = ToolRegistry::new();
        registry.register(ReadFile { fs: &fs })?;
        registry.register(WriteFile { fs: &fs })?;
        registry.register(ListFiles { fs: &fs })?;
        registry.register(Search {
            fs: &fs,
            sandbox: &sandbox,
            output_limit_chars: cfg.commands.search_output_limit_chars,
        })?;
        registry.register(WriteText { artifacts })?;
        registry.register(WriteBase64 { artifacts })?;
        registry.register(PlanApply {
            validator: &validator,
            fs: &fs,
        })?;
        registry.register(VerifyRun {
            sandbox: &sandbox,
            workspace_root: fs.root(),
            artifacts,
            baselines: &baselines,
            settings: settings.clone(),
        })?;
        registry.register(PauseForAdmin {
            gate: &gate,
            artifacts,
        })?;
        for client in &bridges {
            registry.register(BridgeListTools { client })?;
            registry.register(BridgeCall { client })?;
        }
        info!(tools = registry.len(), "tools registered");

        let prompt = PromptEngine::new().render_system(&PromptInputs {
            task,
            workspace_summary_json: &summary_json,
            base_url: base_url.as_deref(),
            routes: &settings.routes,
            run_checker: settings.run_checker,
            run_browser: settings.run_browser,
            allowed_dirs: fs.allowed_dirs(),
            max_ops: cfg.plan.max_ops,
            min_justification_chars: cfg.plan.min_justification_chars,
        })?;

        let ctx = RunContext {
            model,
            registry: &registry,
            artifacts,
            gate: &gate,
            observer,
            limits: RunLimits {
                max_iters: cfg.run_loop.max_iters,
                max_round_trips: cfg.run_loop.max_tool_round_trips,
            },
        };
        let mut conversation = Conversation::new(prompt);
        drive(&ctx, &mut conversation, state)
    };

    if let Some(server) = preview.as_mut() {
        server.stop();
    }
    for client in &mut bridges {
        client.close();
    }
    Ok(outcome)
}

/// Start the preview server if one is configured. A failed start only loses
/// the browser check.
fn start_preview(
    sandbox: &CommandSandbox,
    cfg: &AgentConfig,
    workspace: &Path,
    artifacts: &ArtifactStore,
) -> Option<PreviewServer> {
    let log_path = artifacts.root().join(PREVIEW_LOG_FILE);
    match PreviewServer::start(sandbox, &cfg.preview, workspace, &log_path) {
        Ok(server) => server,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "preview server failed to start; browser checks will be skipped");
            None
        }
    }
}

/// Validate and apply a plan document outside of a run.
///
/// With `runs_dir`, a run directory records the normalized plan and either the
/// apply report or `error.json`. Plan and apply failures are returned as
/// [`PlanError`](crate::core::plan::PlanError) and
/// [`ApplyError`](crate::io::patch::ApplyError) inside the `anyhow` chain.
#[instrument(skip_all, fields(plan = %plan_path.display()))]
pub fn apply_plan_file(
    workdir: &Path,
    plan_path: &Path,
    cfg: &AgentConfig,
    runs_dir: Option<&Path>,
) -> Result<ApplyReport> {
    let raw = fs::read_to_string(plan_path)
        .with_context(|| format!("read plan {}", plan_path.display()))?;
    let document: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parse plan {}", plan_path.display()))?;
    let fs = ScopedFileSystem::new(workdir, cfg.workspace.clone())?;
    let validator = PlanValidator::new(cfg.plan.clone(), cfg.workspace.allowed_top_dirs.clone());
    let artifacts = match runs_dir {
        Some(dir) => Some(ArtifactStore::new(&create_run_dir(dir)?.1)?),
        None => None,
    };

    let mut state = SessionState::default();
    let fatal = match validator.validate(&document) {
        Ok(plan) => {
            if let Some(artifacts) = &artifacts {
                artifacts.write_json(PLAN_FILE, &plan.normalized)?;
            }
            match PatchEngine::new(&fs).apply_plan(&plan) {
                Ok(report) => {
                    if let Some(artifacts) = &artifacts {
                        artifacts.write_json(APPLY_REPORT_FILE, &report)?;
                    }
                    info!(changed = report.changed_files.len(), "plan applied");
                    return Ok(report);
                }
                Err(err) => {
                    state.record_apply(&err.partial);
                    FatalCondition::Apply(err)
                }
            }
        }
        Err(err) => FatalCondition::Plan(err),
    };

    if let Some(artifacts) = &artifacts {
        record_fatal(artifacts, &fatal, &state)?;
    }
    Err(match fatal {
        FatalCondition::Plan(err) => anyhow::Error::from(err),
        FatalCondition::Apply(err) => anyhow::Error::from(err),
    })
}

/// Show the stored baseline for `workdir`, or regenerate it by running the checker.
pub fn baseline_command(
    workdir: &Path,
    runs_dir: &Path,
    cfg: &AgentConfig,
    regenerate: bool,
) -> Result<Option<Baseline>> {
    let store = BaselineStore::under_runs_dir(runs_dir);
    if !regenerate {
        return store.load(workdir);
    }
    let (_, run_dir) = create_run_dir(runs_dir)?;
    let artifacts = ArtifactStore::new(&run_dir)?;
    let sandbox = CommandSandbox::from_config(&cfg.commands);
    let verifier = Verifier::new(
        &sandbox,
        workdir,
        &artifacts,
        &store,
        VerifySettings::from_config(&cfg.verify),
    );
    let baseline = verifier.regenerate_baseline()?;
    info!(
        errors = baseline.counts.errors,
        warnings = baseline.counts.warnings,
        "baseline regenerated"
    );
    Ok(Some(baseline))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::plan::PlanError;
    use crate::io::patch::ApplyError;
    use crate::io::run_log::ERROR_FILE;
    use crate::test_support::{
        HEADER_SECTION, RecordingObserver, ScriptedModel, TestWorkspace, decision_turn, tool_turn,
    };

    fn write_plan(ws: &TestWorkspace, plan: &Value) -> PathBuf {
        let path = ws.path().join("plan.json");
        fs::write(&path, plan.to_string()).expect("write plan");
        path
    }

    #[test]
    fn session_registers_tools_in_order() {
        let ws = TestWorkspace::new().expect("workspace");
        let model = ScriptedModel::new(vec![decision_turn(json!({"status": "done"}))]);
        let observer = RecordingObserver::default();
        let outcome = run_session(&ws.paths(), &ws.config(), &model, &observer).expect("run");
        assert_eq!(outcome.status, RunStatus::Done);
        assert_eq!(
            model.tool_names()[0],
            vec![
                "workspace_read_file",
                "workspace_write_file",
                "workspace_list_files",
                "workspace_search",
                "artifacts_write_text",
                "artifacts_write_base64",
                "plan_apply",
                "verify_run",
                "human_pause_for_admin_updates",
            ]
        );
        let system = &model.requests()[0][0].content;
        assert!(system.contains("Add an announcement line below the header."));
        assert!(outcome.run_dir.join(WORKSPACE_SUMMARY_FILE).is_file());
        assert!(outcome.run_dir.join("task.md").is_file());
    }

    #[test]
    fn missing_task_is_an_error_before_any_run_dir() {
        let ws = TestWorkspace::new().expect("workspace");
        fs::remove_file(ws.tasks().join("task.md")).expect("remove task");
        let model = ScriptedModel::new(Vec::new());
        let err = run_session(&ws.paths(), &ws.config(), &model, &RecordingObserver::default())
            .expect_err("missing task");
        assert!(err.downcast_ref::<crate::io::task::MissingTask>().is_some());
        assert!(!ws.runs().exists());
    }

    #[test]
    fn bridge_start_failure_fails_the_run() {
        let ws = TestWorkspace::new().expect("workspace");
        let mut cfg = ws.config();
        cfg.bridges.push(crate::io::config::BridgeConfig {
            name: "docs".to_string(),
            command: vec!["/nonexistent/bridge-binary".to_string()],
            protocol_version: "2025-11-25".to_string(),
            env: Default::default(),
        });
        let model = ScriptedModel::new(Vec::new());
        let outcome =
            run_session(&ws.paths(), &cfg, &model, &RecordingObserver::default()).expect("run");
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.reason.unwrap_or_default().contains("start bridge docs"));
        assert!(outcome.run_dir.join(RUN_SUMMARY_FILE).is_file());
        assert!(model.requests().is_empty());
    }

    #[test]
    fn plan_apply_changes_are_reported_in_run_summary() {
        let ws = TestWorkspace::new().expect("workspace");
        let model = ScriptedModel::new(vec![
            tool_turn(vec![(
                "plan_apply",
                json!({"plan": {"ops": [{
                    "type": "insert_after",
                    "path": "sections/header.liquid",
                    "anchor": "{{ shop.name }}\n",
                    "content": "  <p class=\"announcement\">Free shipping</p>\n",
                    "expected_anchor_count": 1
                }]}}),
            )]),
            decision_turn(json!({"status": "done", "notes": "added"})),
        ]);
        let outcome = run_session(&ws.paths(), &ws.config(), &model, &RecordingObserver::default())
            .expect("run");
        assert_eq!(outcome.status, RunStatus::Done);
        assert_eq!(outcome.changed_files, vec!["sections/header.liquid"]);
        let header = ws.read_theme_file("sections/header.liquid").expect("header");
        assert!(header.contains("{{ shop.name }}\n  <p class=\"announcement\">"));

        let summary: Value = serde_json::from_str(
            &fs::read_to_string(outcome.run_dir.join(RUN_SUMMARY_FILE)).expect("read"),
        )
        .expect("json");
        assert_eq!(summary["status"], "done");
        assert_eq!(summary["iterations"], 1);
        assert_eq!(summary["changed_files"], json!(["sections/header.liquid"]));
    }

    #[test]
    fn offline_apply_records_report() {
        let ws = TestWorkspace::new().expect("workspace");
        let plan = write_plan(
            &ws,
            &json!({"ops": [{
                "type": "replace_once",
                "path": "./sections/header.liquid",
                "anchor": "site-header",
                "replacement": "site-header site-header--sticky",
                "expected_anchor_count": 1
            }]}),
        );
        let report = apply_plan_file(&ws.theme(), &plan, &ws.config(), Some(&ws.runs()))
            .expect("apply");
        assert_eq!(report.changed_files, vec!["sections/header.liquid"]);
        let run_dir = ws.only_run_dir().expect("run dir");
        let normalized: Value =
            serde_json::from_str(&fs::read_to_string(run_dir.join(PLAN_FILE)).expect("read"))
                .expect("json");
        assert_eq!(normalized["ops"][0]["path"], "sections/header.liquid");
        assert!(run_dir.join(APPLY_REPORT_FILE).is_file());
    }

    #[test]
    fn offline_apply_surfaces_typed_errors() {
        let ws = TestWorkspace::new().expect("workspace");
        let invalid = write_plan(&ws, &json!({"ops": []}));
        let err = apply_plan_file(&ws.theme(), &invalid, &ws.config(), None).expect_err("invalid");
        assert!(matches!(err.downcast_ref::<PlanError>(), Some(PlanError::MissingOps)));

        let mismatch = write_plan(
            &ws,
            &json!({"ops": [{
                "type": "insert_before",
                "path": "sections/header.liquid",
                "anchor": "not in the file",
                "content": "x",
                "expected_anchor_count": 1
            }]}),
        );
        let err = apply_plan_file(&ws.theme(), &mismatch, &ws.config(), Some(&ws.runs()))
            .expect_err("mismatch");
        assert!(err.downcast_ref::<ApplyError>().is_some());
        let run_dir = ws.only_run_dir().expect("run dir");
        let record: Value =
            serde_json::from_str(&fs::read_to_string(run_dir.join(ERROR_FILE)).expect("read"))
                .expect("json");
        assert_eq!(record["kind"], "apply");
        assert_eq!(
            ws.read_theme_file("sections/header.liquid").expect("header"),
            HEADER_SECTION
        );
    }

    #[test]
    fn baseline_show_is_empty_until_regenerated() {
        let ws = TestWorkspace::new().expect("workspace");
        let shown = baseline_command(&ws.theme(), &ws.runs(), &ws.config(), false).expect("show");
        assert!(shown.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn baseline_regenerate_counts_checker_output() {
        let ws = TestWorkspace::new().expect("workspace");
        let mut cfg = ws.config();
        cfg.commands.allowed_prefixes = vec![vec!["sh".to_string()]];
        cfg.verify.checker = vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf '[error] a\\n[warning] b\\n[warning] c\\n'".to_string(),
        ];
        let baseline = baseline_command(&ws.theme(), &ws.runs(), &cfg, true)
            .expect("regenerate")
            .expect("baseline");
        assert_eq!(baseline.counts.errors, 1);
        assert_eq!(baseline.counts.warnings, 2);
        let shown = baseline_command(&ws.theme(), &ws.runs(), &cfg, false).expect("show");
        assert_eq!(shown, Some(baseline));
    }
}
