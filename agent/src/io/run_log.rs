//! Run directory layout and the JSON records written into it.
//!
//! These files are product output: they are always written, independent of
//! `RUST_LOG`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::io::patch::AppliedOp;
use crate::io::verify::VerifyResult;

pub const RUN_SUMMARY_FILE: &str = "run.json";
pub const ERROR_FILE: &str = "error.json";
pub const ADMIN_STEPS_FILE: &str = "admin_steps.md";
pub const WORKSPACE_SUMMARY_FILE: &str = "workspace_summary.json";

/// `YYYYmmdd_HHMMSS_<8 hex>` in local time.
pub fn new_run_id() -> String {
    let suffix: u32 = rand::thread_rng().r#gen();
    format!("{}_{suffix:08x}", Local::now().format("%Y%m%d_%H%M%S"))
}

/// Create `<runs_dir>/<run_id>` and return both.
pub fn create_run_dir(runs_dir: &Path) -> Result<(String, PathBuf)> {
    let run_id = new_run_id();
    let dir = runs_dir.join(&run_id);
    std::fs::create_dir_all(&dir).with_context(|| format!("create run dir {}", dir.display()))?;
    debug!(run_id = %run_id, dir = %dir.display(), "run directory created");
    Ok((run_id, dir))
}

pub fn decision_file_name(iteration: u32) -> String {
    format!("iter_{iteration:02}_decision.json")
}

pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Done,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
        }
    }
}

/// `error.json`: the fatal condition that ended the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_type: Option<String>,
    pub changed_files: Vec<String>,
    pub created_files: Vec<String>,
    pub applied_ops: Vec<AppliedOp>,
    pub at: String,
}

/// `iter_NN_decision.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord<'a> {
    pub iteration: u32,
    pub status: &'a str,
    pub decision: &'a Value,
}

/// `run.json`, written once when the run ends.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub workspace: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub iterations: u32,
    pub changed_files: Vec<String>,
    pub created_files: Vec<String>,
    pub last_verify: Option<VerifyResult>,
    pub started_at: String,
    pub finished_at: String,
}
