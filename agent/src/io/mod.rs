//! Side-effecting capabilities: processes, files, model and bridge I/O.

pub mod artifacts;
pub mod baseline;
pub mod config;
pub mod human_gate;
pub mod llm;
pub mod patch;
pub mod preview;
pub mod prompt;
pub mod protocol;
pub mod run_log;
pub mod sandbox;
pub mod summary;
pub mod task;
pub mod verify;
pub mod workspace_fs;
