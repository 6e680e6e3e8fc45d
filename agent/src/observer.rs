//! Run progress notifications.
//!
//! The orchestration core reports progress through an injected [`RunObserver`]
//! instead of printing. [`TracingObserver`] forwards to `tracing`; tests use a
//! recording observer from `test_support`.

use std::path::Path;

use tracing::{info, warn};

use crate::core::decision::Decision;
use crate::core::types::ToolCallResult;

pub trait RunObserver {
    fn on_iteration(&self, iteration: u32, max_iters: u32);
    fn on_tool_call(&self, name: &str, result: &ToolCallResult);
    fn on_decision(&self, iteration: u32, decision: &Decision);
    fn on_paused(&self, admin_steps: &Path);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn on_iteration(&self, iteration: u32, max_iters: u32) {
        info!(iteration, max_iters, "iteration started");
    }

    fn on_tool_call(&self, name: &str, result: &ToolCallResult) {
        match &result.error {
            None => info!(tool = %name, "tool call ok"),
            Some(err) => warn!(tool = %name, err = %err, "tool call failed"),
        }
    }

    fn on_decision(&self, iteration: u32, decision: &Decision) {
        info!(iteration, status = decision.status(), "decision");
    }

    fn on_paused(&self, admin_steps: &Path) {
        info!(admin_steps = %admin_steps.display(), "waiting for human to apply admin steps");
    }
}
