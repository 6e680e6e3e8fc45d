//! `plan_apply`: validate an edit plan, then apply it through the patch engine.

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::info;

use crate::core::plan::PlanValidator;
use crate::core::types::ToolSpec;
use crate::io::patch::PatchEngine;
use crate::io::workspace_fs::ScopedFileSystem;
use crate::tools::{SessionState, ToolHandler};

pub struct PlanApply<'a> {
    pub validator: &'a PlanValidator,
    pub fs: &'a ScopedFileSystem,
}

impl ToolHandler for PlanApply<'_> {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "plan_apply",
            "Validate and apply an edit plan: {ops: [...], justification: {new_files}}. \
             Invalid plans and failed preconditions end the run.",
            json!({
                "type": "object",
                "properties": {
                    "plan": {
                        "type": "object",
                        "properties": {
                            "ops": { "type": "array" },
                            "justification": { "type": "object" }
                        },
                        "required": ["ops"]
                    }
                },
                "required": ["plan"]
            }),
        )
    }

    fn call(&self, args: &Value, state: &mut SessionState) -> Result<Value> {
        let raw = args.get("plan").context("plan is required")?;
        let plan = self.validator.validate(raw)?;
        let report = PatchEngine::new(self.fs).apply_plan(&plan)?;
        state.record_apply(&report);
        info!(
            ops = plan.ops.len(),
            changed = report.changed_files.len(),
            created = report.created_files.len(),
            "plan applied"
        );
        Ok(json!({
            "applied_ops": report.applied_ops,
            "changed_files": report.changed_files,
            "created_files": report.created_files,
        }))
    }
}
