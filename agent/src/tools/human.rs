//! `human_pause_for_admin_updates`: block until a human applies admin-only steps.

use anyhow::{Result, bail};
use serde_json::{Value, json};
use tracing::info;

use crate::core::types::ToolSpec;
use crate::io::artifacts::ArtifactStore;
use crate::io::human_gate::HumanGate;
use crate::io::run_log::ADMIN_STEPS_FILE;
use crate::tools::{SessionState, ToolHandler, str_arg, string_args_schema};

pub struct PauseForAdmin<'a> {
    pub gate: &'a HumanGate,
    pub artifacts: &'a ArtifactStore,
}

impl ToolHandler for PauseForAdmin<'_> {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "human_pause_for_admin_updates",
            "Pause and wait for a human to apply Shopify-admin-only steps, then continue.",
            string_args_schema(&["admin_steps"], &["admin_steps"]),
        )
    }

    fn call(&self, args: &Value, _state: &mut SessionState) -> Result<Value> {
        let steps = str_arg(args, "admin_steps")?.trim();
        if steps.is_empty() {
            bail!("admin_steps is required");
        }
        let path = self.artifacts.write_text(ADMIN_STEPS_FILE, steps)?;
        info!(steps = %path.display(), "paused for admin updates");
        let notes = self.gate.wait_for_resume()?;
        Ok(json!({ "resumed": true, "notes": notes }))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use super::*;

    #[test]
    fn writes_steps_and_returns_human_notes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifacts = ArtifactStore::new(&temp.path().join("run")).expect("artifacts");
        let signal = temp.path().join("continue.txt");
        fs::write(&signal, "continue\nlogo uploaded").expect("signal");
        let gate = HumanGate::new(signal, "continue", Duration::from_millis(5));

        let out = PauseForAdmin { gate: &gate, artifacts: &artifacts }
            .call(&json!({"admin_steps": " Upload the logo. "}), &mut SessionState::default())
            .expect("pause");
        assert_eq!(out["notes"], "logo uploaded");
        assert_eq!(
            fs::read_to_string(artifacts.root().join(ADMIN_STEPS_FILE)).expect("read"),
            "Upload the logo."
        );
    }

    #[test]
    fn blank_steps_fail_without_waiting() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifacts = ArtifactStore::new(temp.path()).expect("artifacts");
        let gate = HumanGate::new(temp.path().join("never.txt"), "continue", Duration::from_secs(60));
        assert!(
            PauseForAdmin { gate: &gate, artifacts: &artifacts }
                .call(&json!({"admin_steps": "   "}), &mut SessionState::default())
                .is_err()
        );
    }
}
