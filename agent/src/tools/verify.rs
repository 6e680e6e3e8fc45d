//! `verify_run`: static checker plus optional browser verification.

use std::path::Path;

use anyhow::Result;
use serde_json::{Value, json};

use crate::core::types::ToolSpec;
use crate::io::artifacts::ArtifactStore;
use crate::io::baseline::BaselineStore;
use crate::io::sandbox::CommandSandbox;
use crate::io::verify::{Verifier, VerifySettings};
use crate::tools::{SessionState, ToolHandler};

pub struct VerifyRun<'a> {
    pub sandbox: &'a CommandSandbox,
    pub workspace_root: &'a Path,
    pub artifacts: &'a ArtifactStore,
    pub baselines: &'a BaselineStore,
    pub settings: VerifySettings,
}

impl ToolHandler for VerifyRun<'_> {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "verify_run",
            "Run verification: theme checker against the workspace baseline and, when a preview \
             is available, the browser verifier. Returns summaries and ok flags.",
            json!({ "type": "object", "properties": {} }),
        )
    }

    fn call(&self, _args: &Value, state: &mut SessionState) -> Result<Value> {
        let result = Verifier::new(
            self.sandbox,
            self.workspace_root,
            self.artifacts,
            self.baselines,
            self.settings.clone(),
        )
        .run()?;
        let value = serde_json::to_value(&result)?;
        state.last_verify = Some(result);
        Ok(json!({ "verify": value }))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn records_last_verify() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifacts = ArtifactStore::new(&temp.path().join("run")).expect("artifacts");
        let baselines = BaselineStore::under_runs_dir(temp.path());
        let sandbox = CommandSandbox::new(vec![vec!["sh".to_string()]], Duration::from_secs(5), 10_000);
        let tool = VerifyRun {
            sandbox: &sandbox,
            workspace_root: temp.path(),
            artifacts: &artifacts,
            baselines: &baselines,
            settings: VerifySettings {
                checker: vec!["sh".to_string(), "-c".to_string(), "echo '[warning] x'".to_string()],
                browser: Vec::new(),
                run_checker: true,
                run_browser: false,
                base_url: None,
                routes: Vec::new(),
                asserts_path: None,
                checker_timeout: Duration::from_secs(5),
                browser_timeout: Duration::from_secs(5),
            },
        };
        let mut state = SessionState::default();
        let out = tool.call(&json!({}), &mut state).expect("verify");
        assert_eq!(out["verify"]["ok"], true);
        assert!(state.last_verify.as_ref().is_some_and(|v| v.checker.ran));
    }
}
