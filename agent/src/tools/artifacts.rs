//! Run-artifact tools. Write-only; never touch the workspace.

use anyhow::Result;
use serde_json::{Value, json};

use crate::core::types::ToolSpec;
use crate::io::artifacts::ArtifactStore;
use crate::tools::{SessionState, ToolHandler, str_arg, string_args_schema};

pub struct WriteText<'a> {
    pub artifacts: &'a ArtifactStore,
}

impl ToolHandler for WriteText<'_> {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "artifacts_write_text",
            "Write a text artifact into the run artifacts directory.",
            string_args_schema(&["path", "content"], &["path", "content"]),
        )
    }

    fn call(&self, args: &Value, _state: &mut SessionState) -> Result<Value> {
        let path = self
            .artifacts
            .write_text(str_arg(args, "path")?, str_arg(args, "content")?)?;
        Ok(json!({ "path": path.display().to_string() }))
    }
}

pub struct WriteBase64<'a> {
    pub artifacts: &'a ArtifactStore,
}

impl ToolHandler for WriteBase64<'_> {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "artifacts_write_base64",
            "Write a base64-encoded binary artifact into the run artifacts directory.",
            string_args_schema(&["path", "base64"], &["path", "base64"]),
        )
    }

    fn call(&self, args: &Value, _state: &mut SessionState) -> Result<Value> {
        let path = self
            .artifacts
            .write_base64(str_arg(args, "path")?, str_arg(args, "base64")?)?;
        Ok(json!({ "path": path.display().to_string() }))
    }
}
