//! Workspace file tools backed by [`ScopedFileSystem`] and the command sandbox.

use std::path::Path;

use anyhow::Result;
use serde_json::{Value, json};

use crate::core::types::ToolSpec;
use crate::io::sandbox::CommandSandbox;
use crate::io::workspace_fs::ScopedFileSystem;
use crate::tools::{SessionState, ToolHandler, str_arg, string_args_schema, truncate_chars};

pub const DEFAULT_LIST_GLOB: &str = "**/*";

pub struct ReadFile<'a> {
    pub fs: &'a ScopedFileSystem,
}

impl ToolHandler for ReadFile<'_> {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "workspace_read_file",
            "Read a theme file as text (workspace-root scoped).",
            string_args_schema(&["path"], &["path"]),
        )
    }

    fn call(&self, args: &Value, _state: &mut SessionState) -> Result<Value> {
        let path = str_arg(args, "path")?;
        let content = self.fs.read(path)?;
        Ok(json!({ "content": content }))
    }
}

pub struct WriteFile<'a> {
    pub fs: &'a ScopedFileSystem,
}

impl ToolHandler for WriteFile<'_> {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "workspace_write_file",
            "Write a theme file as text (workspace-root scoped). Prefer plan_apply for edits.",
            string_args_schema(&["path", "content"], &["path", "content"]),
        )
    }

    fn call(&self, args: &Value, state: &mut SessionState) -> Result<Value> {
        let path = str_arg(args, "path")?;
        let content = str_arg(args, "content")?;
        let existed = self.fs.exists(path)?;
        let rel = self.fs.write(path, content)?;
        state.record_change(&rel, !existed);
        Ok(json!({ "path": rel, "created": !existed }))
    }
}

pub struct ListFiles<'a> {
    pub fs: &'a ScopedFileSystem,
}

impl ToolHandler for ListFiles<'_> {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "workspace_list_files",
            "List theme files whose workspace-relative path matches a glob (default **/*).",
            string_args_schema(&["glob"], &[]),
        )
    }

    fn call(&self, args: &Value, _state: &mut SessionState) -> Result<Value> {
        let pattern = args
            .get("glob")
            .and_then(Value::as_str)
            .filter(|g| !g.trim().is_empty())
            .unwrap_or(DEFAULT_LIST_GLOB);
        let files = self.fs.list(pattern)?;
        Ok(json!({ "files": files }))
    }
}

pub struct Search<'a> {
    pub fs: &'a ScopedFileSystem,
    pub sandbox: &'a CommandSandbox,
    pub output_limit_chars: usize,
}

impl ToolHandler for Search<'_> {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "workspace_search",
            "Ripgrep search across theme files. Returns matching lines with line numbers.",
            string_args_schema(&["pattern"], &["pattern"]),
        )
    }

    fn call(&self, args: &Value, _state: &mut SessionState) -> Result<Value> {
        let pattern = str_arg(args, "pattern")?;
        let root = self.fs.root();
        let argv = search_argv(pattern, root);
        let result = self.sandbox.execute(&argv, root)?;
        Ok(json!({
            "stdout": truncate_chars(&result.stdout, self.output_limit_chars),
            "stderr": truncate_chars(&result.stderr, self.output_limit_chars),
            "returncode": result.exit_code,
        }))
    }
}

/// The pattern is only ever an `-e` value and `--` ends option parsing, so
/// model input cannot become an rg flag such as `--pre`.
fn search_argv(pattern: &str, root: &Path) -> Vec<String> {
    vec![
        "rg".to_string(),
        "-n".to_string(),
        "--hidden".to_string(),
        "--no-heading".to_string(),
        "-e".to_string(),
        pattern.to_string(),
        "--".to_string(),
        root.to_string_lossy().into_owned(),
    ]
}
