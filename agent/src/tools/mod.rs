//! Tool registration table and dispatch boundary.
//!
//! Every tool the model can call is a [`ToolHandler`] registered by name in a
//! [`ToolRegistry`]. Dispatch validates arguments against the handler's JSON
//! Schema, runs the handler, and converts every failure into a structured
//! [`ToolCallResult`] so one bad call never ends the session. Plan validation
//! and apply failures are additionally recorded as a [`FatalCondition`], which
//! ends the round and the run.

pub mod artifacts;
pub mod bridge;
pub mod human;
pub mod plan;
pub mod verify;
pub mod workspace;

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use anyhow::{Result, bail};
use jsonschema::{Draft, Validator};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::path::ScopeError;
use crate::core::plan::PlanError;
use crate::core::types::{ToolCall, ToolCallResult, ToolSpec};
use crate::io::patch::{AppliedOp, ApplyError, ApplyReport};
use crate::io::protocol::ProtocolError;
use crate::io::sandbox::{CommandNotAllowed, CommandTimedOut};
use crate::io::verify::VerifyResult;

/// One callable capability.
pub trait ToolHandler {
    fn spec(&self) -> ToolSpec;
    /// Run the tool with schema-valid `args`.
    fn call(&self, args: &Value, state: &mut SessionState) -> Result<Value>;
}

/// A tool failure that ends the run instead of being handed back to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalCondition {
    Plan(PlanError),
    Apply(ApplyError),
}

impl FatalCondition {
    pub fn kind(&self) -> &'static str {
        match self {
            FatalCondition::Plan(_) => "plan",
            FatalCondition::Apply(_) => "apply",
        }
    }

    pub fn message(&self) -> String {
        match self {
            FatalCondition::Plan(err) => err.to_string(),
            FatalCondition::Apply(err) => err.to_string(),
        }
    }

    pub fn op_index(&self) -> Option<usize> {
        match self {
            FatalCondition::Plan(err) => err.op_index(),
            FatalCondition::Apply(err) => Some(err.index),
        }
    }

    pub fn op_type(&self) -> Option<&str> {
        match self {
            FatalCondition::Plan(_) => None,
            FatalCondition::Apply(err) => Some(&err.kind),
        }
    }
}

/// Mutable state shared by all tool calls of one run.
#[derive(Debug, Default)]
pub struct SessionState {
    pub changed_files: Vec<String>,
    pub created_files: Vec<String>,
    pub applied_ops: Vec<AppliedOp>,
    pub last_verify: Option<VerifyResult>,
    pub fatal: Option<FatalCondition>,
}

impl SessionState {
    /// Merge an apply report, keeping first-change order and no duplicates.
    pub fn record_apply(&mut self, report: &ApplyReport) {
        for path in &report.changed_files {
            self.record_change(path, report.created_files.contains(path));
        }
        self.applied_ops.extend(report.applied_ops.iter().cloned());
    }

    pub fn record_change(&mut self, path: &str, created: bool) {
        if created && !self.created_files.iter().any(|p| p == path) {
            self.created_files.push(path.to_string());
        }
        if !self.changed_files.iter().any(|p| p == path) {
            self.changed_files.push(path.to_string());
        }
    }
}

struct Entry<'a> {
    spec: ToolSpec,
    validator: Validator,
    handler: Box<dyn ToolHandler + 'a>,
}

/// Name-to-handler table. Registration order is the order tools are offered.
pub struct ToolRegistry<'a> {
    entries: Vec<Entry<'a>>,
    index: HashMap<String, usize>,
}

impl<'a> ToolRegistry<'a> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: impl ToolHandler + 'a) -> Result<()> {
        let spec = handler.spec();
        if self.index.contains_key(&spec.name) {
            bail!("tool {} registered twice", spec.name);
        }
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&spec.parameters)
            .map_err(|e| anyhow::anyhow!("compile schema for tool {}: {e}", spec.name))?;
        self.index.insert(spec.name.clone(), self.entries.len());
        self.entries.push(Entry {
            spec,
            validator,
            handler: Box::new(handler),
        });
        Ok(())
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.entries.iter().map(|e| e.spec.clone()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.spec.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run one tool call. Never fails: every problem becomes a failure result.
    pub fn dispatch(&self, call: &ToolCall, state: &mut SessionState) -> ToolCallResult {
        let name = call.name();
        let Some(entry) = self.index.get(name).map(|&i| &self.entries[i]) else {
            warn!(tool = %name, "unknown tool requested");
            return ToolCallResult::failure(format!("Unknown tool: {name}"));
        };

        let args = call.parsed_arguments();
        let violations: Vec<String> = entry
            .validator
            .iter_errors(&args)
            .map(|e| e.to_string())
            .collect();
        if !violations.is_empty() {
            debug!(tool = %name, violations = violations.len(), "tool arguments rejected");
            return ToolCallResult::failure(format!(
                "invalid arguments for {name}: {}",
                violations.join("; ")
            ));
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry.handler.call(&args, state)));
        match outcome {
            Ok(Ok(value)) => ToolCallResult::success(value),
            Ok(Err(err)) => {
                if let Some(plan_err) = err.downcast_ref::<PlanError>() {
                    state.fatal = Some(FatalCondition::Plan(plan_err.clone()));
                } else if let Some(apply_err) = err.downcast_ref::<ApplyError>() {
                    state.record_apply(&apply_err.partial);
                    state.fatal = Some(FatalCondition::Apply(apply_err.clone()));
                }
                warn!(tool = %name, err = %format!("{err:#}"), "tool call failed");
                ToolCallResult::failure(format!("{}: {err:#}", error_label(&err)))
            }
            Err(payload) => {
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(tool = %name, detail = %detail, "tool handler panicked");
                ToolCallResult::failure(format!("InternalError: tool {name} panicked: {detail}"))
            }
        }
    }
}

impl Default for ToolRegistry<'_> {
    fn default() -> Self {
        Self::new()
    }
}

fn error_label(err: &anyhow::Error) -> &'static str {
    if err.downcast_ref::<ScopeError>().is_some() {
        "ScopeError"
    } else if err.downcast_ref::<CommandNotAllowed>().is_some() {
        "CommandNotAllowed"
    } else if err.downcast_ref::<CommandTimedOut>().is_some() {
        "CommandTimedOut"
    } else if err.downcast_ref::<ProtocolError>().is_some() {
        "ProtocolError"
    } else if err.downcast_ref::<PlanError>().is_some() {
        "PlanError"
    } else if err.downcast_ref::<ApplyError>().is_some() {
        "ApplyError"
    } else {
        "Error"
    }
}

/// At most `limit` characters of `text`.
pub(crate) fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

/// JSON Schema for an object with string properties, all listed ones required.
pub(crate) fn string_args_schema(props: &[&str], required: &[&str]) -> Value {
    let properties: serde_json::Map<String, Value> = props
        .iter()
        .map(|p| (p.to_string(), serde_json::json!({ "type": "string" })))
        .collect();
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Required string argument; schema validation has already checked presence.
pub(crate) fn str_arg<'v>(args: &'v Value, key: &str) -> Result<&'v str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("{key} is required"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Echo;

    impl ToolHandler for Echo {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("echo", "Echo the text", string_args_schema(&["text"], &["text"]))
        }

        fn call(&self, args: &Value, _state: &mut SessionState) -> Result<Value> {
            let text = str_arg(args, "text")?;
            if text == "boom" {
                panic!("exploded");
            }
            if text == "scope" {
                return Err(ScopeError::Traversal {
                    path: "../x".to_string(),
                }
                .into());
            }
            if text == "plan" {
                return Err(PlanError::MissingOps.into());
            }
            Ok(json!({ "text": text }))
        }
    }

    fn registry() -> ToolRegistry<'static> {
        let mut registry = ToolRegistry::new();
        registry.register(Echo).expect("register");
        registry
    }

    fn call(args: Value) -> ToolCall {
        ToolCall::new("call_1", "echo", &args)
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = registry();
        let err = registry.register(Echo).expect_err("duplicate");
        assert!(err.to_string().contains("registered twice"));
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[test]
    fn success_wraps_handler_value() {
        let mut state = SessionState::default();
        let result = registry().dispatch(&call(json!({"text": "hi"})), &mut state);
        assert!(result.ok);
        assert_eq!(result.result, Some(json!({"text": "hi"})));
    }

    #[test]
    fn unknown_tool_is_a_structured_failure() {
        let mut state = SessionState::default();
        let result = registry().dispatch(&ToolCall::new("c", "theme.read_file", &json!({})), &mut state);
        assert!(!result.ok);
        assert_eq!(result.error.as_deref(), Some("Unknown tool: theme.read_file"));
    }

    #[test]
    fn schema_violations_do_not_reach_the_handler() {
        let mut state = SessionState::default();
        let registry = registry();
        let missing = registry.dispatch(&call(json!({})), &mut state);
        assert!(!missing.ok);
        assert!(missing.error.unwrap_or_default().contains("invalid arguments for echo"));

        let raw = ToolCall {
            id: "c".to_string(),
            kind: "function".to_string(),
            function: crate::core::types::FunctionCall {
                name: "echo".to_string(),
                arguments: Value::String("{not json".to_string()),
            },
        };
        assert!(!registry.dispatch(&raw, &mut state).ok);
    }

    #[test]
    fn recoverable_errors_are_labelled() {
        let mut state = SessionState::default();
        let result = registry().dispatch(&call(json!({"text": "scope"})), &mut state);
        assert!(!result.ok);
        assert!(result.error.unwrap_or_default().starts_with("ScopeError: "));
        assert!(state.fatal.is_none());
    }

    #[test]
    fn plan_errors_become_fatal() {
        let mut state = SessionState::default();
        let result = registry().dispatch(&call(json!({"text": "plan"})), &mut state);
        assert!(!result.ok);
        assert_eq!(state.fatal, Some(FatalCondition::Plan(PlanError::MissingOps)));
    }

    #[test]
    fn panics_are_contained() {
        let mut state = SessionState::default();
        let result = registry().dispatch(&call(json!({"text": "boom"})), &mut state);
        assert!(!result.ok);
        assert!(result.error.unwrap_or_default().contains("exploded"));
    }

    #[test]
    fn record_apply_deduplicates() {
        let mut state = SessionState::default();
        state.record_change("sections/a.liquid", false);
        state.record_apply(&ApplyReport {
            changed_files: vec!["sections/a.liquid".to_string(), "snippets/b.liquid".to_string()],
            created_files: vec!["snippets/b.liquid".to_string()],
            applied_ops: Vec::new(),
        });
        assert_eq!(state.changed_files, vec!["sections/a.liquid", "snippets/b.liquid"]);
        assert_eq!(state.created_files, vec!["snippets/b.liquid"]);
    }

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
