//! Edit plan model and validation.
//!
//! A plan arrives from the model as raw JSON. [`PlanValidator::validate`] checks
//! it against the [`PlanPolicy`] before anything touches the workspace and
//! returns both the typed operations and the original document with every path
//! rewritten to its normalized form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::diff::parse_unified_diff;
use crate::core::path::{extension, has_traversal, normalize_rel_path, top_level_dir};

/// Plan-level limits and path policy (`[plan]` in the config file).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlanPolicy {
    pub max_ops: usize,
    pub max_creates: usize,
    /// Budget, in characters, for all content, replacement and patch text in one plan.
    pub max_total_written_chars: usize,
    /// Minimum trimmed length of `justification.new_files` when a plan creates files.
    pub min_justification_chars: usize,
    pub disallowed_prefixes: Vec<String>,
    pub disallowed_paths: Vec<String>,
    /// Extensions `create_file` may use, keyed by top-level directory.
    pub create_extensions: BTreeMap<String, Vec<String>>,
}

impl Default for PlanPolicy {
    fn default() -> Self {
        let exts = |list: &[&str]| list.iter().map(|e| e.to_string()).collect::<Vec<_>>();
        let mut create_extensions = BTreeMap::new();
        for dir in ["sections", "snippets", "blocks", "layout"] {
            create_extensions.insert(dir.to_string(), exts(&[".liquid"]));
        }
        create_extensions.insert("templates".to_string(), exts(&[".json", ".liquid"]));
        create_extensions.insert(
            "assets".to_string(),
            exts(&[".js", ".css", ".json", ".woff", ".woff2"]),
        );
        create_extensions.insert("config".to_string(), exts(&[".json"]));
        create_extensions.insert("locales".to_string(), exts(&[".json"]));

        Self {
            max_ops: 30,
            max_creates: 12,
            max_total_written_chars: 250_000,
            min_justification_chars: 120,
            disallowed_prefixes: exts(&[".git/", ".github/", ".cursor/", ".vscode/"]),
            disallowed_paths: exts(&["config/settings_data.json"]),
            create_extensions,
        }
    }
}

/// Structural or policy violation in a proposed plan. Fatal for the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("plan must be a JSON object")]
    NotAnObject,
    #[error("plan must include a non-empty 'ops' list")]
    MissingOps,
    #[error("plan has too many ops ({count} > {max})")]
    TooManyOps { count: usize, max: usize },
    #[error("op #{index} must be an object")]
    OpNotObject { index: usize },
    #[error("op #{index} has unsupported type '{kind}'")]
    UnsupportedType { index: usize, kind: String },
    #[error("op #{index} is missing a valid '{field}'")]
    MissingField { index: usize, field: &'static str },
    #[error("op #{index} targets a disallowed path: {path}")]
    PathNotAllowed { index: usize, path: String },
    #[error("op #{index}: create_file is not allowed under '{dir}'")]
    CreateDirNotAllowed { index: usize, dir: String },
    #[error("op #{index}: create_file extension '{ext}' is not allowed under '{dir}'")]
    CreateExtNotAllowed {
        index: usize,
        dir: String,
        ext: String,
    },
    #[error("op #{index}: expected_anchor_count must be a positive integer")]
    BadAnchorCount { index: usize },
    #[error("op #{index}: malformed patch: {reason}")]
    MalformedPatch { index: usize, reason: String },
    #[error("plan creates too many files ({count} > {max})")]
    TooManyCreates { count: usize, max: usize },
    #[error("plan writes too much content ({total} chars > {max})")]
    TooMuchContent { total: usize, max: usize },
    #[error(
        "plan creates files but 'justification.new_files' is missing or shorter than {min} characters"
    )]
    MissingJustification { min: usize },
}

impl PlanError {
    /// Index of the offending op, for errors about a single op.
    pub fn op_index(&self) -> Option<usize> {
        match self {
            Self::OpNotObject { index }
            | Self::UnsupportedType { index, .. }
            | Self::MissingField { index, .. }
            | Self::PathNotAllowed { index, .. }
            | Self::CreateDirNotAllowed { index, .. }
            | Self::CreateExtNotAllowed { index, .. }
            | Self::BadAnchorCount { index }
            | Self::MalformedPatch { index, .. } => Some(*index),
            Self::NotAnObject
            | Self::MissingOps
            | Self::TooManyOps { .. }
            | Self::TooManyCreates { .. }
            | Self::TooMuchContent { .. }
            | Self::MissingJustification { .. } => None,
        }
    }
}

/// A validated edit operation. Paths are normalized workspace-relative paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    CreateFile {
        path: String,
        content: String,
    },
    InsertAfter {
        path: String,
        anchor: String,
        content: String,
        expected_anchor_count: usize,
    },
    InsertBefore {
        path: String,
        anchor: String,
        content: String,
        expected_anchor_count: usize,
    },
    ReplaceOnce {
        path: String,
        anchor: String,
        replacement: String,
        expected_anchor_count: usize,
    },
    ApplyPatch {
        patch_text: String,
    },
}

impl Op {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateFile { .. } => "create_file",
            Self::InsertAfter { .. } => "insert_after",
            Self::InsertBefore { .. } => "insert_before",
            Self::ReplaceOnce { .. } => "replace_once",
            Self::ApplyPatch { .. } => "apply_patch",
        }
    }

    /// Target path for single-file ops; patches name their targets inside the diff.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::CreateFile { path, .. }
            | Self::InsertAfter { path, .. }
            | Self::InsertBefore { path, .. }
            | Self::ReplaceOnce { path, .. } => Some(path),
            Self::ApplyPatch { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPlan {
    pub ops: Vec<Op>,
    /// The submitted document with normalized paths; all other fields untouched.
    pub normalized: Value,
}

#[derive(Debug, Clone)]
pub struct PlanValidator {
    policy: PlanPolicy,
    allowed_dirs: Vec<String>,
}

impl PlanValidator {
    pub fn new(policy: PlanPolicy, allowed_dirs: Vec<String>) -> Self {
        Self {
            policy,
            allowed_dirs,
        }
    }

    pub fn validate(&self, raw: &Value) -> Result<ValidatedPlan, PlanError> {
        let plan = raw.as_object().ok_or(PlanError::NotAnObject)?;
        let raw_ops = match plan.get("ops").and_then(Value::as_array) {
            Some(ops) if !ops.is_empty() => ops,
            _ => return Err(PlanError::MissingOps),
        };
        if raw_ops.len() > self.policy.max_ops {
            return Err(PlanError::TooManyOps {
                count: raw_ops.len(),
                max: self.policy.max_ops,
            });
        }

        let mut ops = Vec::with_capacity(raw_ops.len());
        let mut normalized_ops = Vec::with_capacity(raw_ops.len());
        let mut creates = 0usize;
        let mut written = 0usize;

        for (index, raw_op) in raw_ops.iter().enumerate() {
            let fields = raw_op
                .as_object()
                .ok_or(PlanError::OpNotObject { index })?;
            let kind = fields.get("type").and_then(Value::as_str).unwrap_or_default();

            let op = match kind {
                "create_file" => {
                    let path = self.checked_path(index, fields)?;
                    self.check_create(index, &path)?;
                    creates += 1;
                    let content = text_field(fields, index, "content", true)?;
                    written += content.chars().count();
                    Op::CreateFile { path, content }
                }
                "insert_after" | "insert_before" => {
                    let path = self.checked_path(index, fields)?;
                    let anchor = text_field(fields, index, "anchor", false)?;
                    let content = text_field(fields, index, "content", true)?;
                    written += content.chars().count();
                    let expected_anchor_count = anchor_count(fields, index)?;
                    if kind == "insert_after" {
                        Op::InsertAfter {
                            path,
                            anchor,
                            content,
                            expected_anchor_count,
                        }
                    } else {
                        Op::InsertBefore {
                            path,
                            anchor,
                            content,
                            expected_anchor_count,
                        }
                    }
                }
                "replace_once" => {
                    let path = self.checked_path(index, fields)?;
                    let anchor = text_field(fields, index, "anchor", false)?;
                    let replacement = text_field(fields, index, "replacement", true)?;
                    written += replacement.chars().count();
                    let expected_anchor_count = anchor_count(fields, index)?;
                    Op::ReplaceOnce {
                        path,
                        anchor,
                        replacement,
                        expected_anchor_count,
                    }
                }
                "apply_patch" => {
                    let patch_text = text_field(fields, index, "patch_text", false)?;
                    self.check_patch_targets(index, &patch_text)?;
                    written += patch_text.chars().count();
                    Op::ApplyPatch { patch_text }
                }
                other => {
                    return Err(PlanError::UnsupportedType {
                        index,
                        kind: other.to_string(),
                    });
                }
            };

            let mut normalized_op = fields.clone();
            if let Some(path) = op.path() {
                normalized_op.insert("path".to_string(), Value::String(path.to_string()));
            }
            normalized_ops.push(Value::Object(normalized_op));
            ops.push(op);
        }

        if creates > self.policy.max_creates {
            return Err(PlanError::TooManyCreates {
                count: creates,
                max: self.policy.max_creates,
            });
        }
        if written > self.policy.max_total_written_chars {
            return Err(PlanError::TooMuchContent {
                total: written,
                max: self.policy.max_total_written_chars,
            });
        }
        if creates > 0 && !self.has_justification(plan) {
            return Err(PlanError::MissingJustification {
                min: self.policy.min_justification_chars,
            });
        }

        let mut normalized = plan.clone();
        normalized.insert("ops".to_string(), Value::Array(normalized_ops));
        Ok(ValidatedPlan {
            ops,
            normalized: Value::Object(normalized),
        })
    }

    /// Whether a normalized relative path is a location plans may edit.
    pub fn is_allowed_path(&self, rel: &str) -> bool {
        if rel.is_empty() || has_traversal(rel) {
            return false;
        }
        if self.policy.disallowed_paths.iter().any(|p| p == rel) {
            return false;
        }
        if self
            .policy
            .disallowed_prefixes
            .iter()
            .any(|prefix| rel.starts_with(prefix.as_str()))
        {
            return false;
        }
        let top = top_level_dir(rel);
        rel.contains('/') && self.allowed_dirs.iter().any(|dir| dir == top)
    }

    fn checked_path(&self, index: usize, fields: &Map<String, Value>) -> Result<String, PlanError> {
        let raw = fields
            .get("path")
            .and_then(Value::as_str)
            .filter(|p| !p.trim().is_empty())
            .ok_or(PlanError::MissingField {
                index,
                field: "path",
            })?;
        let rel = normalize_rel_path(raw);
        if !self.is_allowed_path(&rel) {
            return Err(PlanError::PathNotAllowed {
                index,
                path: raw.to_string(),
            });
        }
        Ok(rel)
    }

    fn check_create(&self, index: usize, rel: &str) -> Result<(), PlanError> {
        let dir = top_level_dir(rel);
        let allowed = self
            .policy
            .create_extensions
            .get(dir)
            .ok_or_else(|| PlanError::CreateDirNotAllowed {
                index,
                dir: dir.to_string(),
            })?;
        let ext = extension(rel).unwrap_or_default();
        if !allowed.iter().any(|a| a.eq_ignore_ascii_case(&ext)) {
            return Err(PlanError::CreateExtNotAllowed {
                index,
                dir: dir.to_string(),
                ext,
            });
        }
        Ok(())
    }

    fn check_patch_targets(&self, index: usize, patch_text: &str) -> Result<(), PlanError> {
        let files = parse_unified_diff(patch_text).map_err(|err| PlanError::MalformedPatch {
            index,
            reason: err.to_string(),
        })?;
        if files.is_empty() {
            return Err(PlanError::MalformedPatch {
                index,
                reason: "no 'diff --git' sections found".to_string(),
            });
        }
        for file in &files {
            let rel = normalize_rel_path(&file.new_path);
            if !self.is_allowed_path(&rel) {
                return Err(PlanError::PathNotAllowed {
                    index,
                    path: file.new_path.clone(),
                });
            }
        }
        Ok(())
    }

    fn has_justification(&self, plan: &Map<String, Value>) -> bool {
        plan.get("justification")
            .and_then(|j| j.get("new_files"))
            .and_then(Value::as_str)
            .is_some_and(|text| text.trim().chars().count() >= self.policy.min_justification_chars)
    }
}

fn text_field(
    fields: &Map<String, Value>,
    index: usize,
    field: &'static str,
    allow_empty: bool,
) -> Result<String, PlanError> {
    match fields.get(field).and_then(Value::as_str) {
        Some(text) if allow_empty || !text.is_empty() => Ok(text.to_string()),
        _ => Err(PlanError::MissingField { index, field }),
    }
}

fn anchor_count(fields: &Map<String, Value>, index: usize) -> Result<usize, PlanError> {
    fields
        .get("expected_anchor_count")
        .and_then(Value::as_u64)
        .filter(|count| *count >= 1)
        .and_then(|count| usize::try_from(count).ok())
        .ok_or(PlanError::BadAnchorCount { index })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> PlanValidator {
        let dirs = [
            "sections",
            "snippets",
            "blocks",
            "templates",
            "layout",
            "assets",
            "config",
            "locales",
        ];
        PlanValidator::new(
            PlanPolicy::default(),
            dirs.iter().map(|d| d.to_string()).collect(),
        )
    }

    fn long_justification() -> String {
        "No existing section renders a comparison table, and extending the product grid would \
         couple unrelated settings, so a new dedicated section file is the smallest change."
            .to_string()
    }

    #[test]
    fn rejects_non_object_and_empty_ops() {
        let v = validator();
        assert_eq!(v.validate(&json!([])), Err(PlanError::NotAnObject));
        assert_eq!(v.validate(&json!({"ops": []})), Err(PlanError::MissingOps));
        assert_eq!(v.validate(&json!({})), Err(PlanError::MissingOps));
    }

    #[test]
    fn rejects_too_many_ops() {
        let op = json!({"type": "replace_once", "path": "sections/a.liquid", "anchor": "x",
            "replacement": "y", "expected_anchor_count": 1});
        let ops: Vec<Value> = (0..31).map(|_| op.clone()).collect();
        assert_eq!(
            validator().validate(&json!({ "ops": ops })),
            Err(PlanError::TooManyOps { count: 31, max: 30 })
        );
    }

    #[test]
    fn rejects_unsupported_type() {
        let err = validator()
            .validate(&json!({"ops": [{"type": "delete_file", "path": "sections/a.liquid"}]}))
            .expect_err("unsupported");
        assert!(matches!(err, PlanError::UnsupportedType { index: 0, .. }));
    }

    #[test]
    fn rejects_traversal_and_disallowed_locations() {
        let v = validator();
        for path in [
            "../../etc/passwd",
            "a/../../b",
            "sections/../../x.liquid",
            ".github/workflows/ci.yml",
            "config/settings_data.json",
            "node_modules/x.js",
            "sections",
        ] {
            let plan = json!({"ops": [{"type": "replace_once", "path": path, "anchor": "a",
                "replacement": "b", "expected_anchor_count": 1}]});
            assert!(
                matches!(v.validate(&plan), Err(PlanError::PathNotAllowed { .. })),
                "{path} should be rejected"
            );
        }
    }

    #[test]
    fn create_file_requires_allowed_extension_for_directory() {
        let plan = json!({
            "ops": [{"type": "create_file", "path": "sections/hero.js", "content": ""}],
            "justification": {"new_files": long_justification()},
        });
        assert!(matches!(
            validator().validate(&plan),
            Err(PlanError::CreateExtNotAllowed { .. })
        ));
    }

    #[test]
    fn create_file_requires_justification() {
        let mut plan = json!({
            "ops": [{"type": "create_file", "path": "sections/compare.liquid", "content": "<div></div>"}],
        });
        assert_eq!(
            validator().validate(&plan),
            Err(PlanError::MissingJustification { min: 120 })
        );

        plan["justification"] = json!({"new_files": "too short"});
        assert!(validator().validate(&plan).is_err());

        plan["justification"] = json!({"new_files": long_justification()});
        let validated = validator().validate(&plan).expect("valid");
        assert_eq!(validated.ops.len(), 1);
    }

    #[test]
    fn anchor_ops_require_positive_integer_count() {
        let v = validator();
        for count in [json!(0), json!(-1), json!(1.5), json!("1"), Value::Null] {
            let plan = json!({"ops": [{"type": "insert_after", "path": "sections/a.liquid",
                "anchor": "x", "content": "y", "expected_anchor_count": count}]});
            assert_eq!(v.validate(&plan), Err(PlanError::BadAnchorCount { index: 0 }));
        }
        let plan = json!({"ops": [{"type": "insert_after", "path": "sections/a.liquid",
            "anchor": "x", "content": "y"}]});
        assert_eq!(v.validate(&plan), Err(PlanError::BadAnchorCount { index: 0 }));
    }

    #[test]
    fn content_budget_counts_all_written_text() {
        let big = "x".repeat(200_000);
        let plan = json!({"ops": [
            {"type": "replace_once", "path": "sections/a.liquid", "anchor": "a",
             "replacement": big, "expected_anchor_count": 1},
            {"type": "insert_before", "path": "sections/b.liquid", "anchor": "b",
             "content": "y".repeat(60_000), "expected_anchor_count": 1},
        ]});
        assert_eq!(
            validator().validate(&plan),
            Err(PlanError::TooMuchContent {
                total: 260_000,
                max: 250_000
            })
        );
    }

    #[test]
    fn normalizes_paths_and_preserves_other_fields() {
        let plan = json!({
            "summary": "tweak hero",
            "ops": [{"type": "insert_after", "path": "/sections//hero.liquid", "anchor": "{% schema %}",
                "content": "x", "expected_anchor_count": 1, "reason": "add block"}],
        });
        let validated = validator().validate(&plan).expect("valid");
        assert_eq!(validated.normalized["summary"], "tweak hero");
        assert_eq!(validated.normalized["ops"][0]["path"], "sections/hero.liquid");
        assert_eq!(validated.normalized["ops"][0]["reason"], "add block");
        assert_eq!(validated.ops[0].path(), Some("sections/hero.liquid"));
    }

    #[test]
    fn apply_patch_targets_are_checked() {
        let patch = "diff --git a/../secrets.txt b/../secrets.txt\n@@ -1,1 +1,1 @@\n-a\n+b\n";
        let plan = json!({"ops": [{"type": "apply_patch", "patch_text": patch}]});
        assert!(matches!(
            validator().validate(&plan),
            Err(PlanError::PathNotAllowed { .. })
        ));

        let plan = json!({"ops": [{"type": "apply_patch", "patch_text": "just words"}]});
        assert!(matches!(
            validator().validate(&plan),
            Err(PlanError::MalformedPatch { .. })
        ));
    }
}
