//! Applying validated plans to the workspace.
//!
//! Every op computes the complete new content of each file it touches before
//! writing anything, and writes go through [`ScopedFileSystem`] so scope and
//! content policy hold for plan edits too. The first failing op stops the plan;
//! the files changed by earlier ops are reported with the error.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::core::anchor::{AnchorEdit, apply_anchor_edit};
use crate::core::diff::{PatchError, apply_hunks, parse_unified_diff};
use crate::core::path::ScopeError;
use crate::core::plan::{Op, ValidatedPlan};
use crate::io::workspace_fs::ScopedFileSystem;

/// What a (possibly partial) plan application did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub changed_files: Vec<String>,
    pub created_files: Vec<String>,
    pub applied_ops: Vec<AppliedOp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedOp {
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: String,
    pub paths: Vec<String>,
}

impl ApplyReport {
    fn record(&mut self, index: usize, kind: &str, writes: &[FileWrite]) {
        for write in writes {
            if write.created && !self.created_files.contains(&write.path) {
                self.created_files.push(write.path.clone());
            }
            if !self.changed_files.contains(&write.path) {
                self.changed_files.push(write.path.clone());
            }
        }
        self.applied_ops.push(AppliedOp {
            index,
            kind: kind.to_string(),
            paths: writes.iter().map(|w| w.path.clone()).collect(),
        });
    }
}

/// A mutation-time failure. Fatal for the run; `partial` lists what earlier ops changed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("op #{index} ({kind}) failed: {failure}")]
pub struct ApplyError {
    pub index: usize,
    pub kind: String,
    pub failure: ApplyFailure,
    pub partial: ApplyReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyFailure {
    #[error("anchor occurs {found} time(s) in {path}, expected {expected}")]
    AnchorMismatch {
        path: String,
        found: usize,
        expected: usize,
    },
    #[error("target does not exist: {path}")]
    MissingTarget { path: String },
    #[error("target already exists: {path}")]
    AlreadyExists { path: String },
    #[error("patch for {path}: {error}")]
    Patch { path: String, error: PatchError },
    #[error(transparent)]
    Scope(ScopeError),
    #[error("{0}")]
    Io(String),
}

impl From<anyhow::Error> for ApplyFailure {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<ScopeError>() {
            Some(scope) => Self::Scope(scope.clone()),
            None => Self::Io(format!("{err:#}")),
        }
    }
}

struct FileWrite {
    path: String,
    content: String,
    created: bool,
}

pub struct PatchEngine<'a> {
    fs: &'a ScopedFileSystem,
}

impl<'a> PatchEngine<'a> {
    pub fn new(fs: &'a ScopedFileSystem) -> Self {
        Self { fs }
    }

    #[instrument(skip_all, fields(ops = plan.ops.len()))]
    pub fn apply_plan(&self, plan: &ValidatedPlan) -> Result<ApplyReport, ApplyError> {
        let mut report = ApplyReport::default();
        for (index, op) in plan.ops.iter().enumerate() {
            let writes = match self.prepare(op) {
                Ok(writes) => writes,
                Err(failure) => {
                    return Err(ApplyError {
                        index,
                        kind: op.kind().to_string(),
                        failure,
                        partial: report,
                    });
                }
            };
            let mut written = Vec::with_capacity(writes.len());
            for write in writes {
                if let Err(err) = self.fs.write(&write.path, &write.content) {
                    report.record(index, op.kind(), &written);
                    return Err(ApplyError {
                        index,
                        kind: op.kind().to_string(),
                        failure: err.into(),
                        partial: report,
                    });
                }
                written.push(write);
            }
            debug!(index, kind = op.kind(), files = written.len(), "op applied");
            report.record(index, op.kind(), &written);
        }
        info!(
            changed = report.changed_files.len(),
            created = report.created_files.len(),
            "plan applied"
        );
        Ok(report)
    }

    /// Compute the files `op` would write and check each against the content
    /// policy before anything touches disk. Unchanged files are omitted.
    fn prepare(&self, op: &Op) -> Result<Vec<FileWrite>, ApplyFailure> {
        let writes = self.stage(op)?;
        for write in &writes {
            self.fs
                .check_content(&write.path, &write.content)
                .map_err(ApplyFailure::Scope)?;
        }
        Ok(writes)
    }

    fn stage(&self, op: &Op) -> Result<Vec<FileWrite>, ApplyFailure> {
        match op {
            Op::CreateFile { path, content } => {
                if self.fs.exists(path).map_err(ApplyFailure::Scope)? {
                    return Err(ApplyFailure::AlreadyExists { path: path.clone() });
                }
                Ok(vec![FileWrite {
                    path: path.clone(),
                    content: content.clone(),
                    created: true,
                }])
            }
            Op::InsertAfter {
                path,
                anchor,
                content,
                expected_anchor_count,
            } => self.anchor_edit(path, anchor, *expected_anchor_count, AnchorEdit::InsertAfter(content)),
            Op::InsertBefore {
                path,
                anchor,
                content,
                expected_anchor_count,
            } => self.anchor_edit(path, anchor, *expected_anchor_count, AnchorEdit::InsertBefore(content)),
            Op::ReplaceOnce {
                path,
                anchor,
                replacement,
                expected_anchor_count,
            } => self.anchor_edit(
                path,
                anchor,
                *expected_anchor_count,
                AnchorEdit::ReplaceOnce(replacement),
            ),
            Op::ApplyPatch { patch_text } => self.unified_diff(patch_text),
        }
    }

    fn read_existing(&self, path: &str) -> Result<String, ApplyFailure> {
        if !self.fs.exists(path).map_err(ApplyFailure::Scope)? {
            return Err(ApplyFailure::MissingTarget {
                path: path.to_string(),
            });
        }
        Ok(self.fs.read(path)?)
    }

    fn anchor_edit(
        &self,
        path: &str,
        anchor: &str,
        expected: usize,
        edit: AnchorEdit<'_>,
    ) -> Result<Vec<FileWrite>, ApplyFailure> {
        let original = self.read_existing(path)?;
        let updated = apply_anchor_edit(&original, anchor, expected, edit).map_err(|mismatch| {
            ApplyFailure::AnchorMismatch {
                path: path.to_string(),
                found: mismatch.found,
                expected: mismatch.expected,
            }
        })?;
        Ok(changed_only(path, &original, updated))
    }

    fn unified_diff(&self, patch_text: &str) -> Result<Vec<FileWrite>, ApplyFailure> {
        let files = parse_unified_diff(patch_text).map_err(|error| ApplyFailure::Patch {
            path: String::new(),
            error,
        })?;
        // Sections for the same file apply in order to its patched text.
        let mut staged: Vec<(String, String, String)> = Vec::new();
        for file in files {
            let (rel, _) = self.fs.resolve(&file.new_path).map_err(|_| ApplyFailure::Patch {
                path: file.new_path.clone(),
                error: PatchError::DisallowedPath {
                    path: file.new_path.clone(),
                },
            })?;
            let slot = match staged.iter().position(|(path, _, _)| *path == rel) {
                Some(slot) => slot,
                None => {
                    if !self.fs.exists(&rel).map_err(ApplyFailure::Scope)? {
                        return Err(ApplyFailure::Patch {
                            path: rel.clone(),
                            error: PatchError::MissingTarget { path: rel },
                        });
                    }
                    let original = self.fs.read(&rel)?;
                    staged.push((rel.clone(), original.clone(), original));
                    staged.len() - 1
                }
            };
            let current = &mut staged[slot].2;
            *current = apply_hunks(current, &file.hunks).map_err(|error| ApplyFailure::Patch {
                path: rel.clone(),
                error,
            })?;
        }
        Ok(staged
            .into_iter()
            .flat_map(|(path, original, updated)| changed_only(&path, &original, updated))
            .collect())
    }
}

fn changed_only(path: &str, original: &str, updated: String) -> Vec<FileWrite> {
    if updated == original {
        return Vec::new();
    }
    vec![FileWrite {
        path: path.to_string(),
        content: updated,
        created: false,
    }]
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;
    use crate::core::plan::{PlanPolicy, PlanValidator};
    use crate::io::config::WorkspaceConfig;

    fn setup() -> (tempfile::TempDir, ScopedFileSystem, PlanValidator) {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("sections")).expect("mkdir");
        fs::write(
            temp.path().join("sections/hero.liquid"),
            "<div class=\"hero\">\n  <h1>{{ section.settings.title }}</h1>\n</div>\n",
        )
        .expect("seed");
        let workspace = WorkspaceConfig::default();
        let validator = PlanValidator::new(PlanPolicy::default(), workspace.allowed_top_dirs.clone());
        let scoped = ScopedFileSystem::new(temp.path(), workspace).expect("fs");
        (temp, scoped, validator)
    }

    #[test]
    fn insert_after_changes_only_target() {
        let (temp, scoped, validator) = setup();
        let plan = validator
            .validate(&json!({"ops": [{"type": "insert_after", "path": "sections/hero.liquid",
                "anchor": "</h1>", "content": "\n  <p>Sub</p>", "expected_anchor_count": 1}]}))
            .expect("valid");
        let report = PatchEngine::new(&scoped).apply_plan(&plan).expect("apply");
        assert_eq!(report.changed_files, vec!["sections/hero.liquid"]);
        assert!(report.created_files.is_empty());
        let text = fs::read_to_string(temp.path().join("sections/hero.liquid")).expect("read");
        assert_eq!(
            text,
            "<div class=\"hero\">\n  <h1>{{ section.settings.title }}</h1>\n  <p>Sub</p>\n</div>\n"
        );
    }

    #[test]
    fn anchor_count_mismatch_leaves_file_unmodified() {
        let (temp, scoped, validator) = setup();
        let before = fs::read(temp.path().join("sections/hero.liquid")).expect("read");
        let plan = validator
            .validate(&json!({"ops": [{"type": "replace_once", "path": "sections/hero.liquid",
                "anchor": "h1", "replacement": "h2", "expected_anchor_count": 1}]}))
            .expect("valid");
        let err = PatchEngine::new(&scoped).apply_plan(&plan).expect_err("mismatch");
        assert_eq!(
            err.failure,
            ApplyFailure::AnchorMismatch {
                path: "sections/hero.liquid".to_string(),
                found: 2,
                expected: 1
            }
        );
        let after = fs::read(temp.path().join("sections/hero.liquid")).expect("read");
        assert_eq!(before, after);
    }

    #[test]
    fn create_file_refuses_existing_target() {
        let (_temp, scoped, validator) = setup();
        let justification = "x".repeat(130);
        let plan = validator
            .validate(&json!({
                "ops": [{"type": "create_file", "path": "sections/hero.liquid", "content": "new"}],
                "justification": {"new_files": justification},
            }))
            .expect("valid");
        let err = PatchEngine::new(&scoped).apply_plan(&plan).expect_err("exists");
        assert_eq!(
            err.failure,
            ApplyFailure::AlreadyExists {
                path: "sections/hero.liquid".to_string()
            }
        );
    }

    #[test]
    fn failure_reports_files_changed_by_earlier_ops() {
        let (temp, scoped, validator) = setup();
        let plan = validator
            .validate(&json!({"ops": [
                {"type": "replace_once", "path": "sections/hero.liquid", "anchor": "hero",
                 "replacement": "banner", "expected_anchor_count": 1},
                {"type": "insert_before", "path": "sections/missing.liquid", "anchor": "x",
                 "content": "y", "expected_anchor_count": 1},
            ]}))
            .expect("valid");
        let err = PatchEngine::new(&scoped).apply_plan(&plan).expect_err("missing");
        assert_eq!(err.index, 1);
        assert_eq!(
            err.failure,
            ApplyFailure::MissingTarget {
                path: "sections/missing.liquid".to_string()
            }
        );
        assert_eq!(err.partial.changed_files, vec!["sections/hero.liquid"]);
        let text = fs::read_to_string(temp.path().join("sections/hero.liquid")).expect("read");
        assert!(text.contains("banner"));
    }

    #[test]
    fn diff_with_mismatched_removed_line_is_atomic() {
        let (temp, scoped, validator) = setup();
        let path = temp.path().join("sections/hero.liquid");
        let before = fs::read(&path).expect("read");
        let patch = "diff --git a/sections/hero.liquid b/sections/hero.liquid\n\
                     @@ -1,3 +1,3 @@\n <div class=\"hero\">\n-  <h1>Wrong</h1>\n+  <h1>Right</h1>\n </div>\n";
        let plan = validator
            .validate(&json!({"ops": [{"type": "apply_patch", "patch_text": patch}]}))
            .expect("valid");
        let err = PatchEngine::new(&scoped).apply_plan(&plan).expect_err("mismatch");
        assert!(matches!(
            err.failure,
            ApplyFailure::Patch {
                error: PatchError::RemoveMismatch { line_no: 2, .. },
                ..
            }
        ));
        assert_eq!(fs::read(&path).expect("read"), before);
    }

    #[test]
    fn diff_applies_to_existing_file() {
        let (temp, scoped, validator) = setup();
        let patch = "diff --git a/sections/hero.liquid b/sections/hero.liquid\n\
                     --- a/sections/hero.liquid\n+++ b/sections/hero.liquid\n\
                     @@ -1,3 +1,3 @@\n-<div class=\"hero\">\n+<div class=\"hero hero--wide\">\n   <h1>{{ section.settings.title }}</h1>\n </div>\n";
        let plan = validator
            .validate(&json!({"ops": [{"type": "apply_patch", "patch_text": patch}]}))
            .expect("valid");
        let report = PatchEngine::new(&scoped).apply_plan(&plan).expect("apply");
        assert_eq!(report.changed_files, vec!["sections/hero.liquid"]);
        let text = fs::read_to_string(temp.path().join("sections/hero.liquid")).expect("read");
        assert!(text.starts_with("<div class=\"hero hero--wide\">\n"));
        assert!(text.ends_with("</div>\n"));
    }

    #[test]
    fn diff_sections_for_one_file_build_on_each_other() {
        let (temp, scoped, validator) = setup();
        let path = temp.path().join("sections/list.liquid");
        fs::write(&path, "one\ntwo\nthree\n").expect("seed");
        let patch = "diff --git a/sections/list.liquid b/sections/list.liquid\n\
                     @@ -1,1 +1,1 @@\n-one\n+ONE\n\
                     diff --git a/sections/list.liquid b/sections/list.liquid\n\
                     @@ -3,1 +3,1 @@\n-three\n+THREE\n";
        let plan = validator
            .validate(&json!({"ops": [{"type": "apply_patch", "patch_text": patch}]}))
            .expect("valid");
        let report = PatchEngine::new(&scoped).apply_plan(&plan).expect("apply");
        assert_eq!(report.changed_files, vec!["sections/list.liquid"]);
        assert_eq!(fs::read_to_string(&path).expect("read"), "ONE\ntwo\nTHREE\n");
    }

    #[test]
    fn content_policy_failure_in_later_diff_file_writes_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("sections")).expect("mkdir");
        let hero = temp.path().join("sections/hero.liquid");
        let gallery = temp.path().join("sections/gallery.liquid");
        fs::write(&hero, "<h1>Hi</h1>\n").expect("seed");
        fs::write(&gallery, "<img src=\"x.png\">\n").expect("seed");
        let workspace = WorkspaceConfig {
            inline_data_limit_bytes: 16,
            ..WorkspaceConfig::default()
        };
        let validator = PlanValidator::new(PlanPolicy::default(), workspace.allowed_top_dirs.clone());
        let scoped = ScopedFileSystem::new(temp.path(), workspace).expect("fs");
        let patch = "diff --git a/sections/hero.liquid b/sections/hero.liquid\n\
                     @@ -1,1 +1,1 @@\n-<h1>Hi</h1>\n+<h1>Hello</h1>\n\
                     diff --git a/sections/gallery.liquid b/sections/gallery.liquid\n\
                     @@ -1,1 +1,1 @@\n-<img src=\"x.png\">\n+<img src=\"data:image/png;base64,AAAA\">\n";
        let plan = validator
            .validate(&json!({"ops": [{"type": "apply_patch", "patch_text": patch}]}))
            .expect("valid");
        let err = PatchEngine::new(&scoped).apply_plan(&plan).expect_err("inline data");
        assert!(matches!(err.failure, ApplyFailure::Scope(ScopeError::InlineData { .. })));
        assert!(err.partial.changed_files.is_empty());
        assert_eq!(fs::read_to_string(&hero).expect("read"), "<h1>Hi</h1>\n");
        assert_eq!(fs::read_to_string(&gallery).expect("read"), "<img src=\"x.png\">\n");
    }
}
