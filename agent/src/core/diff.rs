//! Strict unified-diff parsing and hunk application.
//!
//! Only the subset models reliably produce is supported: `diff --git` sections
//! with `@@` hunks of context/add/remove lines. Application never fuzzes: every
//! context and removed line must match the source exactly.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("valid hunk header regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("bad diff header: {line}")]
    BadFileHeader { line: String },
    #[error("bad hunk header: {line}")]
    BadHunkHeader { line: String },
    #[error("hunk body line outside of a hunk: {line}")]
    OrphanHunk { line: String },
    #[error("hunk starting at line {start} overlaps a previous hunk")]
    HunkOutOfOrder { start: usize },
    #[error("hunk starts at line {start} but the file has {len} lines")]
    HunkBeyondEnd { start: usize, len: usize },
    #[error("context mismatch at line {line_no}: expected {expected:?}, found {found:?}")]
    ContextMismatch {
        line_no: usize,
        expected: String,
        found: Option<String>,
    },
    #[error("removed line mismatch at line {line_no}: expected {expected:?}, found {found:?}")]
    RemoveMismatch {
        line_no: usize,
        expected: String,
        found: Option<String>,
    },
    #[error("patch target is outside the allowed workspace scope: {path}")]
    DisallowedPath { path: String },
    #[error("patch target does not exist: {path}")]
    MissingTarget { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Add(String),
    Remove(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    fn consumed(&self) -> (usize, usize) {
        self.lines.iter().fold((0, 0), |(old, new), line| match line {
            HunkLine::Context(_) => (old + 1, new + 1),
            HunkLine::Remove(_) => (old + 1, new),
            HunkLine::Add(_) => (old, new + 1),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub old_path: String,
    pub new_path: String,
    pub hunks: Vec<Hunk>,
}

/// Parse every `diff --git` section of `text`. Text before the first section is ignored.
pub fn parse_unified_diff(text: &str) -> Result<Vec<FilePatch>, PatchError> {
    let mut files: Vec<FilePatch> = Vec::new();
    let mut in_hunk = false;

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            let mut parts = rest.split_whitespace();
            let (Some(old), Some(new), None) = (parts.next(), parts.next(), parts.next()) else {
                return Err(PatchError::BadFileHeader {
                    line: line.to_string(),
                });
            };
            files.push(FilePatch {
                old_path: strip_side_prefix(old, "a/"),
                new_path: strip_side_prefix(new, "b/"),
                hunks: Vec::new(),
            });
            in_hunk = false;
            continue;
        }

        let Some(file) = files.last_mut() else {
            continue;
        };

        if line.starts_with("@@") {
            file.hunks.push(parse_hunk_header(line)?);
            in_hunk = true;
            continue;
        }

        if !in_hunk {
            // File-level headers (`---`, `+++`, `index`, mode lines) carry nothing we use.
            if line.starts_with("--- ")
                || line.starts_with("+++ ")
                || line.starts_with("index ")
                || line.trim().is_empty()
            {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('+') || line.starts_with('-') {
                return Err(PatchError::OrphanHunk {
                    line: line.to_string(),
                });
            }
            continue;
        }

        let Some(hunk) = file.hunks.last_mut() else {
            continue;
        };
        if let Some(body) = line.strip_prefix(' ') {
            hunk.lines.push(HunkLine::Context(body.to_string()));
        } else if let Some(body) = line.strip_prefix('+') {
            hunk.lines.push(HunkLine::Add(body.to_string()));
        } else if let Some(body) = line.strip_prefix('-') {
            hunk.lines.push(HunkLine::Remove(body.to_string()));
        } else if line.starts_with('\\') {
            // "\ No newline at end of file"
        } else if line.is_empty() {
            // Editors strip the lone space of blank context lines; accept that while
            // the hunk still expects lines, otherwise it closes the hunk.
            let (old, new) = hunk.consumed();
            if old < hunk.old_len && new < hunk.new_len {
                hunk.lines.push(HunkLine::Context(String::new()));
            } else {
                in_hunk = false;
            }
        } else {
            in_hunk = false;
        }
    }

    Ok(files)
}

fn strip_side_prefix(path: &str, prefix: &str) -> String {
    path.strip_prefix(prefix).unwrap_or(path).to_string()
}

fn parse_hunk_header(line: &str) -> Result<Hunk, PatchError> {
    let bad = || PatchError::BadHunkHeader {
        line: line.to_string(),
    };
    let caps = HUNK_HEADER.captures(line).ok_or_else(bad)?;
    let number = |idx: usize, default: usize| -> Result<usize, PatchError> {
        match caps.get(idx) {
            Some(m) => m.as_str().parse().map_err(|_| bad()),
            None => Ok(default),
        }
    };
    Ok(Hunk {
        old_start: number(1, 0)?,
        old_len: number(2, 1)?,
        new_start: number(3, 0)?,
        new_len: number(4, 1)?,
        lines: Vec::new(),
    })
}

/// Apply `hunks` in order to `original`, returning the new file text.
///
/// Line endings (`\n` or `\r\n`) and the presence of a trailing newline follow
/// the original text.
pub fn apply_hunks(original: &str, hunks: &[Hunk]) -> Result<String, PatchError> {
    let source: Vec<&str> = original.lines().collect();
    let mut out: Vec<&str> = Vec::with_capacity(source.len());
    let mut cursor = 0usize;

    for hunk in hunks {
        let target = hunk.old_start.saturating_sub(1);
        if target < cursor {
            return Err(PatchError::HunkOutOfOrder {
                start: hunk.old_start,
            });
        }
        if target > source.len() {
            return Err(PatchError::HunkBeyondEnd {
                start: hunk.old_start,
                len: source.len(),
            });
        }
        out.extend_from_slice(&source[cursor..target]);
        cursor = target;

        for line in &hunk.lines {
            match line {
                HunkLine::Context(expected) => {
                    let found = source.get(cursor).copied();
                    if found != Some(expected.as_str()) {
                        return Err(PatchError::ContextMismatch {
                            line_no: cursor + 1,
                            expected: expected.clone(),
                            found: found.map(str::to_string),
                        });
                    }
                    out.push(source[cursor]);
                    cursor += 1;
                }
                HunkLine::Remove(expected) => {
                    let found = source.get(cursor).copied();
                    if found != Some(expected.as_str()) {
                        return Err(PatchError::RemoveMismatch {
                            line_no: cursor + 1,
                            expected: expected.clone(),
                            found: found.map(str::to_string),
                        });
                    }
                    cursor += 1;
                }
                HunkLine::Add(added) => out.push(added),
            }
        }
    }
    out.extend_from_slice(&source[cursor..]);

    let newline = if original.contains("\r\n") { "\r\n" } else { "\n" };
    let mut text = out.join(newline);
    if original.ends_with('\n') && !text.is_empty() {
        text.push_str(newline);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATCH: &str = "\
Here is the change:
diff --git a/sections/hero.liquid b/sections/hero.liquid
--- a/sections/hero.liquid
+++ b/sections/hero.liquid
@@ -1,3 +1,3 @@
 <div class=\"hero\">
-  <h1>Old</h1>
+  <h1>New</h1>
 </div>
";

    #[test]
    fn parses_headers_and_hunks() {
        let files = parse_unified_diff(PATCH).expect("parse");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].new_path, "sections/hero.liquid");
        let hunk = &files[0].hunks[0];
        assert_eq!((hunk.old_start, hunk.old_len, hunk.new_start, hunk.new_len), (1, 3, 1, 3));
        assert_eq!(hunk.lines.len(), 4);
        assert_eq!(hunk.lines[1], HunkLine::Remove("  <h1>Old</h1>".to_string()));
    }

    #[test]
    fn omitted_hunk_lengths_default_to_one() {
        let files =
            parse_unified_diff("diff --git a/x b/x\n@@ -3 +3 @@\n-a\n+b\n").expect("parse");
        let hunk = &files[0].hunks[0];
        assert_eq!((hunk.old_start, hunk.old_len, hunk.new_len), (3, 1, 1));
    }

    #[test]
    fn rejects_malformed_headers() {
        assert!(matches!(
            parse_unified_diff("diff --git only-one\n"),
            Err(PatchError::BadFileHeader { .. })
        ));
        assert!(matches!(
            parse_unified_diff("diff --git a/x b/x\n@@ nonsense @@\n"),
            Err(PatchError::BadHunkHeader { .. })
        ));
    }

    #[test]
    fn applies_hunk_and_keeps_trailing_newline() {
        let files = parse_unified_diff(PATCH).expect("parse");
        let original = "<div class=\"hero\">\n  <h1>Old</h1>\n</div>\n";
        let patched = apply_hunks(original, &files[0].hunks).expect("apply");
        assert_eq!(patched, "<div class=\"hero\">\n  <h1>New</h1>\n</div>\n");
    }

    #[test]
    fn preserves_missing_trailing_newline_and_crlf() {
        let files = parse_unified_diff(PATCH).expect("parse");
        let original = "<div class=\"hero\">\r\n  <h1>Old</h1>\r\n</div>";
        let patched = apply_hunks(original, &files[0].hunks).expect("apply");
        assert_eq!(patched, "<div class=\"hero\">\r\n  <h1>New</h1>\r\n</div>");
    }

    #[test]
    fn removed_line_mismatch_is_rejected() {
        let files = parse_unified_diff(PATCH).expect("parse");
        let original = "<div class=\"hero\">\n  <h1>Different</h1>\n</div>\n";
        let err = apply_hunks(original, &files[0].hunks).expect_err("mismatch");
        assert_eq!(
            err,
            PatchError::RemoveMismatch {
                line_no: 2,
                expected: "  <h1>Old</h1>".to_string(),
                found: Some("  <h1>Different</h1>".to_string()),
            }
        );
    }

    #[test]
    fn copies_lines_before_and_after_hunk() {
        let patch = "diff --git a/f b/f\n@@ -3,2 +3,3 @@\n c\n+inserted\n d\n";
        let files = parse_unified_diff(patch).expect("parse");
        let patched = apply_hunks("a\nb\nc\nd\ne\n", &files[0].hunks).expect("apply");
        assert_eq!(patched, "a\nb\nc\ninserted\nd\ne\n");
    }

    #[test]
    fn blank_context_line_without_leading_space_is_accepted() {
        let patch = "diff --git a/f b/f\n@@ -1,3 +1,3 @@\n a\n\n-c\n+C\n";
        let files = parse_unified_diff(patch).expect("parse");
        let patched = apply_hunks("a\n\nc\n", &files[0].hunks).expect("apply");
        assert_eq!(patched, "a\n\nC\n");
    }

    #[test]
    fn overlapping_hunks_are_rejected() {
        let patch = "diff --git a/f b/f\n@@ -2,1 +2,1 @@\n-b\n+B\n@@ -1,1 +1,1 @@\n-a\n+A\n";
        let files = parse_unified_diff(patch).expect("parse");
        assert!(matches!(
            apply_hunks("a\nb\n", &files[0].hunks),
            Err(PatchError::HunkOutOfOrder { start: 1 })
        ));
    }
}
