//! Read/write/list access to the workspace, confined to allowed top-level
//! directories and subject to a content policy for assets.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use glob::{MatchOptions, Pattern};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::core::path::{ScopeError, checked_rel_path, extension, top_level_dir};
use crate::io::config::WorkspaceConfig;

#[derive(Debug, Clone)]
pub struct ScopedFileSystem {
    root: PathBuf,
    policy: WorkspaceConfig,
}

impl ScopedFileSystem {
    /// `root` must be an existing directory; it is canonicalized once here.
    pub fn new(root: &Path, policy: WorkspaceConfig) -> Result<Self> {
        let root = fs::canonicalize(root)
            .with_context(|| format!("resolve workspace root {}", root.display()))?;
        if !root.is_dir() {
            return Err(anyhow!("workspace root is not a directory: {}", root.display()));
        }
        Ok(Self { root, policy })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn allowed_dirs(&self) -> &[String] {
        &self.policy.allowed_top_dirs
    }

    /// Normalize `raw` and resolve it to an absolute path inside an allowed directory.
    pub fn resolve(&self, raw: &str) -> Result<(String, PathBuf), ScopeError> {
        let rel = checked_rel_path(raw)?;
        let top = top_level_dir(&rel);
        if !self.policy.allowed_top_dirs.iter().any(|d| d == top) {
            return Err(ScopeError::OutsideAllowedDirs {
                path: rel,
                allowed: self.policy.allowed_top_dirs.join(", "),
            });
        }
        let abs = contained_path(&self.root, &rel)?;
        Ok((rel, abs))
    }

    pub fn exists(&self, raw: &str) -> Result<bool, ScopeError> {
        let (_, abs) = self.resolve(raw)?;
        Ok(abs.is_file())
    }

    /// Read a workspace file as text; invalid UTF-8 is replaced.
    pub fn read(&self, raw: &str) -> Result<String> {
        let (rel, abs) = self.resolve(raw)?;
        if !abs.is_file() {
            return Err(ScopeError::NotFound { path: rel }.into());
        }
        let bytes = fs::read(&abs).with_context(|| format!("read {rel}"))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Check the content policy for writing `text` to the normalized path `rel`.
    pub fn check_content(&self, rel: &str, text: &str) -> Result<(), ScopeError> {
        let in_assets = top_level_dir(rel) == self.policy.asset_dir;
        if in_assets
            && let Some(ext) = extension(rel)
            && self
                .policy
                .blocked_asset_exts
                .iter()
                .any(|blocked| blocked.eq_ignore_ascii_case(&ext))
        {
            return Err(ScopeError::BlockedAssetType {
                path: rel.to_string(),
            });
        }
        if !self.policy.inline_data_marker.is_empty()
            && text.contains(&self.policy.inline_data_marker)
            && text.len() > self.policy.inline_data_limit_bytes
        {
            return Err(ScopeError::InlineData {
                path: rel.to_string(),
            });
        }
        Ok(())
    }

    /// Write `text` atomically, creating parent directories.
    ///
    /// Returns the normalized relative path.
    pub fn write(&self, raw: &str, text: &str) -> Result<String> {
        let (rel, abs) = self.resolve(raw)?;
        self.check_content(&rel, text)?;
        write_atomic(&abs, text.as_bytes()).with_context(|| format!("write {rel}"))?;
        debug!(path = %rel, bytes = text.len(), "workspace file written");
        Ok(rel)
    }

    /// Files under the allowed directories whose root-relative path matches `pattern`.
    ///
    /// `*` does not cross `/`; use `**` for recursive matches. Output is sorted.
    pub fn list(&self, pattern: &str) -> Result<Vec<String>> {
        let pattern = Pattern::new(pattern).with_context(|| format!("invalid glob {pattern:?}"))?;
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        let mut out = Vec::new();
        for dir in &self.policy.allowed_top_dirs {
            let base = self.root.join(dir);
            if !base.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&base).sort_by_file_name() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!(err = %err, "skipping unreadable workspace entry");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(rel) = relative_slash_path(&self.root, entry.path()) else {
                    continue;
                };
                if pattern.matches_with(&rel, options) {
                    out.push(rel);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Join `rel` onto `root` and reject results that leave `root`, including via symlinks.
pub(crate) fn contained_path(root: &Path, rel: &str) -> Result<PathBuf, ScopeError> {
    let candidate = root.join(rel);
    let mut existing = candidate.as_path();
    while !existing.exists() {
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }
    let resolved = fs::canonicalize(existing).map_err(|_| ScopeError::EscapesRoot {
        path: rel.to_string(),
    })?;
    if !resolved.starts_with(root) {
        return Err(ScopeError::EscapesRoot {
            path: rel.to_string(),
        });
    }
    Ok(candidate)
}

pub(crate) fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Write via a sibling temp file and rename so readers never see partial content.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{file_name}.tmp-{}", std::process::id()));
    {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("create temp file {}", tmp_path.display()))?;
        file.write_all(contents)
            .with_context(|| format!("write temp file {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("sync temp file {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
