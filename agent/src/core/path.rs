//! Workspace-relative path normalization and the scope errors raised when a
//! path falls outside what the agent may touch.

use thiserror::Error;

/// A path rejected by scope enforcement. Recoverable: reported to the model as a
/// failed tool call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("empty path not allowed")]
    Empty { path: String },
    #[error("path traversal not allowed: {path}")]
    Traversal { path: String },
    #[error("path escapes root: {path}")]
    EscapesRoot { path: String },
    #[error("blocked outside allowed dirs: '{path}' (allowed: {allowed})")]
    OutsideAllowedDirs { path: String, allowed: String },
    #[error("blocked writing binary/content asset {path}; use the admin/content channel instead")]
    BlockedAssetType { path: String },
    #[error("blocked writing large inline image data to {path}; use the admin/content channel instead")]
    InlineData { path: String },
    #[error("file not found: {path}")]
    NotFound { path: String },
}

impl ScopeError {
    pub fn path(&self) -> &str {
        match self {
            Self::Empty { path }
            | Self::Traversal { path }
            | Self::EscapesRoot { path }
            | Self::OutsideAllowedDirs { path, .. }
            | Self::BlockedAssetType { path }
            | Self::InlineData { path }
            | Self::NotFound { path } => path,
        }
    }
}

/// Canonical relative form: forward slashes, no leading slash, no empty or `.` segments.
///
/// `..` segments are kept so callers can detect and reject them.
pub fn normalize_rel_path(raw: &str) -> String {
    let unified = raw.trim().replace('\\', "/");
    unified
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

pub fn has_traversal(rel: &str) -> bool {
    rel.split('/').any(|segment| segment == "..")
}

/// Normalize `raw` and reject empty or traversing paths.
pub fn checked_rel_path(raw: &str) -> Result<String, ScopeError> {
    let rel = normalize_rel_path(raw);
    if rel.is_empty() {
        return Err(ScopeError::Empty {
            path: raw.to_string(),
        });
    }
    if has_traversal(&rel) {
        return Err(ScopeError::Traversal {
            path: raw.to_string(),
        });
    }
    Ok(rel)
}

/// First segment of a normalized relative path.
pub fn top_level_dir(rel: &str) -> &str {
    rel.split('/').next().unwrap_or_default()
}

/// Lowercased extension including the leading dot, if the file name has one.
pub fn extension(rel: &str) -> Option<String> {
    let name = rel.rsplit('/').next().unwrap_or(rel);
    let dot = name.rfind('.')?;
    if dot == 0 {
        return None;
    }
    Some(name[dot..].to_ascii_lowercase())
}
