//! Run artifacts: logs, decisions, verification output and model-supplied files.
//!
//! Any relative path under the store root is accepted; traversal and escapes
//! are rejected the same way as for workspace paths. The store never touches
//! the workspace.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;

use crate::core::path::{ScopeError, checked_rel_path};
use crate::io::workspace_fs::{contained_path, write_atomic};

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Create (if needed) and open the store rooted at `root`.
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("create directory {}", root.display()))?;
        let root = fs::canonicalize(root)
            .with_context(|| format!("resolve artifacts root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, raw: &str) -> Result<PathBuf, ScopeError> {
        let rel = checked_rel_path(raw)?;
        contained_path(&self.root, &rel)
    }

    pub fn write_text(&self, raw: &str, content: &str) -> Result<PathBuf> {
        self.write_bytes(raw, content.as_bytes())
    }

    /// Decode standard base64 and write the bytes.
    pub fn write_base64(&self, raw: &str, encoded: &str) -> Result<PathBuf> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .with_context(|| format!("decode base64 for artifact {raw}"))?;
        self.write_bytes(raw, &bytes)
    }

    /// Pretty-printed JSON with a trailing newline.
    pub fn write_json<T: Serialize>(&self, raw: &str, value: &T) -> Result<PathBuf> {
        let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
        payload.push('\n');
        self.write_bytes(raw, payload.as_bytes())
    }

    /// Create a directory under the store and return its absolute path.
    pub fn ensure_dir(&self, raw: &str) -> Result<PathBuf> {
        let path = self.resolve(raw)?;
        fs::create_dir_all(&path).with_context(|| format!("create directory {}", path.display()))?;
        Ok(path)
    }

    /// Copy an external file into the store.
    pub fn copy_in(&self, raw: &str, source: &Path) -> Result<PathBuf> {
        let bytes = fs::read(source).with_context(|| format!("read {}", source.display()))?;
        self.write_bytes(raw, &bytes)
    }

    fn write_bytes(&self, raw: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.resolve(raw)?;
        write_atomic(&path, bytes)?;
        Ok(path)
    }
}
