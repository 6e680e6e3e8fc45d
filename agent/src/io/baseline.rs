//! Per-workspace baseline of known checker issues.
//!
//! Baselines live at `<runs_dir>/baselines/<fingerprint>.json`. They are created
//! on the first verification of a workspace and otherwise only replaced by an
//! explicit regeneration.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::io::workspace_fs::write_atomic;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCounts {
    pub errors: u64,
    pub warnings: u64,
}

impl IssueCounts {
    /// True if either count is above `baseline`.
    pub fn regressed_from(&self, baseline: &IssueCounts) -> bool {
        self.errors > baseline.errors || self.warnings > baseline.warnings
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Baseline {
    pub fingerprint: String,
    pub workspace_path: String,
    pub created_at: String,
    pub counts: IssueCounts,
}

/// First 16 hex characters of the SHA-256 of the canonical workspace path.
pub fn workspace_fingerprint(workspace: &Path) -> String {
    let canonical = fs::canonicalize(workspace).unwrap_or_else(|_| workspace.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(16);
    digest
}

#[derive(Debug, Clone)]
pub struct BaselineStore {
    dir: PathBuf,
}

impl BaselineStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Store under `<runs_dir>/baselines`.
    pub fn under_runs_dir(runs_dir: &Path) -> Self {
        Self::new(runs_dir.join("baselines"))
    }

    pub fn path_for(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    pub fn load(&self, workspace: &Path) -> Result<Option<Baseline>> {
        let path = self.path_for(&workspace_fingerprint(workspace));
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let baseline =
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(baseline))
    }

    /// Existing baseline for `workspace`, or a new one recording `counts`.
    ///
    /// The flag is true when the baseline was created by this call.
    pub fn get_or_create(&self, workspace: &Path, counts: IssueCounts) -> Result<(Baseline, bool)> {
        if let Some(existing) = self.load(workspace)? {
            return Ok((existing, false));
        }
        let baseline = self.save_new(workspace, counts)?;
        Ok((baseline, true))
    }

    /// Replace the baseline for `workspace` with `counts`.
    pub fn regenerate(&self, workspace: &Path, counts: IssueCounts) -> Result<Baseline> {
        self.save_new(workspace, counts)
    }

    fn save_new(&self, workspace: &Path, counts: IssueCounts) -> Result<Baseline> {
        let canonical = fs::canonicalize(workspace).unwrap_or_else(|_| workspace.to_path_buf());
        let baseline = Baseline {
            fingerprint: workspace_fingerprint(workspace),
            workspace_path: canonical.to_string_lossy().into_owned(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            counts,
        };
        let path = self.path_for(&baseline.fingerprint);
        let mut payload = serde_json::to_string_pretty(&baseline).context("serialize baseline")?;
        payload.push('\n');
        write_atomic(&path, payload.as_bytes())?;
        info!(
            fingerprint = %baseline.fingerprint,
            errors = counts.errors,
            warnings = counts.warnings,
            "baseline written"
        );
        Ok(baseline)
    }
}
