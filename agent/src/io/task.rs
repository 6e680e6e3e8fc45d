//! Task bundle: the human-authored inputs for one run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info};

use crate::io::artifacts::ArtifactStore;

pub const TASK_FILE: &str = "task.md";
pub const CONTEXT_FILE: &str = "context.md";
pub const MID_TASK_FILE: &str = "mid-task-changes.md";
pub const ARCHITECTURE_FILE: &str = "horizon-context.md";
pub const ASSERTS_FILE: &str = "asserts.json";

#[derive(Debug, Error)]
#[error("{TASK_FILE} not found in tasks dir {}\ncontents:\n{listing}", dir.display())]
pub struct MissingTask {
    pub dir: PathBuf,
    pub listing: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskBundle {
    pub dir: PathBuf,
    pub task: String,
    pub context: Option<String>,
    pub mid_task_changes: Option<String>,
    pub architecture_rules: Option<String>,
    pub asserts: Option<PathBuf>,
}

impl TaskBundle {
    /// Read the bundle from `dir`. Only `task.md` is required; blank optional
    /// files count as absent.
    pub fn load(dir: &Path) -> Result<Self> {
        let task_path = dir.join(TASK_FILE);
        if !task_path.is_file() {
            return Err(MissingTask {
                dir: dir.to_path_buf(),
                listing: list_dir(dir),
            }
            .into());
        }
        let task = fs::read_to_string(&task_path)
            .with_context(|| format!("read {}", task_path.display()))?;
        let asserts = Some(dir.join(ASSERTS_FILE)).filter(|p| p.is_file());

        let bundle = Self {
            dir: dir.to_path_buf(),
            task,
            context: read_optional(&dir.join(CONTEXT_FILE))?,
            mid_task_changes: read_optional(&dir.join(MID_TASK_FILE))?,
            architecture_rules: read_optional(&dir.join(ARCHITECTURE_FILE))?,
            asserts,
        };
        info!(
            dir = %dir.display(),
            context = bundle.context.is_some(),
            mid_task_changes = bundle.mid_task_changes.is_some(),
            architecture_rules = bundle.architecture_rules.is_some(),
            asserts = bundle.asserts.is_some(),
            "task bundle loaded"
        );
        Ok(bundle)
    }

    /// Copy the bundle into the run artifacts. Returns the seeded asserts path,
    /// if any, for the browser verifier.
    pub fn copy_to(&self, artifacts: &ArtifactStore) -> Result<Option<PathBuf>> {
        artifacts.write_text(TASK_FILE, &self.task)?;
        for (name, text) in [
            (CONTEXT_FILE, &self.context),
            (MID_TASK_FILE, &self.mid_task_changes),
            (ARCHITECTURE_FILE, &self.architecture_rules),
        ] {
            if let Some(text) = text {
                artifacts.write_text(name, text)?;
            }
        }
        match &self.asserts {
            Some(source) => {
                let seeded = artifacts.copy_in(ASSERTS_FILE, source)?;
                debug!(path = %seeded.display(), "asserts seeded");
                Ok(Some(seeded))
            }
            None => Ok(None),
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(Some(text).filter(|t| !t.trim().is_empty()))
}

fn list_dir(dir: &Path) -> String {
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut names: Vec<String> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names.join("\n")
        }
        Err(err) => format!("<failed to list tasks dir: {err}>"),
    }
}
