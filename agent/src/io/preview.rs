//! Optional long-lived preview server used by the browser verifier.

use std::path::Path;
use std::process::Child;
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use crate::io::config::PreviewConfig;
use crate::io::sandbox::{CommandSandbox, kill_group};

pub const DEFAULT_PREVIEW_URL: &str = "http://127.0.0.1:9292";

/// A running preview process. Its process group is killed on [`PreviewServer::stop`] or drop.
#[derive(Debug)]
pub struct PreviewServer {
    child: Option<Child>,
    base_url: String,
}

impl PreviewServer {
    /// Start the configured preview command, or `None` when none is configured.
    ///
    /// The process is not probed for readiness; the startup wait is a fixed delay.
    pub fn start(
        sandbox: &CommandSandbox,
        cfg: &PreviewConfig,
        workspace: &Path,
        log_path: &Path,
    ) -> Result<Option<Self>> {
        if cfg.command.is_empty() {
            return Ok(None);
        }
        let mut child = sandbox.spawn_background(&cfg.command, workspace, log_path)?;
        thread::sleep(Duration::from_millis(cfg.startup_wait_ms));
        if let Some(status) = child.try_wait()? {
            bail!(
                "preview server exited during startup ({status}); see {}",
                log_path.display()
            );
        }
        let base_url = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_PREVIEW_URL.to_string());
        info!(pid = child.id(), base_url = %base_url, "preview server started");
        Ok(Some(Self {
            child: Some(child),
            base_url,
        }))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        kill_group(child.id());
        if let Err(err) = child.kill() {
            debug!(err = %err, "preview server already exited");
        }
        match child.wait() {
            Ok(status) => info!(%status, "preview server stopped"),
            Err(err) => warn!(err = %err, "failed to reap preview server"),
        }
    }
}

impl Drop for PreviewServer {
    fn drop(&mut self) {
        self.stop();
    }
}
