//! Verification: static checker against the workspace baseline, plus an
//! optional browser verifier against the preview server.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::io::artifacts::ArtifactStore;
use crate::io::baseline::{Baseline, BaselineStore, IssueCounts};
use crate::io::config::VerifyConfig;
use crate::io::sandbox::{CommandResult, CommandSandbox};

static ERROR_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[\s*error\s*\]").expect("valid error marker regex"));
static WARNING_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[\s*warning\s*\]").expect("valid warning marker regex"));

/// Count `[error]` and `[warning]` markers in checker output.
pub fn count_issues(stdout: &str, stderr: &str) -> IssueCounts {
    let count = |re: &Regex| (re.find_iter(stdout).count() + re.find_iter(stderr).count()) as u64;
    IssueCounts {
        errors: count(&ERROR_MARKER),
        warnings: count(&WARNING_MARKER),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub ran: bool,
    pub ok: bool,
    pub summary: String,
}

impl CheckReport {
    fn skipped(summary: &str) -> Self {
        Self {
            ran: false,
            ok: true,
            summary: summary.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyResult {
    pub ok: bool,
    pub checker: CheckReport,
    pub browser: CheckReport,
    pub artifacts_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifySettings {
    pub checker: Vec<String>,
    pub browser: Vec<String>,
    pub run_checker: bool,
    pub run_browser: bool,
    pub base_url: Option<String>,
    pub routes: Vec<String>,
    pub asserts_path: Option<PathBuf>,
    pub checker_timeout: Duration,
    pub browser_timeout: Duration,
}

impl VerifySettings {
    pub fn from_config(cfg: &VerifyConfig) -> Self {
        Self {
            checker: cfg.checker.clone(),
            browser: cfg.browser.clone(),
            run_checker: cfg.run_checker,
            run_browser: cfg.run_browser,
            base_url: cfg.base_url.clone(),
            routes: cfg.routes.clone(),
            asserts_path: None,
            checker_timeout: Duration::from_secs(cfg.checker_timeout_secs),
            browser_timeout: Duration::from_secs(cfg.browser_timeout_secs),
        }
    }
}

pub struct Verifier<'a> {
    sandbox: &'a CommandSandbox,
    workspace_root: &'a Path,
    artifacts: &'a ArtifactStore,
    baselines: &'a BaselineStore,
    settings: VerifySettings,
}

impl<'a> Verifier<'a> {
    pub fn new(
        sandbox: &'a CommandSandbox,
        workspace_root: &'a Path,
        artifacts: &'a ArtifactStore,
        baselines: &'a BaselineStore,
        settings: VerifySettings,
    ) -> Self {
        Self {
            sandbox,
            workspace_root,
            artifacts,
            baselines,
            settings,
        }
    }

    #[instrument(skip_all)]
    pub fn run(&self) -> Result<VerifyResult> {
        let artifacts_dir = self.artifacts.ensure_dir("verify")?;

        let checker = if self.settings.run_checker {
            self.run_checker()?
        } else {
            CheckReport::skipped("disabled")
        };
        let browser = if !self.settings.run_browser {
            CheckReport::skipped("disabled")
        } else if let Some(base_url) = self.settings.base_url.as_deref() {
            self.run_browser(base_url)?
        } else {
            CheckReport::skipped("skipped: no preview base URL")
        };

        let ok = checker.ok && browser.ok;
        info!(ok, checker_ok = checker.ok, browser_ok = browser.ok, "verification finished");
        Ok(VerifyResult {
            ok,
            checker,
            browser,
            artifacts_dir,
        })
    }

    /// Run the checker and overwrite the workspace baseline with its counts.
    pub fn regenerate_baseline(&self) -> Result<Baseline> {
        let result = self
            .sandbox
            .execute_with_timeout(&self.settings.checker, self.workspace_root, self.settings.checker_timeout)
            .context("run checker")?;
        self.artifacts
            .write_text("verify/checker.txt", &result.combined())?;
        let counts = count_issues(&result.stdout, &result.stderr);
        self.baselines.regenerate(self.workspace_root, counts)
    }

    fn run_checker(&self) -> Result<CheckReport> {
        let result = match self.sandbox.execute_with_timeout(
            &self.settings.checker,
            self.workspace_root,
            self.settings.checker_timeout,
        ) {
            Ok(result) => result,
            Err(err) => {
                warn!(err = %err, "checker did not run");
                self.artifacts
                    .write_text("verify/checker.txt", &format!("{err:#}\n"))?;
                return Ok(CheckReport {
                    ran: false,
                    ok: false,
                    summary: format!("checker did not run: {err:#}"),
                });
            }
        };
        self.artifacts
            .write_text("verify/checker.txt", &result.combined())?;

        let counts = count_issues(&result.stdout, &result.stderr);
        let (baseline, created) = self.baselines.get_or_create(self.workspace_root, counts)?;
        let ok = !counts.regressed_from(&baseline.counts);
        let summary = format!(
            "errors={} warnings={} (baseline errors={} warnings={}{}), exit={}",
            counts.errors,
            counts.warnings,
            baseline.counts.errors,
            baseline.counts.warnings,
            if created { ", baseline created" } else { "" },
            exit_label(&result),
        );
        Ok(CheckReport {
            ran: true,
            ok,
            summary,
        })
    }

    fn run_browser(&self, base_url: &str) -> Result<CheckReport> {
        let out_dir = self.artifacts.ensure_dir("verify/browser")?;
        let mut argv = self.settings.browser.clone();
        argv.push("--base-url".to_string());
        argv.push(base_url.to_string());
        argv.push("--out-dir".to_string());
        argv.push(out_dir.to_string_lossy().into_owned());
        if !self.settings.routes.is_empty() {
            argv.push("--routes".to_string());
            argv.push(self.settings.routes.join(","));
        }
        if let Some(asserts) = &self.settings.asserts_path {
            argv.push("--asserts".to_string());
            argv.push(asserts.to_string_lossy().into_owned());
        }

        let result = match self.sandbox.execute_with_timeout(
            &argv,
            self.workspace_root,
            self.settings.browser_timeout,
        ) {
            Ok(result) => result,
            Err(err) => {
                warn!(err = %err, "browser verifier did not run");
                return Ok(CheckReport {
                    ran: false,
                    ok: false,
                    summary: format!("browser verifier did not run: {err:#}"),
                });
            }
        };
        self.artifacts
            .write_text("verify/browser_stdout.txt", &result.stdout)?;
        self.artifacts
            .write_text("verify/browser_stderr.txt", &result.stderr)?;

        let ok = result.success();
        let summary = if ok {
            "ok".to_string()
        } else {
            format!("failed (exit={})", exit_label(&result))
        };
        Ok(CheckReport {
            ran: true,
            ok,
            summary,
        })
    }
}

fn exit_label(result: &CommandResult) -> String {
    result
        .exit_code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "signal".to_string())
}
