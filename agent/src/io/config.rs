//! Agent configuration stored in `agent.toml`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::plan::PlanPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "agent.toml";

/// Agent configuration (TOML).
///
/// Every section is optional; missing fields default to values suited to a
/// Shopify theme workspace. Secrets never live here: the model API key is read
/// from the environment only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AgentConfig {
    pub workspace: WorkspaceConfig,
    pub plan: PlanPolicy,
    pub commands: CommandsConfig,
    #[serde(rename = "loop")]
    pub run_loop: LoopConfig,
    pub model: ModelConfig,
    pub bridges: Vec<BridgeConfig>,
    pub verify: VerifyConfig,
    pub preview: PreviewConfig,
    pub human: HumanConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Top-level directories the agent may read and write.
    pub allowed_top_dirs: Vec<String>,
    /// Directories a workspace is expected to have; absence is only warned about.
    pub required_dirs: Vec<String>,
    /// Extensions refused for writes under `asset_dir`.
    pub blocked_asset_exts: Vec<String>,
    pub asset_dir: String,
    pub inline_data_marker: String,
    /// Writes containing `inline_data_marker` are refused above this size.
    pub inline_data_limit_bytes: usize,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            allowed_top_dirs: strings(&[
                "sections",
                "snippets",
                "blocks",
                "templates",
                "layout",
                "assets",
                "config",
                "locales",
            ]),
            required_dirs: strings(&["sections", "snippets", "templates", "config"]),
            blocked_asset_exts: strings(&[
                ".png", ".jpg", ".jpeg", ".webp", ".gif", ".avif", ".svg", ".mp4", ".mov",
                ".webm", ".mp3", ".wav", ".pdf",
            ]),
            asset_dir: "assets".to_string(),
            inline_data_marker: "data:image/".to_string(),
            inline_data_limit_bytes: 50_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandsConfig {
    /// Argv prefixes the sandbox will launch, compared element by element.
    pub allowed_prefixes: Vec<Vec<String>>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    pub search_output_limit_chars: usize,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            allowed_prefixes: vec![
                strings(&["shopify", "theme", "check"]),
                strings(&["shopify", "theme", "dev"]),
                strings(&["shopify", "theme", "info"]),
                strings(&["shopify", "theme", "list"]),
                strings(&["rg"]),
                strings(&["node", "/app/agent/verify/verify.js"]),
                strings(&["node", "/app/agent/verify/visual_diff.js"]),
            ],
            timeout_secs: 180,
            output_limit_bytes: 1_000_000,
            search_output_limit_chars: 40_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    pub max_iters: u32,
    pub max_tool_round_trips: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iters: 12,
            max_tool_round_trips: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4.1-mini".to_string(),
            temperature: 0.2,
            timeout_secs: 90,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl ModelConfig {
    /// Apply `OPENAI_BASE_URL`, `OPENAI_MODEL` and `OPENAI_TEMPERATURE` overrides.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(base_url) = lookup("OPENAI_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.base_url = base_url.trim().to_string();
        }
        if let Some(model) = lookup("OPENAI_MODEL").filter(|v| !v.trim().is_empty()) {
            self.model = model.trim().to_string();
        }
        if let Some(raw) = lookup("OPENAI_TEMPERATURE").filter(|v| !v.trim().is_empty()) {
            self.temperature = raw
                .trim()
                .parse()
                .with_context(|| format!("parse OPENAI_TEMPERATURE={raw:?}"))?;
        }
        Ok(())
    }
}

/// A JSON-RPC tool bridge launched as a subprocess for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Used in tool names (`bridge_<name>_call`); lowercase letters, digits and `_`.
    pub name: String,
    pub command: Vec<String>,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Extra environment for the bridge process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_protocol_version() -> String {
    "2025-11-25".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Static checker argv, run from the workspace root.
    pub checker: Vec<String>,
    /// Browser verifier argv prefix; run arguments are appended.
    pub browser: Vec<String>,
    pub run_checker: bool,
    pub run_browser: bool,
    pub routes: Vec<String>,
    pub base_url: Option<String>,
    pub checker_timeout_secs: u64,
    pub browser_timeout_secs: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            checker: strings(&["shopify", "theme", "check"]),
            browser: strings(&["node", "/app/agent/verify/verify.js"]),
            run_checker: true,
            run_browser: true,
            routes: strings(&["/"]),
            base_url: None,
            checker_timeout_secs: 600,
            browser_timeout_secs: 600,
        }
    }
}

/// Optional long-lived preview server (for example `shopify theme dev`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PreviewConfig {
    /// Empty disables the preview server.
    pub command: Vec<String>,
    pub base_url: Option<String>,
    pub startup_wait_ms: u64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            base_url: None,
            startup_wait_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HumanConfig {
    /// File name, relative to the tasks directory, polled for the resume keyword.
    pub signal_file: String,
    pub resume_keyword: String,
    pub poll_interval_ms: u64,
}

impl Default for HumanConfig {
    fn default() -> Self {
        Self {
            signal_file: "continue.txt".to_string(),
            resume_keyword: "continue".to_string(),
            poll_interval_ms: 2_000,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workspace.allowed_top_dirs.is_empty() {
            return Err(anyhow!("workspace.allowed_top_dirs must not be empty"));
        }
        if self
            .workspace
            .allowed_top_dirs
            .iter()
            .any(|d| d.trim().is_empty() || d.contains('/') || d == "..")
        {
            return Err(anyhow!(
                "workspace.allowed_top_dirs entries must be single directory names"
            ));
        }
        if self.plan.max_ops == 0 {
            return Err(anyhow!("plan.max_ops must be > 0"));
        }
        if self.commands.timeout_secs == 0 {
            return Err(anyhow!("commands.timeout_secs must be > 0"));
        }
        if self.commands.output_limit_bytes == 0 || self.commands.search_output_limit_chars == 0 {
            return Err(anyhow!("commands output limits must be > 0"));
        }
        if self
            .commands
            .allowed_prefixes
            .iter()
            .any(|p| p.is_empty() || p[0].trim().is_empty())
        {
            return Err(anyhow!(
                "commands.allowed_prefixes entries must be non-empty arrays"
            ));
        }
        if self.run_loop.max_iters == 0 {
            return Err(anyhow!("loop.max_iters must be > 0"));
        }
        if self.run_loop.max_tool_round_trips == 0 {
            return Err(anyhow!("loop.max_tool_round_trips must be > 0"));
        }
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(anyhow!("model.temperature must be within 0.0..=2.0"));
        }
        if self.verify.run_checker && self.verify.checker.is_empty() {
            return Err(anyhow!("verify.checker must be set when run_checker is true"));
        }
        if self.verify.run_browser && self.verify.browser.is_empty() {
            return Err(anyhow!("verify.browser must be set when run_browser is true"));
        }
        if self.human.resume_keyword.trim().is_empty() {
            return Err(anyhow!("human.resume_keyword must not be empty"));
        }
        if self.human.poll_interval_ms == 0 {
            return Err(anyhow!("human.poll_interval_ms must be > 0"));
        }
        let mut names = BTreeSet::new();
        for bridge in &self.bridges {
            let valid_name = !bridge.name.is_empty()
                && bridge
                    .name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
            if !valid_name {
                return Err(anyhow!(
                    "bridge name {:?} must use lowercase letters, digits and '_'",
                    bridge.name
                ));
            }
            if !names.insert(bridge.name.as_str()) {
                return Err(anyhow!("duplicate bridge name {:?}", bridge.name));
            }
            if bridge.command.is_empty() || bridge.command[0].trim().is_empty() {
                return Err(anyhow!("bridge {:?} command must be a non-empty array", bridge.name));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
