//! Test-only helpers: a scripted model, a recording observer and a throwaway
//! theme workspace.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tempfile::TempDir;

use crate::core::decision::Decision;
use crate::core::types::{Message, ToolCall, ToolCallResult, ToolSpec};
use crate::io::config::AgentConfig;
use crate::io::llm::{AssistantTurn, ChatModel};
use crate::observer::RunObserver;
use crate::session::SessionPaths;

/// Model that replays queued turns and records every request it receives.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    turns: RefCell<VecDeque<AssistantTurn>>,
    requests: RefCell<Vec<Vec<Message>>>,
    tool_names: RefCell<Vec<Vec<String>>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<AssistantTurn>) -> Self {
        Self {
            turns: RefCell::new(turns.into()),
            ..Self::default()
        }
    }

    /// Conversation snapshots, one per model request.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.borrow().clone()
    }

    /// Tool names advertised on each request.
    pub fn tool_names(&self) -> Vec<Vec<String>> {
        self.tool_names.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.turns.borrow().len()
    }
}

impl ChatModel for ScriptedModel {
    fn complete(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<AssistantTurn> {
        self.requests.borrow_mut().push(messages.to_vec());
        self.tool_names
            .borrow_mut()
            .push(tools.iter().map(|t| t.name.clone()).collect());
        match self.turns.borrow_mut().pop_front() {
            Some(turn) => Ok(turn),
            None => bail!("scripted model has no more turns"),
        }
    }
}

/// Turn requesting the given tool calls, with ids `call_1`, `call_2`, ...
pub fn tool_turn(calls: Vec<(&str, Value)>) -> AssistantTurn {
    AssistantTurn {
        content: String::new(),
        tool_calls: calls
            .into_iter()
            .enumerate()
            .map(|(i, (name, args))| ToolCall::new(format!("call_{}", i + 1), name, &args))
            .collect(),
    }
}

/// Content-only turn.
pub fn text_turn(content: &str) -> AssistantTurn {
    AssistantTurn {
        content: content.to_string(),
        tool_calls: Vec::new(),
    }
}

/// Content-only turn carrying a JSON decision.
pub fn decision_turn(decision: Value) -> AssistantTurn {
    text_turn(&decision.to_string())
}

/// Observer keeping a flat event log such as `"iteration 1"` or `"tool plan_apply ok"`.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: RefCell<Vec<String>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    fn push(&self, event: String) {
        self.events.borrow_mut().push(event);
    }
}

impl RunObserver for RecordingObserver {
    fn on_iteration(&self, iteration: u32, _max_iters: u32) {
        self.push(format!("iteration {iteration}"));
    }

    fn on_tool_call(&self, name: &str, result: &ToolCallResult) {
        let status = if result.ok { "ok" } else { "failed" };
        self.push(format!("tool {name} {status}"));
    }

    fn on_decision(&self, _iteration: u32, decision: &Decision) {
        self.push(format!("decision {}", decision.status()));
    }

    fn on_paused(&self, _admin_steps: &Path) {
        self.push("paused".to_string());
    }
}

/// Temporary directory holding `theme/`, `tasks/` and `runs/`.
///
/// The theme starts with the required directories and a small header section.
pub struct TestWorkspace {
    temp: TempDir,
}

pub const HEADER_SECTION: &str = "<header class=\"site-header\">\n  {{ shop.name }}\n</header>\n";

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let workspace = Self { temp };
        for dir in ["sections", "snippets", "templates", "config", "assets"] {
            fs::create_dir_all(workspace.theme().join(dir))
                .with_context(|| format!("create theme dir {dir}"))?;
        }
        fs::create_dir_all(workspace.tasks()).context("create tasks dir")?;
        workspace.write_theme_file("sections/header.liquid", HEADER_SECTION)?;
        workspace.write_theme_file("templates/index.json", "{\"sections\": {}}\n")?;
        workspace.write_task("Add an announcement line below the header.")?;
        Ok(workspace)
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn theme(&self) -> PathBuf {
        self.temp.path().join("theme")
    }

    pub fn tasks(&self) -> PathBuf {
        self.temp.path().join("tasks")
    }

    pub fn runs(&self) -> PathBuf {
        self.temp.path().join("runs")
    }

    pub fn paths(&self) -> SessionPaths {
        SessionPaths {
            workdir: self.theme(),
            tasks_dir: self.tasks(),
            runs_dir: self.runs(),
        }
    }

    pub fn write_theme_file(&self, rel: &str, content: &str) -> Result<()> {
        let path = self.theme().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content).with_context(|| format!("write {}", path.display()))
    }

    pub fn read_theme_file(&self, rel: &str) -> Result<String> {
        let path = self.theme().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn write_task(&self, text: &str) -> Result<()> {
        self.write_task_file(crate::io::task::TASK_FILE, text)
    }

    pub fn write_task_file(&self, name: &str, text: &str) -> Result<()> {
        let path = self.tasks().join(name);
        fs::write(&path, text).with_context(|| format!("write {}", path.display()))
    }

    /// The single run directory created under `runs/`.
    pub fn only_run_dir(&self) -> Result<PathBuf> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(self.runs()).context("read runs dir")? {
            let entry = entry?;
            if entry.file_type()?.is_dir() && entry.file_name() != "baselines" {
                dirs.push(entry.path());
            }
        }
        match dirs.as_slice() {
            [dir] => Ok(dir.clone()),
            other => bail!("expected one run dir, found {}", other.len()),
        }
    }

    /// Offline configuration: no checker, no browser, fast human polling.
    pub fn config(&self) -> AgentConfig {
        let mut cfg = AgentConfig::default();
        cfg.verify.run_checker = false;
        cfg.verify.run_browser = false;
        cfg.human.poll_interval_ms = 10;
        cfg.run_loop.max_iters = 4;
        cfg.run_loop.max_tool_round_trips = 6;
        cfg
    }
}
