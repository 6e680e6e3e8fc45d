//! System prompt rendering.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::io::task::TaskBundle;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");

/// Everything the system prompt mentions besides the task bundle.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub task: &'a TaskBundle,
    pub workspace_summary_json: &'a str,
    pub base_url: Option<&'a str>,
    pub routes: &'a [String],
    pub run_checker: bool,
    pub run_browser: bool,
    pub allowed_dirs: &'a [String],
    pub max_ops: usize,
    pub min_justification_chars: usize,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        Self { env }
    }

    pub fn render_system(&self, input: &PromptInputs<'_>) -> Result<String> {
        let template = self.env.get_template("system")?;
        let trimmed = |s: &Option<String>| {
            s.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let routes = if input.routes.is_empty() {
            "(none)".to_string()
        } else {
            input.routes.join(", ")
        };
        let rendered = template
            .render(context! {
                allowed_dirs => input.allowed_dirs.join(", "),
                architecture_rules => trimmed(&input.task.architecture_rules),
                base_url => input.base_url.unwrap_or("(not running)"),
                routes => routes,
                run_checker => input.run_checker,
                run_browser => input.run_browser,
                task => input.task.task.trim(),
                context => trimmed(&input.task.context),
                mid_task_changes => trimmed(&input.task.mid_task_changes),
                workspace_summary => input.workspace_summary_json.trim(),
                max_ops => input.max_ops,
                min_justification_chars => input.min_justification_chars,
            })
            .context("render system prompt")?;
        Ok(rendered)
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}
