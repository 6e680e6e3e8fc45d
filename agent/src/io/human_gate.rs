//! Blocking pause until a human writes the resume keyword into a signal file.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::io::config::HumanConfig;

#[derive(Debug, Clone)]
pub struct HumanGate {
    signal_path: PathBuf,
    keyword: String,
    poll_interval: Duration,
}

impl HumanGate {
    pub fn new(signal_path: PathBuf, keyword: &str, poll_interval: Duration) -> Self {
        Self {
            signal_path,
            keyword: keyword.to_string(),
            poll_interval,
        }
    }

    /// Gate polling `<tasks_dir>/<signal_file>`.
    pub fn from_config(tasks_dir: &Path, cfg: &HumanConfig) -> Self {
        Self::new(
            tasks_dir.join(&cfg.signal_file),
            &cfg.resume_keyword,
            Duration::from_millis(cfg.poll_interval_ms),
        )
    }

    pub fn signal_path(&self) -> &Path {
        &self.signal_path
    }

    /// Block until the signal file mentions the keyword, clear it and return the
    /// remaining text.
    ///
    /// There is no timeout; only the signal (or killing the process) ends the wait.
    pub fn wait_for_resume(&self) -> Result<String> {
        info!(
            signal = %self.signal_path.display(),
            keyword = %self.keyword,
            "waiting for human resume signal"
        );
        loop {
            match fs::read_to_string(&self.signal_path) {
                Ok(text) => {
                    if let Some(notes) = take_resume_notes(&text, &self.keyword) {
                        fs::write(&self.signal_path, "").with_context(|| {
                            format!("clear signal file {}", self.signal_path.display())
                        })?;
                        info!("resume signal received");
                        return Ok(notes);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(err = %err, signal = %self.signal_path.display(), "failed to read signal file");
                }
            }
            debug!("no resume signal yet");
            thread::sleep(self.poll_interval);
        }
    }
}

/// If `text` contains `keyword` (any case), return the text with every
/// occurrence removed and whitespace tidied. `None` means keep waiting.
pub fn take_resume_notes(text: &str, keyword: &str) -> Option<String> {
    let keyword = keyword.trim();
    if keyword.is_empty() {
        return None;
    }
    let pattern = Regex::new(&format!("(?i){}", regex::escape(keyword))).ok()?;
    if !pattern.is_match(text) {
        return None;
    }
    let stripped = pattern.replace_all(text, "");
    let lines: Vec<String> = stripped
        .lines()
        .map(tidy_line)
        .filter(|line| !line.is_empty())
        .collect();
    Some(lines.join("\n"))
}

const PUNCTUATION: [char; 6] = [',', '.', ';', ':', '!', '?'];

/// Collapse runs of spaces, drop spaces left in front of punctuation and
/// punctuation left at the start of the line.
fn tidy_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    for word in line.split_whitespace() {
        if !out.is_empty() && !word.starts_with(PUNCTUATION) {
            out.push(' ');
        }
        out.push_str(word);
    }
    out.trim_start_matches(PUNCTUATION).trim_start().to_string()
}
