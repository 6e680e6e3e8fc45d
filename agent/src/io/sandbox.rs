//! Allow-listed command execution.
//!
//! [`CommandSandbox`] is the only place the agent launches executables. The
//! argv prefix check runs before any process is created; output is captured
//! concurrently (bounded in memory). Each command runs in its own process
//! group, and the whole group is killed on timeout.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::config::CommandsConfig;

/// How long output pipes may stay open after the command itself exited.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

type StreamOutput = Result<(Vec<u8>, usize)>;

/// Refusal to launch a command whose argv matches no allowed prefix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "command not allowed: {}; allowed prefixes: {}",
    .argv.join(" "),
    .allowed.join(" | ")
)]
pub struct CommandNotAllowed {
    pub argv: Vec<String>,
    pub allowed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("command timed out after {}s: {}", .timeout.as_secs(), .argv.join(" "))]
pub struct CommandTimedOut {
    pub argv: Vec<String>,
    pub timeout: Duration,
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, with truncation notices.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        if self.stdout_truncated > 0 {
            text.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        if self.stderr_truncated > 0 {
            text.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        text
    }
}

#[derive(Debug, Clone)]
pub struct CommandSandbox {
    allowed_prefixes: Vec<Vec<String>>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandSandbox {
    pub fn new(allowed_prefixes: Vec<Vec<String>>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            allowed_prefixes,
            timeout,
            output_limit_bytes,
        }
    }

    pub fn from_config(cfg: &CommandsConfig) -> Self {
        Self::new(
            cfg.allowed_prefixes.clone(),
            Duration::from_secs(cfg.timeout_secs),
            cfg.output_limit_bytes,
        )
    }

    /// Fail with [`CommandNotAllowed`] unless `argv` starts with an allowed prefix.
    pub fn check(&self, argv: &[String]) -> Result<(), CommandNotAllowed> {
        if is_allowed(argv, &self.allowed_prefixes) {
            return Ok(());
        }
        Err(CommandNotAllowed {
            argv: argv.to_vec(),
            allowed: self.allowed_prefixes.iter().map(|p| p.join(" ")).collect(),
        })
    }

    /// Run `argv` in `cwd` with the sandbox's default timeout.
    pub fn execute(&self, argv: &[String], cwd: &Path) -> Result<CommandResult> {
        self.execute_with_timeout(argv, cwd, self.timeout)
    }

    #[instrument(skip_all, fields(program = argv.first().map(String::as_str), timeout_secs = timeout.as_secs()))]
    pub fn execute_with_timeout(
        &self,
        argv: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<CommandResult> {
        self.check(argv)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty argv"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        own_process_group(&mut cmd);

        debug!(cwd = %cwd.display(), "spawning sandboxed command");
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, program = %program, "failed to spawn command");
                return Err(e).with_context(|| format!("spawn {program}"));
            }
        };
        let pgid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let limit = self.output_limit_bytes;
        let stdout_rx = spawn_reader(stdout, limit);
        let stderr_rx = spawn_reader(stderr, limit);

        let status = match child.wait_timeout(timeout).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!(timeout_secs = timeout.as_secs(), "command timed out, killing its process group");
                kill_group(pgid);
                if let Err(err) = child.kill() {
                    debug!(err = %err, "command already gone after group kill");
                }
                child.wait().context("wait command after kill")?;
                // Readers are detached; a descendant that left the group may still hold the pipes.
                return Err(CommandTimedOut {
                    argv: argv.to_vec(),
                    timeout,
                }
                .into());
            }
        };

        let mut stdout = recv_output(&stdout_rx, Instant::now() + PIPE_DRAIN_GRACE);
        let mut stderr = recv_output(&stderr_rx, Instant::now() + PIPE_DRAIN_GRACE);
        if stdout.is_none() || stderr.is_none() {
            // A still-open pipe means a descendant is alive, so the group id is still ours.
            warn!("command left processes holding its output, killing its process group");
            kill_group(pgid);
            let deadline = Instant::now() + PIPE_DRAIN_GRACE;
            stdout = stdout.or_else(|| recv_output(&stdout_rx, deadline));
            stderr = stderr.or_else(|| recv_output(&stderr_rx, deadline));
        }
        let (stdout, stdout_truncated) = stdout
            .ok_or_else(|| anyhow!("stdout still open after killing the process group"))?
            .context("read stdout")?;
        let (stderr, stderr_truncated) = stderr
            .ok_or_else(|| anyhow!("stderr still open after killing the process group"))?
            .context("read stderr")?;
        if stdout_truncated > 0 || stderr_truncated > 0 {
            warn!(stdout_truncated, stderr_truncated, "output truncated");
        }

        debug!(exit_code = ?status.code(), "command finished");
        Ok(CommandResult {
            exit_code: status.code(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            stdout_truncated,
            stderr_truncated,
        })
    }

    /// Start a long-lived allow-listed process with output sent to `log_path`.
    #[instrument(skip_all, fields(program = argv.first().map(String::as_str)))]
    pub fn spawn_background(&self, argv: &[String], cwd: &Path, log_path: &Path) -> Result<Child> {
        self.check(argv)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty argv"))?;
        let log = File::create(log_path)
            .with_context(|| format!("create {}", log_path.display()))?;
        let log_err = log
            .try_clone()
            .with_context(|| format!("clone handle {}", log_path.display()))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        own_process_group(&mut cmd);
        let child = cmd.spawn().with_context(|| format!("spawn {program}"))?;
        debug!(pid = child.id(), "background process started");
        Ok(child)
    }
}

/// Element-wise prefix match of `argv` against any allowed prefix.
pub fn is_allowed(argv: &[String], allowed_prefixes: &[Vec<String>]) -> bool {
    if argv.is_empty() {
        return false;
    }
    allowed_prefixes
        .iter()
        .any(|prefix| !prefix.is_empty() && argv.len() >= prefix.len() && argv[..prefix.len()] == prefix[..])
}

/// Kill every process in the group led by `pgid`. Missing groups are ignored.
#[cfg(unix)]
pub(crate) fn kill_group(pgid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        warn!(pgid, "process group id out of range");
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pgid, err = %err, "process group already gone");
    }
}

#[cfg(not(unix))]
pub(crate) fn kill_group(_pgid: u32) {}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> Receiver<StreamOutput> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver is gone when the command timed out.
        let _ = tx.send(read_stream_limited(reader, limit));
    });
    rx
}

/// `None` while the stream is still open at `deadline`.
fn recv_output(rx: &Receiver<StreamOutput>, deadline: Instant) -> Option<StreamOutput> {
    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(output) => Some(output),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => Some(Err(anyhow!("output reader thread exited"))),
    }
}

/// Drain `reader`, keeping at most `limit` bytes and counting the rest.
fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> StreamOutput {
    let mut buf = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..keep]);
        dropped += n - keep;
    }

    Ok((buf, dropped))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn prefix_match_is_element_wise() {
        let allowed = vec![argv(&["shopify", "theme", "check"]), argv(&["rg"])];
        assert!(is_allowed(&argv(&["shopify", "theme", "check", "--json"]), &allowed));
        assert!(is_allowed(&argv(&["rg", "-n", "x"]), &allowed));
        assert!(!is_allowed(&argv(&["shopify", "theme"]), &allowed));
        assert!(!is_allowed(&argv(&["shopify", "theme", "checkout"]), &allowed));
        assert!(!is_allowed(&argv(&["rgx"]), &allowed));
        assert!(!is_allowed(&[], &allowed));
        assert!(!is_allowed(&argv(&["ls"]), &[Vec::new()]));
    }

    #[test]
    fn exact_prefix_allows_only_that_command() {
        let sandbox = CommandSandbox::new(vec![argv(&["rg", "--version"])], Duration::from_secs(5), 1024);
        assert!(sandbox.check(&argv(&["rg", "--version"])).is_ok());
        let refusal = sandbox
            .check(&argv(&["git", "--version"]))
            .expect_err("git is not allowed");
        assert_eq!(refusal.argv, argv(&["git", "--version"]));
        assert!(sandbox.check(&argv(&["rg"])).is_err());
        assert!(sandbox.check(&argv(&["rg", "-n", "x"])).is_err());
    }

    #[test]
    fn rejection_happens_before_spawn() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("created");
        let sandbox = CommandSandbox::new(vec![argv(&["git", "--version"])], Duration::from_secs(5), 1024);
        let err = sandbox
            .execute(&argv(&["touch", marker.to_str().expect("utf8")]), temp.path())
            .expect_err("not allowed");
        let refusal = err.downcast_ref::<CommandNotAllowed>().expect("typed refusal");
        assert_eq!(refusal.allowed, vec!["git --version".to_string()]);
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[test]
    fn captures_output_and_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = CommandSandbox::new(vec![argv(&["sh", "-c"])], Duration::from_secs(10), 1024);
        let result = sandbox
            .execute(&argv(&["sh", "-c", "echo out; echo err >&2; exit 3"]), temp.path())
            .expect("execute");
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert!(!result.success());
    }

    #[cfg(unix)]
    #[test]
    fn output_beyond_limit_is_counted_not_kept() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = CommandSandbox::new(vec![argv(&["sh"])], Duration::from_secs(10), 4);
        let result = sandbox
            .execute(&argv(&["sh", "-c", "printf 0123456789"]), temp.path())
            .expect("execute");
        assert_eq!(result.stdout, "0123");
        assert_eq!(result.stdout_truncated, 6);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_and_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = CommandSandbox::new(vec![argv(&["sleep"])], Duration::from_millis(200), 1024);
        let err = sandbox
            .execute(&argv(&["sleep", "5"]), temp.path())
            .expect_err("timeout");
        assert!(err.downcast_ref::<CommandTimedOut>().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_descendants_and_returns_promptly() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = CommandSandbox::new(vec![argv(&["sh", "-c"])], Duration::from_millis(200), 1024);
        let started = Instant::now();
        let err = sandbox
            .execute(&argv(&["sh", "-c", "sleep 5; echo x"]), temp.path())
            .expect_err("timeout");
        assert!(err.downcast_ref::<CommandTimedOut>().is_some());
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }

    #[cfg(unix)]
    #[test]
    fn background_descendant_does_not_hold_the_call_open() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = CommandSandbox::new(vec![argv(&["sh", "-c"])], Duration::from_secs(10), 1024);
        let started = Instant::now();
        let result = sandbox
            .execute(&argv(&["sh", "-c", "sleep 30 & echo started"]), temp.path())
            .expect("execute");
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "started\n");
        assert!(started.elapsed() < Duration::from_secs(8), "took {:?}", started.elapsed());
    }
}
