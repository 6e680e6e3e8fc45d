//! Line-delimited JSON-RPC 2.0 client for tool bridges running as subprocesses.
//!
//! One request is in flight at a time: the session lock covers id allocation,
//! the write and the single response-line read.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;
use std::thread;

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::io::config::BridgeConfig;

pub const CLIENT_NAME: &str = "agent";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("{peer}: failed to start: {reason}")]
    Spawn { peer: String, reason: String },
    #[error("{peer}: failed to send {method}: {reason}")]
    Write {
        peer: String,
        method: String,
        reason: String,
    },
    #[error("{peer}: failed to read response to {method}: {reason}")]
    Read {
        peer: String,
        method: String,
        reason: String,
    },
    #[error("{peer}: no response to {method} (peer closed its output)")]
    Closed { peer: String, method: String },
    #[error("{peer}: invalid JSON in response to {method}: {reason}")]
    InvalidJson {
        peer: String,
        method: String,
        reason: String,
    },
    #[error("{peer}: response id mismatch for {method} (expected {expected}, got {got})")]
    IdMismatch {
        peer: String,
        method: String,
        expected: u64,
        got: String,
    },
    #[error("{peer}: {method} failed: {error}")]
    Remote {
        peer: String,
        method: String,
        error: String,
    },
    #[error("{peer}: response to {method} has no result")]
    MissingResult { peer: String, method: String },
    #[error("{peer}: session lock poisoned")]
    Poisoned { peer: String },
}

struct Session<W, R> {
    writer: W,
    reader: R,
    next_id: u64,
}

pub struct ProtocolClient<W = ChildStdin, R = BufReader<ChildStdout>> {
    name: String,
    session: Mutex<Session<W, R>>,
    child: Option<Child>,
}

impl ProtocolClient {
    /// Spawn the bridge process and complete the `initialize` handshake.
    #[instrument(skip_all, fields(bridge = %cfg.name))]
    pub fn spawn(cfg: &BridgeConfig) -> Result<Self, ProtocolError> {
        let spawn_err = |reason: String| ProtocolError::Spawn {
            peer: cfg.name.clone(),
            reason,
        };
        let (program, args) = cfg
            .command
            .split_first()
            .ok_or_else(|| spawn_err("empty command".to_string()))?;
        let mut child = Command::new(program)
            .args(args)
            .envs(&cfg.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_err(format!("spawn {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err("stdin was not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("stdout was not piped".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            let peer = cfg.name.clone();
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    debug!(bridge = %peer, "{line}");
                }
            });
        }

        let mut client = Self::from_streams(&cfg.name, stdin, BufReader::new(stdout));
        client.child = Some(child);
        client.initialize(&cfg.protocol_version)?;
        info!("bridge initialized");
        Ok(client)
    }

    /// Terminate the bridge process.
    pub fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!(bridge = %self.name, err = %e, "bridge already exited");
            }
            if let Err(e) = child.wait() {
                warn!(bridge = %self.name, err = %e, "failed to reap bridge process");
            }
        }
    }
}

impl<W, R> Drop for ProtocolClient<W, R> {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl<W: Write, R: BufRead> ProtocolClient<W, R> {
    /// Client over arbitrary streams; no handshake is performed.
    pub fn from_streams(name: &str, writer: W, reader: R) -> Self {
        Self {
            name: name.to_string(),
            session: Mutex::new(Session {
                writer,
                reader,
                next_id: 1,
            }),
            child: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `initialize` request followed by the `notifications/initialized` notification.
    pub fn initialize(&self, protocol_version: &str) -> Result<Value, ProtocolError> {
        let result = self.request(
            "initialize",
            json!({
                "protocolVersion": protocol_version,
                "capabilities": {},
                "clientInfo": { "name": CLIENT_NAME, "version": CLIENT_VERSION },
            }),
        )?;
        self.notify("notifications/initialized", json!({}))?;
        Ok(result)
    }

    /// `tools/list`; returns the `tools` array (empty when absent).
    pub fn list_tools(&self) -> Result<Vec<Value>, ProtocolError> {
        let result = self.request("tools/list", json!({}))?;
        Ok(result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ProtocolError> {
        self.request("tools/call", json!({ "name": name, "arguments": arguments }))
    }

    #[instrument(skip_all, fields(bridge = %self.name, method = %method))]
    pub fn request(&self, method: &str, params: Value) -> Result<Value, ProtocolError> {
        let mut session = self.lock()?;
        let id = session.next_id;
        session.next_id += 1;

        let message = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        self.send(&mut session.writer, method, &message)?;

        let mut line = String::new();
        let read = session
            .reader
            .read_line(&mut line)
            .map_err(|e| ProtocolError::Read {
                peer: self.name.clone(),
                method: method.to_string(),
                reason: e.to_string(),
            })?;
        if read == 0 {
            return Err(ProtocolError::Closed {
                peer: self.name.clone(),
                method: method.to_string(),
            });
        }
        drop(session);

        let response: Value =
            serde_json::from_str(line.trim()).map_err(|e| ProtocolError::InvalidJson {
                peer: self.name.clone(),
                method: method.to_string(),
                reason: e.to_string(),
            })?;
        if let Some(got) = response.get("id")
            && got.as_u64() != Some(id)
        {
            return Err(ProtocolError::IdMismatch {
                peer: self.name.clone(),
                method: method.to_string(),
                expected: id,
                got: got.to_string(),
            });
        }
        if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
            let text = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(ProtocolError::Remote {
                peer: self.name.clone(),
                method: method.to_string(),
                error: text,
            });
        }
        match response.get("result") {
            Some(result) if !result.is_null() => {
                debug!(id, "response received");
                Ok(result.clone())
            }
            _ => Err(ProtocolError::MissingResult {
                peer: self.name.clone(),
                method: method.to_string(),
            }),
        }
    }

    pub fn notify(&self, method: &str, params: Value) -> Result<(), ProtocolError> {
        let mut session = self.lock()?;
        let message = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.send(&mut session.writer, method, &message)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Session<W, R>>, ProtocolError> {
        self.session.lock().map_err(|_| ProtocolError::Poisoned {
            peer: self.name.clone(),
        })
    }

    fn send(&self, writer: &mut W, method: &str, message: &Value) -> Result<(), ProtocolError> {
        let write_err = |e: std::io::Error| ProtocolError::Write {
            peer: self.name.clone(),
            method: method.to_string(),
            reason: e.to_string(),
        };
        let mut line = message.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).map_err(write_err)?;
        writer.flush().map_err(write_err)
    }
}
