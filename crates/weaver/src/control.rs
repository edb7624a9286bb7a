//! Client for the hypervisor's QMP control socket.
//!
//! One request is in flight at a time; callers queue on a fair mutex, so
//! commands reach the hypervisor in the order they were issued. Every
//! request carries an id. A reply that arrives after its caller gave up is
//! recognised by its id, logged and dropped the next time the channel is
//! read. A closed socket marks the channel broken for good: nothing is
//! retried, since the hypervisor may already have applied the command.

use futures::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout_at};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, trace, warn};
use weaver_core::{ChannelStream, Error, Result};

const MAX_LINE_LENGTH: usize = 1024 * 1024;

#[derive(Serialize)]
struct Request<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
    id: u64,
}

#[derive(Deserialize)]
struct Message {
    #[serde(rename = "QMP")]
    greeting: Option<Value>,
    #[serde(rename = "return")]
    ret: Option<Value>,
    error: Option<QmpError>,
    event: Option<String>,
    id: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct QmpError {
    class: String,
    desc: String,
}

/// Run state reported by `query-status`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunStatus {
    pub status: String,
    pub running: bool,
}

pub struct ControlChannel {
    framed: Mutex<Framed<ChannelStream, LinesCodec>>,
    next_id: AtomicU64,
    broken: AtomicBool,
}

impl ControlChannel {
    /// Reads the greeting and negotiates capabilities.
    pub async fn connect(stream: ChannelStream, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        let line = match timeout_at(deadline, framed.next()).await {
            Err(_) => return Err(Error::Timeout("waiting for QMP greeting".to_string())),
            Ok(None) => return Err(Error::ProcessExited { exit_code: None }),
            Ok(Some(Err(e))) => return Err(Error::Control(format!("reading greeting: {e}"))),
            Ok(Some(Ok(line))) => line,
        };
        let greeting: Message = serde_json::from_str(&line)
            .map_err(|e| Error::Control(format!("malformed greeting: {e}")))?;
        if greeting.greeting.is_none() {
            return Err(Error::Control(format!("expected QMP greeting, got {line}")));
        }
        trace!(greeting = %line, "control greeting");

        let channel = Self {
            framed: Mutex::new(framed),
            next_id: AtomicU64::new(0),
            broken: AtomicBool::new(false),
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        channel
            .execute("qmp_capabilities", None, remaining)
            .await?;
        Ok(channel)
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Sends one command and waits up to `timeout` for its reply.
    pub async fn execute(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let mut framed = self.framed.lock().await;
        if self.is_broken() {
            return Err(Error::ProcessExited { exit_code: None });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;
        let request = serde_json::to_string(&Request {
            execute: command,
            arguments,
            id,
        })
        .map_err(|e| Error::Control(e.to_string()))?;

        debug!(command, id, "control request");
        match timeout_at(deadline, framed.send(request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.disconnected(command, &e)),
            Err(_) => {
                // A partially written request cannot be recovered from.
                self.broken.store(true, Ordering::SeqCst);
                return Err(Error::Timeout(format!("sending control command '{command}'")));
            }
        }

        loop {
            let line = match timeout_at(deadline, framed.next()).await {
                Ok(Some(Ok(line))) => line,
                Ok(Some(Err(e))) => return Err(self.disconnected(command, &e)),
                Ok(None) => return Err(self.disconnected(command, &"socket closed")),
                Err(_) => {
                    warn!(command, id, ?timeout, "control command timed out");
                    return Err(Error::Timeout(format!(
                        "control command '{command}' after {timeout:?}"
                    )));
                }
            };

            let message: Message = match serde_json::from_str(&line) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, %line, "ignoring malformed control message");
                    continue;
                }
            };

            if let Some(event) = message.event {
                debug!(event, "control event");
                continue;
            }

            let reply_id = message.id.as_ref().and_then(Value::as_u64);
            if reply_id != Some(id) {
                warn!(expected = id, reply = ?reply_id, "discarding late control reply");
                continue;
            }

            if let Some(error) = message.error {
                debug!(command, id, class = %error.class, "control command failed");
                return Err(Error::Control(format!(
                    "{command}: {} ({})",
                    error.desc, error.class
                )));
            }
            trace!(command, id, "control reply");
            return Ok(message.ret.unwrap_or(Value::Null));
        }
    }

    /// Runs a human monitor command and returns its textual output.
    pub async fn human_monitor(&self, command_line: &str, timeout: Duration) -> Result<String> {
        let output = self
            .execute(
                "human-monitor-command",
                Some(json!({ "command-line": command_line })),
                timeout,
            )
            .await?;
        Ok(output.as_str().unwrap_or_default().to_string())
    }

    pub async fn query_status(&self, timeout: Duration) -> Result<RunStatus> {
        let value = self.execute("query-status", None, timeout).await?;
        serde_json::from_value(value).map_err(|e| Error::Control(format!("query-status: {e}")))
    }

    fn disconnected(&self, command: &str, cause: &dyn std::fmt::Display) -> Error {
        self.broken.store(true, Ordering::SeqCst);
        debug!(command, %cause, "control channel disconnected");
        Error::ProcessExited { exit_code: None }
    }
}
