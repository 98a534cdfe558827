//! Control plane: newline-delimited JSON commands on stdin, events on
//! stdout.
//!
//! A supervising process reads the token a host publishes, follows sessions
//! coming and going, and can ask for a session list, drop a session or stop
//! the tunnel:
//!
//! ```text
//! → {"action":"TOKEN","token":"..."}
//! → {"action":"CONNECTED","session_id":"...","addr":"..."}
//! ← {"action":"LIST"}
//! → {"action":"LIST","sessions":["..."]}
//! ← {"action":"DISCONNECT","session_id":"..."}
//! → {"action":"DISCONNECT","session_id":"..."}
//! ← {"action":"SHUTDOWN"}
//! ```
//!
//! Logs never go to stdout; it belongs to the control plane.

use tokio::io::AsyncBufReadExt;

/// Commands accepted on the control input.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
    List,
    Disconnect { session_id: crate::peer::PeerId },
    Shutdown,
}

impl ControlCommand {
    const ACTIONS: [&'static str; 3] = ["LIST", "DISCONNECT", "SHUTDOWN"];
}

/// Events written to the control output.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlEvent {
    Token {
        token: String,
    },
    Connected {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        addr: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    Disconnect {
        session_id: String,
    },
    List {
        sessions: Vec<String>,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("malformed command: {source}")]
    Malformed { source: serde_json::Error },

    #[error("command has no action")]
    MissingAction,

    #[error("unknown action {0:?}")]
    UnknownAction(String),
}

/// Parse one control line.
pub fn parse_command(line: &str) -> Result<ControlCommand, CommandError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|source| CommandError::Malformed { source })?;

    let action = value
        .get("action")
        .and_then(serde_json::Value::as_str)
        .ok_or(CommandError::MissingAction)?;
    if !ControlCommand::ACTIONS.contains(&action) {
        return Err(CommandError::UnknownAction(action.to_string()));
    }

    serde_json::from_value(value).map_err(|source| CommandError::Malformed { source })
}

/// Where control events go.
#[derive(Debug, Clone)]
pub enum EventSink {
    /// One JSON line per event on the process's stdout
    Stdout,
    /// Events are handed to a channel, for tests and embedding
    Channel(tokio::sync::mpsc::UnboundedSender<ControlEvent>),
}

impl EventSink {
    pub fn channel() -> (Self, tokio::sync::mpsc::UnboundedReceiver<ControlEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (EventSink::Channel(tx), rx)
    }

    pub fn emit(&self, event: ControlEvent) {
        match self {
            EventSink::Stdout => {
                if let Err(e) = write_line(&mut std::io::stdout().lock(), &event) {
                    tracing::error!("failed to write control event: {e}");
                }
            }
            EventSink::Channel(tx) => {
                if tx.send(event).is_err() {
                    tracing::debug!("control event dropped, receiver gone");
                }
            }
        }
    }

    pub fn error(&self, error: impl std::fmt::Display) {
        self.emit(ControlEvent::Error {
            error: error.to_string(),
        });
    }
}

fn write_line<W: std::io::Write>(out: &mut W, event: &ControlEvent) -> std::io::Result<()> {
    serde_json::to_writer(&mut *out, event)?;
    out.write_all(b"\n")?;
    out.flush()
}

/// Serve control commands from `input` until it ends, a SHUTDOWN arrives
/// or the tunnel shuts down.
///
/// `registry` is the host's session registry. Clients pass `None`: they have
/// a single session, so LIST and DISCONNECT are answered with an ERROR.
pub async fn run<R>(
    mut input: R,
    registry: Option<std::sync::Arc<crate::registry::SessionRegistry>>,
    events: EventSink,
    lifecycle: std::sync::Arc<crate::lifecycle::Lifecycle>,
) where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = lifecycle.cancelled() => break,
            read = input.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => {
                tracing::debug!("control input closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("control input failed: {e}");
                break;
            }
        }
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim(),
            Err(e) => {
                tracing::warn!("ignoring control line that is not UTF-8: {e}");
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }

        let command = match parse_command(line) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("ignoring control line: {e}");
                continue;
            }
        };
        tracing::debug!(?command, "control command");

        match (command, &registry) {
            (ControlCommand::List, Some(registry)) => {
                let sessions = registry
                    .list_sessions()
                    .await
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                events.emit(ControlEvent::List { sessions });
            }
            (ControlCommand::Disconnect { session_id }, Some(registry)) => {
                registry.remove_session(&session_id, false).await;
            }
            (ControlCommand::List, None) => {
                tracing::info!("LIST ignored in client role");
                events.error("LIST is not supported in client role");
            }
            (ControlCommand::Disconnect { .. }, None) => {
                tracing::info!("DISCONNECT ignored in client role");
                events.error("DISCONNECT is not supported in client role");
            }
            (ControlCommand::Shutdown, _) => {
                lifecycle.trigger(crate::lifecycle::ShutdownReason::Command);
                break;
            }
        }
    }
}
