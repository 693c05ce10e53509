//! QMP framing and event decoding.
//!
//! The codec is transport-agnostic: it operates over anything implementing
//! `AsyncBufRead`/`AsyncWrite`, so it frames both a QEMU child's piped stdio
//! and, in tests, an in-memory `tokio::io::duplex` pipe.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// A single QMP command: `{"execute": cmd, "arguments": args?}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QmpCommand {
    pub execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl QmpCommand {
    pub fn new(execute: impl Into<String>, arguments: Option<Value>) -> Self {
        Self {
            execute: execute.into(),
            arguments,
        }
    }

    /// Encode as a single newline-terminated JSON line, ready to write to a
    /// QEMU child's stdin.
    pub fn encode_line(&self) -> String {
        let mut line = serde_json::to_string(self).expect("QmpCommand always serializes");
        line.push('\n');
        line
    }
}

/// Events the controller recognizes. Anything else is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QmpEvent {
    Reset,
    Powerdown,
    Shutdown,
    Stop,
    Resume,
}

impl QmpEvent {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "RESET" => Some(QmpEvent::Reset),
            "POWERDOWN" => Some(QmpEvent::Powerdown),
            "SHUTDOWN" => Some(QmpEvent::Shutdown),
            "STOP" => Some(QmpEvent::Stop),
            "RESUME" => Some(QmpEvent::Resume),
            _ => None,
        }
    }
}

/// Build the `qmp_capabilities` handshake command.
pub fn capabilities() -> QmpCommand {
    QmpCommand::new("qmp_capabilities", None)
}

/// Build the `execute` command for a plain command name with no arguments.
pub fn command(name: impl Into<String>) -> QmpCommand {
    QmpCommand::new(name, None)
}

/// Build the `execute` command with a JSON arguments object.
pub fn command_with_args(name: impl Into<String>, arguments: Value) -> QmpCommand {
    QmpCommand::new(name, Some(arguments))
}

/// Human Monitor Command wrapper: `{"execute":"human-monitor-command",
/// "arguments":{"command-line": line}}`.
pub fn hmc(line: impl Into<String>) -> QmpCommand {
    QmpCommand::new(
        "human-monitor-command",
        Some(json!({ "command-line": line.into() })),
    )
}

/// Decode a single line as a QMP event, ignoring unknown events and
/// non-event objects. Used by `VmLifecycle`
/// against stdout lines it already receives as `ProcessEvent::Stdout`,
/// rather than re-reading the child's stdout a second time.
pub fn decode_event_line(line: &str) -> Option<QmpEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let name = value.get("event").and_then(Value::as_str)?;
    QmpEvent::from_name(name)
}

/// Write a single command to `writer` (one JSON line, newline-terminated).
pub async fn send<W: AsyncWrite + Unpin>(writer: &mut W, cmd: &QmpCommand) -> std::io::Result<()> {
    writer.write_all(cmd.encode_line().as_bytes()).await?;
    writer.flush().await
}

/// Run the read loop against `reader`, forwarding recognized events to `tx`.
/// Returns once the underlying stream reaches EOF (the child's stdout
/// closed, i.e. the process exited). Unknown events are logged and
/// dropped; non-event objects (command returns) are logged at trace level
/// and discarded.
pub async fn read_events<R: AsyncBufRead + Unpin>(
    mut reader: R,
    tx: mpsc::UnboundedSender<QmpEvent>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "qmp: read error, stopping event loop");
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, line = %trimmed, "qmp: unparsable line, ignoring");
                continue;
            }
        };
        match value.get("event").and_then(Value::as_str) {
            Some(name) => match QmpEvent::from_name(name) {
                Some(ev) => {
                    if tx.send(ev).is_err() {
                        break;
                    }
                }
                None => tracing::debug!(event = %name, "qmp: unrecognized event, ignoring"),
            },
            None => tracing::trace!(line = %trimmed, "qmp: non-event message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_command_round_trips_through_json() {
        let cmd = command_with_args("savevm", json!({"tag": "suspend"}));
        let line = cmd.encode_line();
        assert!(line.ends_with('\n'));
        let decoded: QmpCommand = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(decoded.execute, "savevm");
        assert_eq!(decoded.arguments, Some(json!({"tag": "suspend"})));
    }

    #[test]
    fn encode_without_arguments_omits_the_field() {
        let cmd = capabilities();
        let line = cmd.encode_line();
        assert!(!line.contains("arguments"));
    }

    #[test]
    fn hmc_wraps_command_line() {
        let cmd = hmc("savevm suspend");
        assert_eq!(cmd.execute, "human-monitor-command");
        assert_eq!(
            cmd.arguments,
            Some(json!({"command-line": "savevm suspend"}))
        );
    }

    #[test]
    fn decode_event_line_ignores_unknown_and_non_event() {
        assert_eq!(
            decode_event_line("{\"event\":\"RESET\"}"),
            Some(QmpEvent::Reset)
        );
        assert_eq!(decode_event_line("{\"event\":\"NOT_A_THING\"}"), None);
        assert_eq!(decode_event_line("{\"return\":{}}"), None);
        assert_eq!(decode_event_line("not json at all"), None);
    }

    #[tokio::test]
    async fn decode_loop_emits_known_events_and_ignores_unknown() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let reader = tokio::io::BufReader::new(server);
        let handle = tokio::spawn(read_events(reader, tx));

        client
            .write_all(b"{\"event\":\"RESET\"}\n")
            .await
            .unwrap();
        client
            .write_all(b"{\"event\":\"SOMETHING_NEW\"}\n")
            .await
            .unwrap();
        client
            .write_all(b"{\"return\":{}}\n")
            .await
            .unwrap();
        client
            .write_all(b"{\"event\":\"RESUME\"}\n")
            .await
            .unwrap();
        drop(client);

        assert_eq!(rx.recv().await, Some(QmpEvent::Reset));
        assert_eq!(rx.recv().await, Some(QmpEvent::Resume));
        assert_eq!(rx.recv().await, None);
        handle.await.unwrap();
    }
}
