//! Wire protocol for the `vmd` control socket: newline-delimited JSON
//! requests and responses over a Unix domain
//! socket, shared between `vmd` (server) and `vmctl` (client) so both sides
//! parse the same `serde` types instead of hand-matching JSON keys twice.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::error::{Result, VmError};

/// `$XDG_RUNTIME_DIR/vmctl/vmd.sock`, falling back to `$TMPDIR` (or `/tmp`)
/// when no runtime directory is set — the same fallback `dirs::data_dir`
/// already uses elsewhere in this crate. `VMCTL_RUNTIME_DIR` overrides the
/// runtime directory for both `vmd` and `vmctl`.
pub fn socket_path() -> PathBuf {
    runtime_dir().join("vmd.sock")
}

/// The runtime directory `vmd`'s control socket and pidfile live under.
pub fn runtime_dir() -> PathBuf {
    std::env::var_os("VMCTL_RUNTIME_DIR")
        .map(PathBuf::from)
        .or_else(dirs::runtime_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("vmctl")
}

/// One control request, framed as a single line of JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub vm: String,
    #[serde(flatten)]
    pub op: ControlOp,
}

impl ControlRequest {
    pub fn new(vm: impl Into<String>, op: ControlOp) -> Self {
        Self { vm: vm.into(), op }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlOp {
    Start,
    Stop,
    Shutdown,
    Suspend,
    Status,
    SshHostname,
    WaitSshUp {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
}

/// `{"ok": true, "data": ...}` or `{"ok": false, "error": "<message>"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn ok(data: impl Serialize) -> Self {
        Self {
            ok: true,
            data: serde_json::to_value(data).ok(),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// How long [`Client::connect`] waits for a freshly spawned `vmd` to start
/// accepting connections before giving up.
const SPAWN_WAIT: Duration = Duration::from_secs(5);

/// A connection to `vmd`'s control socket, spawning the daemon first if it
/// isn't already listening. Shared by `vmctl`'s daemon-backed subcommands
/// and, internally, by `QemuBackend` for tap-networked VMs.
pub struct Client {
    stream: BufReader<UnixStream>,
}

impl Client {
    /// Connect to a running `vmd`, spawning one in the background (via the
    /// `vmd` binary on `$PATH`, the same idiom the rest of the workspace
    /// uses for `qemu-system-x86_64`/`sshfs`) if the socket is absent.
    pub async fn connect() -> Result<Self> {
        let path = socket_path();
        if let Ok(stream) = UnixStream::connect(&path).await {
            return Ok(Self {
                stream: BufReader::new(stream),
            });
        }

        tracing::info!(socket = %path.display(), "vmd not running, spawning it");
        tokio::process::Command::new("vmd")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| VmError::DaemonUnavailable(format!("failed to spawn vmd: {e}")))?;

        let deadline = tokio::time::Instant::now() + SPAWN_WAIT;
        loop {
            match UnixStream::connect(&path).await {
                Ok(stream) => {
                    return Ok(Self {
                        stream: BufReader::new(stream),
                    });
                }
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(VmError::DaemonUnavailable(format!(
                            "vmd did not start listening on {}: {e}",
                            path.display()
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Send one request and read back its response line.
    pub async fn call(&mut self, request: ControlRequest) -> Result<ControlResponse> {
        let mut line = serde_json::to_string(&request)
            .map_err(|e| VmError::ControlProtocol(format!("failed to encode request: {e}")))?;
        line.push('\n');
        self.stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(|e| VmError::ControlProtocol(format!("failed to write to vmd: {e}")))?;

        let mut response_line = String::new();
        let n = self
            .stream
            .read_line(&mut response_line)
            .await
            .map_err(|e| VmError::ControlProtocol(format!("failed to read from vmd: {e}")))?;
        if n == 0 {
            return Err(VmError::ControlProtocol(
                "vmd closed the connection without a response".to_string(),
            ));
        }

        serde_json::from_str(response_line.trim_end())
            .map_err(|e| VmError::ControlProtocol(format!("invalid response from vmd: {e}")))
    }

    /// Send a request and turn an `{"ok": false, ...}` response into `Err`.
    pub async fn call_ok(&mut self, request: ControlRequest) -> Result<serde_json::Value> {
        let response = self.call(request).await?;
        if response.ok {
            Ok(response.data.unwrap_or(serde_json::Value::Null))
        } else {
            Err(VmError::ControlProtocol(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_op_serializes_flat() {
        let req = ControlRequest::new("nova", ControlOp::Start);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, serde_json::json!({"vm": "nova", "op": "start"}));
    }

    #[test]
    fn wait_ssh_up_carries_optional_timeout() {
        let req = ControlRequest::new(
            "nova",
            ControlOp::WaitSshUp {
                timeout_secs: Some(30),
            },
        );
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"vm": "nova", "op": "wait_ssh_up", "timeout_secs": 30})
        );

        let round_tripped: ControlRequest = serde_json::from_value(json).unwrap();
        assert!(matches!(
            round_tripped.op,
            ControlOp::WaitSshUp {
                timeout_secs: Some(30)
            }
        ));
    }

    #[test]
    fn every_op_variant_round_trips() {
        let ops = vec![
            ControlOp::Start,
            ControlOp::Stop,
            ControlOp::Shutdown,
            ControlOp::Suspend,
            ControlOp::Status,
            ControlOp::SshHostname,
            ControlOp::WaitSshUp { timeout_secs: None },
        ];
        for op in ops {
            let req = ControlRequest::new("nova", op);
            let line = serde_json::to_string(&req).unwrap();
            let parsed: ControlRequest = serde_json::from_str(&line).unwrap();
            assert_eq!(parsed.vm, "nova");
        }
    }

    #[test]
    fn ok_response_serializes_without_error_field() {
        let resp = ControlResponse::ok(serde_json::json!({"state": "running"}));
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["ok"], true);
    }

    #[test]
    fn err_response_serializes_without_data_field() {
        let resp = ControlResponse::err("VM 'nova' not found");
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("data").is_none());
        assert_eq!(json["error"], "VM 'nova' not found");
    }
}
