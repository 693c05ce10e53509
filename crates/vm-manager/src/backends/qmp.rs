//! Minimal QMP client over a Unix domain socket, used by [`super::qemu`]'s
//! coarse `Hypervisor::{stop,suspend,resume,state}` calls. Distinct from
//! [`crate::qmp`] (the transport-agnostic framer [`crate::lifecycle::VmLifecycle`]
//! drives over a QEMU child's piped stdio): this client dials a QMP socket
//! fresh per call instead of holding a long-lived stdio connection, which is
//! the right tradeoff for a stateless CLI invocation.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::error::{Result, VmError};
use crate::qmp::QmpCommand;

pub struct QmpClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl QmpClient {
    /// Connect to `socket_path`, consume QEMU's QMP greeting banner, and
    /// complete the `qmp_capabilities` handshake.
    pub async fn connect(socket_path: &Path, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, async {
            loop {
                match UnixStream::connect(socket_path).await {
                    Ok(s) => return Ok(s),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
        .await
        .map_err(|_| VmError::other(format!("timed out connecting to {}", socket_path.display())))?
        .map_err(VmError::Io)?;

        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        // QEMU sends a greeting line before accepting commands.
        let _greeting = client.read_line().await?;
        client
            .request(QmpCommand::new("qmp_capabilities", None))
            .await?;
        Ok(client)
    }

    async fn read_line(&mut self) -> Result<Value> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(VmError::other("qmp socket closed unexpectedly"));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(trimmed)
                .map_err(|e| VmError::other(format!("malformed qmp reply: {e}")))?;
            // Skip async events; we want the command's "return"/"error" reply.
            if value.get("event").is_some() {
                continue;
            }
            return Ok(value);
        }
    }

    async fn request(&mut self, cmd: QmpCommand) -> Result<Value> {
        self.writer.write_all(cmd.encode_line().as_bytes()).await?;
        self.writer.flush().await?;
        let reply = self.read_line().await?;
        if let Some(err) = reply.get("error") {
            return Err(VmError::other(format!("qmp command failed: {err}")));
        }
        Ok(reply.get("return").cloned().unwrap_or(Value::Null))
    }

    pub async fn query_status(&mut self) -> Result<String> {
        let ret = self
            .request(QmpCommand::new("query-status", None))
            .await?;
        Ok(ret
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }

    pub async fn system_powerdown(&mut self) -> Result<()> {
        self.request(QmpCommand::new("system_powerdown", None))
            .await?;
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.request(QmpCommand::new("stop", None)).await?;
        Ok(())
    }

    pub async fn cont(&mut self) -> Result<()> {
        self.request(QmpCommand::new("cont", None)).await?;
        Ok(())
    }

    pub async fn quit(&mut self) -> Result<()> {
        self.request(QmpCommand::new("quit", None)).await?;
        Ok(())
    }
}
