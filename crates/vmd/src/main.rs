//! `vmd`: the long-running daemon that owns every VM's `VmLifecycle`.
//!
//! `vmctl` talks to it over a newline-delimited JSON protocol
//! (`vm_manager::control`) on a Unix domain socket so that a lifecycle
//! (and the QEMU child process it supervises) survives across separate
//! `vmctl` invocations instead of being reconstructed, and torn down,
//! every time.

mod config;
mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing_subscriber::EnvFilter;

use vm_manager::{ControlOp, ControlRequest, ControlResponse};

use config::Config;
use supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "vmd", about = "VM lifecycle control daemon")]
struct Args {
    /// Log to stderr and don't treat a stale log file path specially.
    #[arg(long)]
    foreground: bool,
}

fn init_tracing(config: &Config, foreground: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if foreground {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return;
    }

    if let Some(parent) = config.log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_path)
    {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        Err(_) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

/// Runs one control operation against its lifecycle, under the per-VM
/// op lock so concurrent requests for the same VM serialize.
async fn dispatch(supervisor: &Supervisor, req: ControlRequest) -> ControlResponse {
    let (lifecycle, op_lock) = match supervisor.get_or_construct(&req.vm).await {
        Ok(pair) => pair,
        Err(e) => return ControlResponse::err(e.to_string()),
    };

    match req.op {
        ControlOp::Start => {
            let _guard = op_lock.lock().await;
            match lifecycle.start().await {
                Ok(()) => ControlResponse::ok(serde_json::json!({})),
                Err(e) => ControlResponse::err(e.to_string()),
            }
        }
        ControlOp::Stop => {
            let _guard = op_lock.lock().await;
            match lifecycle.stop().await {
                Ok(()) => ControlResponse::ok(serde_json::json!({})),
                Err(e) => ControlResponse::err(e.to_string()),
            }
        }
        ControlOp::Shutdown => {
            let _guard = op_lock.lock().await;
            match lifecycle.shutdown().await {
                Ok(()) => ControlResponse::ok(serde_json::json!({})),
                Err(e) => ControlResponse::err(e.to_string()),
            }
        }
        ControlOp::Suspend => {
            let _guard = op_lock.lock().await;
            match lifecycle.suspend().await {
                Ok(()) => ControlResponse::ok(serde_json::json!({})),
                Err(e) => ControlResponse::err(e.to_string()),
            }
        }
        ControlOp::Status => {
            let state = lifecycle.current_state().await;
            ControlResponse::ok(serde_json::json!({ "state": format!("{state:?}") }))
        }
        ControlOp::SshHostname => match lifecycle.ssh_hostname().await {
            Ok(ip) => ControlResponse::ok(serde_json::json!({ "ip": ip })),
            Err(e) => ControlResponse::err(e.to_string()),
        },
        ControlOp::WaitSshUp { timeout_secs } => {
            let timeout = Duration::from_secs(timeout_secs.unwrap_or(120));
            match lifecycle.wait_until_ssh_up(timeout).await {
                Ok(()) => ControlResponse::ok(serde_json::json!({})),
                Err(e) => ControlResponse::err(e.to_string()),
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, supervisor: Arc<Supervisor>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "control connection read error");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(req) => dispatch(&supervisor, req).await,
            Err(e) => ControlResponse::err(format!("invalid request: {e}")),
        };

        let mut out = match serde_json::to_string(&response) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode control response");
                continue;
            }
        };
        out.push('\n');
        if let Err(e) = write_half.write_all(out.as_bytes()).await {
            tracing::warn!(error = %e, "control connection write error");
            break;
        }
    }
}

/// Binds the control socket, removing a stale one left behind by a crashed
/// prior instance. Refuses to start if something is still listening on it.
async fn bind_socket(config: &Config) -> std::io::Result<UnixListener> {
    if let Some(parent) = config.socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if config.socket_path.exists() {
        if UnixStream::connect(&config.socket_path).await.is_ok() {
            return Err(std::io::Error::other(format!(
                "vmd already running on {}",
                config.socket_path.display()
            )));
        }
        tokio::fs::remove_file(&config.socket_path).await?;
    }
    UnixListener::bind(&config.socket_path)
}

async fn cleanup(config: &Config) {
    let _ = tokio::fs::remove_file(&config.socket_path).await;
    let _ = tokio::fs::remove_file(&config.lock_path).await;
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();
    let config = Config::load();
    init_tracing(&config, args.foreground);

    let listener = bind_socket(&config).await?;
    if let Some(parent) = config.lock_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    tokio::fs::write(&config.lock_path, std::process::id().to_string())
        .await
        .ok();
    tracing::info!(socket = %config.socket_path.display(), "vmd listening");

    let supervisor = Arc::new(Supervisor::new(config.clone()));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let supervisor = supervisor.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, supervisor).await;
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal");
                break;
            }
        }
    }

    cleanup(&config).await;
    Ok(())
}
