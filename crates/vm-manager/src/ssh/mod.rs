//! `SshChannelExec`, an SSH session abstraction used both by the SSHFS
//! bootstrap ([`crate::sshfs`]) and by ad hoc provisioning
//! ([`crate::provision`]). Built on `ssh2`, the transport this workspace
//! already uses for remote exec (`crates/vmctl/src/commands/ssh.rs` assumes
//! this module's API).
//!
//! `ssh2::Session` is blocking; every call that touches the wire runs inside
//! `tokio::task::spawn_blocking`, with a `read_timeout` set on the session at
//! connect time so a wedged remote can't hang a caller forever.

use std::io::Read;
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ssh2::Session;

use crate::error::{Result, VmError};
use crate::types::SshConfig;

/// How long a single blocking read/write on the session may take before
/// `ssh2` gives up and returns a timeout error.
const READ_TIMEOUT_MS: u32 = 30_000;

/// Log the remote's host key fingerprint at connect time. Best-effort and
/// non-fatal: we do not yet maintain a known_hosts store to verify against,
/// so this is purely an operator-visible breadcrumb.
fn log_host_key_fingerprint(sess: &Session, host: &str) {
    let Some((blob, _kind)) = sess.host_key() else {
        return;
    };
    match ssh_key::PublicKey::from_bytes(blob) {
        Ok(key) => {
            tracing::debug!(host, fingerprint = %key.fingerprint(Default::default()), "ssh host key");
        }
        Err(e) => {
            tracing::trace!(host, error = %e, "could not parse host key for fingerprint logging");
        }
    }
}

/// Open and authenticate a blocking SSH session. Tries, in order: an
/// explicit private key path, a PEM blob, or (failing both) the SSH agent.
fn connect_sync(host: &str, port: u16, config: &SshConfig) -> Result<Session> {
    let tcp = TcpStream::connect((host, port))
        .map_err(|e| VmError::other(format!("tcp connect to {host}:{port} failed: {e}")))?;
    tcp.set_nodelay(true).ok();

    let mut sess = Session::new()
        .map_err(|e| VmError::other(format!("failed to create ssh session: {e}")))?;
    sess.set_tcp_stream(tcp);
    sess.set_timeout(READ_TIMEOUT_MS);
    sess.handshake()
        .map_err(|e| VmError::other(format!("ssh handshake with {host}:{port} failed: {e}")))?;

    log_host_key_fingerprint(&sess, host);

    if let Some(ref key_path) = config.private_key_path {
        sess.userauth_pubkey_file(&config.user, None, key_path, None)
            .map_err(|e| VmError::other(format!("pubkey auth with {} failed: {e}", key_path.display())))?;
    } else if let Some(ref pem) = config.private_key_pem {
        sess.userauth_pubkey_memory(&config.user, None, pem, None)
            .map_err(|e| VmError::other(format!("pubkey-memory auth failed: {e}")))?;
    } else {
        sess.userauth_agent(&config.user)
            .map_err(|e| VmError::other(format!("ssh-agent auth failed: {e}")))?;
    }

    if !sess.authenticated() {
        return Err(VmError::other(format!(
            "ssh authentication as '{}' was not accepted",
            config.user
        )));
    }

    Ok(sess)
}

/// Connect once, failing immediately if the peer refuses (host not yet up).
pub async fn connect(host: &str, port: u16, config: &SshConfig) -> Result<Session> {
    let host = host.to_string();
    let config = config.clone();
    tokio::task::spawn_blocking(move || connect_sync(&host, port, &config))
        .await
        .map_err(|e| VmError::other(format!("ssh connect task panicked: {e}")))?
}

/// Connect with retry, re-attempting every two seconds until `timeout`
/// elapses (a guest takes a few seconds after boot before sshd accepts).
pub async fn connect_with_retry(
    host: &str,
    port: u16,
    config: &SshConfig,
    timeout: Duration,
) -> Result<Session> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match connect(host, port, config).await {
            Ok(sess) => return Ok(sess),
            Err(e) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(e);
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Run one remote command to completion, returning `(stdout, stderr,
/// exit_code)`. Synchronous; callers on an async stack should go through
/// [`SshChannelExec::exec`] instead.
pub fn exec(sess: &Session, command: &str) -> Result<(String, String, i32)> {
    let mut channel = sess
        .channel_session()
        .map_err(|e| VmError::other(format!("failed to open ssh channel: {e}")))?;
    channel
        .exec(command)
        .map_err(|e| VmError::other(format!("failed to exec `{command}`: {e}")))?;

    let mut stdout = String::new();
    channel
        .read_to_string(&mut stdout)
        .map_err(|e| VmError::other(format!("failed to read stdout of `{command}`: {e}")))?;

    let mut stderr = String::new();
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .map_err(|e| VmError::other(format!("failed to read stderr of `{command}`: {e}")))?;

    channel
        .wait_close()
        .map_err(|e| VmError::other(format!("failed to close channel for `{command}`: {e}")))?;
    let exit_code = channel.exit_status().unwrap_or(-1);

    Ok((stdout, stderr, exit_code))
}

/// Upload a local file to `remote_path`, preserving its mode bits.
pub fn upload(sess: &Session, local_path: &Path, remote_path: &Path) -> Result<()> {
    let contents = std::fs::read(local_path)
        .map_err(|e| VmError::other(format!("failed to read {}: {e}", local_path.display())))?;
    let mode = std::fs::metadata(local_path)
        .map(|m| {
            use std::os::unix::fs::PermissionsExt;
            m.permissions().mode() & 0o777
        })
        .unwrap_or(0o644);

    let mut remote_file = sess
        .scp_send(remote_path, mode as i32, contents.len() as u64, None)
        .map_err(|e| VmError::other(format!("scp_send to {} failed: {e}", remote_path.display())))?;
    std::io::Write::write_all(&mut remote_file, &contents)
        .map_err(|e| VmError::other(format!("scp write to {} failed: {e}", remote_path.display())))?;
    remote_file
        .send_eof()
        .and_then(|_| remote_file.wait_eof())
        .and_then(|_| remote_file.close())
        .and_then(|_| remote_file.wait_close())
        .map_err(|e| VmError::other(format!("scp close for {} failed: {e}", remote_path.display())))?;
    Ok(())
}

/// An async wrapper around a single long-lived [`Session`], used by
/// [`crate::sshfs::identity::IdentityProbe`] to run an ordered sequence of
/// remote commands without re-dialing SSH for each one.
#[derive(Clone)]
pub struct SshChannelExec {
    session: Arc<Mutex<Session>>,
}

impl SshChannelExec {
    pub fn new(session: Session) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
        }
    }

    pub async fn connect(host: &str, port: u16, config: &SshConfig) -> Result<Self> {
        Ok(Self::new(connect(host, port, config).await?))
    }

    /// Run one command, returning `(exit_code, stdout, stderr)`.
    pub async fn exec(&self, command: &str) -> Result<(i32, String, String)> {
        let session = self.session.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || {
            let sess = session
                .lock()
                .map_err(|_| VmError::other("ssh session lock poisoned"))?;
            let (stdout, stderr, exit_code) = exec(&sess, &command)?;
            Ok((exit_code, stdout, stderr))
        })
        .await
        .map_err(|e| VmError::other(format!("ssh exec task panicked: {e}")))?
    }

    pub async fn upload(&self, local_path: &Path, remote_path: &Path) -> Result<()> {
        let session = self.session.clone();
        let local_path = local_path.to_path_buf();
        let remote_path = remote_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let sess = session
                .lock()
                .map_err(|_| VmError::other("ssh session lock poisoned"))?;
            upload(&sess, &local_path, &remote_path)
        })
        .await
        .map_err(|e| VmError::other(format!("ssh upload task panicked: {e}")))?
    }

    /// Hand back the raw session, e.g. to open the long-lived `sshfs`
    /// bootstrap channel that outlives the bootstrap probe sequence.
    pub fn session_handle(&self) -> Arc<Mutex<Session>> {
        self.session.clone()
    }
}
