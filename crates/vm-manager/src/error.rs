//! Error types shared across the library.
//!
//! Follows the error-kind taxonomy this workspace already uses: one flat
//! `thiserror` enum per crate, variants named after the failing operation
//! rather than wrapping a single opaque string everywhere.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, VmError>;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid state for '{name}': {state}")]
    InvalidState { name: String, state: String },

    #[error("failed to start qemu instance: {source}")]
    QemuSpawnFailed { source: std::io::Error },

    #[error("image download failed for {url}: {detail}")]
    ImageDownloadFailed { url: String, detail: String },

    #[error("failed to detect image format for {path}: {detail}", path = path.display())]
    ImageFormatDetectionFailed { path: PathBuf, detail: String },

    #[error("image conversion failed: {detail}")]
    ImageConversionFailed { detail: String },

    #[error("failed to create overlay backed by {base}: {detail}", base = base.display())]
    OverlayCreationFailed { base: PathBuf, detail: String },

    #[error("failed to create cloud-init ISO: {detail}")]
    CloudInitIsoFailed { detail: String },

    #[error("timed out waiting for an IP address for VM '{name}'")]
    IpDiscoveryTimeout { name: String },

    #[error("VM '{name}' failed to start: {message}")]
    StartException { name: String, message: String },

    #[error("cannot start '{name}' while suspending")]
    CannotStartWhileSuspending { name: String },

    #[error("failed to determine IP address")]
    SshHostnameTimeout,

    #[error("timed out waiting for SSH to come up")]
    SshUpTimeout,

    #[error(
        "sshfs is not installed on the remote host (neither `multipass-sshfs.env` nor `sshfs` were found)"
    )]
    SshfsMissing,

    #[error("remote command `{command}` failed (exit code {exit_code}): {stderr}")]
    RemoteCommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("invalid value received from remote host for `{what}`: {value}")]
    InvalidRemoteValue { what: String, value: String },

    #[error("invalid fuse version reported by remote sshfs: {raw}")]
    InvalidFuseVersion { raw: String },

    #[error("vmd control protocol error: {0}")]
    ControlProtocol(String),

    #[error("vmd is not running and could not be started: {0}")]
    DaemonUnavailable(String),

    #[error("VM '{0}' not found")]
    NotFound(String),

    #[error("provisioning '{vm}' failed at step {step}: {detail}")]
    ProvisionFailed {
        vm: String,
        step: usize,
        detail: String,
    },

    #[error("KDL parse error in {path}: {detail}", path = path.display())]
    VmFileParse { path: PathBuf, detail: String },

    #[error("{0}")]
    Other(String),
}

impl VmError {
    pub fn other(msg: impl Into<String>) -> Self {
        VmError::Other(msg.into())
    }
}
