//! Shared value types.
//!
//! `VmState` is the coarse, backend-agnostic state the [`crate::traits::Hypervisor`]
//! façade exposes to the CLI (`Prepared/Running/Stopped/Destroyed`). It predates
//! this revision and is kept as-is. `LifecycleState` is the fine-grained, QEMU
//! specific state machine `VmLifecycle` drives; the two are related by
//! a lossy projection in `lifecycle.rs`, not by a shared representation.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which concrete hypervisor backend produced a [`VmHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendTag {
    Qemu,
    Noop,
}

impl fmt::Display for BackendTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendTag::Qemu => write!(f, "qemu"),
            BackendTag::Noop => write!(f, "noop"),
        }
    }
}

/// Coarse backend-agnostic VM state, as surfaced by `vmctl status`/`list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    Prepared,
    Running,
    Stopped,
    Destroyed,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Prepared => "prepared",
            VmState::Running => "running",
            VmState::Stopped => "stopped",
            VmState::Destroyed => "destroyed",
        };
        write!(f, "{s}")
    }
}

/// Fine-grained lifecycle state machine. `Unknown` is accepted on
/// entry from persistence and treated like `Running` for shutdown purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Off,
    Starting,
    Running,
    DelayedShutdown,
    Restarting,
    Suspending,
    Suspended,
    Unknown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Off => "off",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::DelayedShutdown => "delayed_shutdown",
            LifecycleState::Restarting => "restarting",
            LifecycleState::Suspending => "suspending",
            LifecycleState::Suspended => "suspended",
            LifecycleState::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Network configuration chosen at `prepare()` time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NetworkConfig {
    #[default]
    None,
    /// QEMU user-mode networking with a forwarded SSH port.
    User,
    /// A host tap device bridged to the guest (what `VmLifecycle` assumes).
    Tap { device: String, mac_addr: String },
}

/// Cloud-init seed configuration for `prepare()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudInitSpec {
    pub instance_id: Option<String>,
    pub hostname: Option<String>,
    pub user_data: Vec<u8>,
}

/// SSH connection parameters, shared by `vmctl ssh` and the SSHFS bootstrap.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub user: String,
    pub public_key: Option<String>,
    pub private_key_path: Option<PathBuf>,
    pub private_key_pem: Option<String>,
}

/// Declarative request to create a VM, as read from a `VMFile.kdl` or built
/// by `vmctl create`.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub name: String,
    pub image_path: PathBuf,
    pub vcpus: u32,
    pub memory_mb: u32,
    pub disk_gb: Option<u32>,
    pub network: NetworkConfig,
    pub cloud_init: Option<CloudInitSpec>,
    pub ssh: Option<SshConfig>,
}

/// A live or prepared VM, as tracked by the CLI's local state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmHandle {
    pub id: String,
    pub name: String,
    pub backend: BackendTag,
    pub work_dir: PathBuf,
    pub overlay_path: Option<PathBuf>,
    pub seed_iso_path: Option<PathBuf>,
    pub pid: Option<u32>,
    pub qmp_socket: Option<PathBuf>,
    pub console_socket: Option<PathBuf>,
    pub vnc_addr: Option<String>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub ssh_host_port: Option<u16>,
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
}

fn default_vcpus() -> u32 {
    1
}

fn default_memory_mb() -> u32 {
    1024
}

/// Where a VM's serial console can be reached.
#[derive(Debug, Clone)]
pub enum ConsoleEndpoint {
    UnixSocket(PathBuf),
    WebSocket(String),
    None,
}

/// Immutable per-VM identity `VmLifecycle` is constructed with.
/// The `ipv4` cache is the one piece of interior mutability: cleared on
/// every transition into `Restarting` or `Off`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDescriptor {
    pub vm_name: String,
    pub image_path: PathBuf,
    pub cloud_init_path: Option<PathBuf>,
    pub tap_device_name: String,
    pub mac_addr: String,
    pub ssh_username: String,
}
