//! `vm-manager`: QEMU-backed VM lifecycle control plus an SSHFS mount
//! bootstrap, driven over QMP and SSH respectively.
//!
//! Two layers live here side by side:
//!
//! - [`traits::Hypervisor`] / [`backends`] — the coarse, backend-agnostic
//!   façade the CLI has always talked to (`prepare/start/stop/.../destroy`).
//! - [`lifecycle::VmLifecycle`] — the fine-grained state machine (this
//!   crate's core) that reconciles a QEMU child process, QMP events,
//!   persisted [`metadata`], and the [`monitor`] collaborators.
//!
//! [`ssh`] and [`sshfs`] implement the SSHFS mount bootstrap;
//! [`vmfile`] is the declarative `VMFile.kdl` config layer the CLI reads VM
//! definitions and SSH settings from.

pub mod backends;
pub mod cloudinit;
pub mod control;
pub mod error;
pub mod image;
pub mod lifecycle;
pub mod metadata;
pub mod monitor;
pub mod process;
pub mod provision;
pub mod qmp;
pub mod registry;
pub mod ssh;
pub mod sshfs;
pub mod traits;
pub mod types;
pub mod vmfile;

pub use control::{Client as ControlClient, ControlOp, ControlRequest, ControlResponse};
pub use error::{Result, VmError};
pub use lifecycle::VmLifecycle;
pub use metadata::{FileMetadataStore, VmMetadata, VmMetadataStore};
pub use monitor::{ArpDhcpDirectory, DhcpDirectory, FileStatusMonitor, StatusMonitor};
pub use registry::DescriptorStore;
pub use traits::{ConsoleEndpoint, Hypervisor, ProcessFactory, RouterHypervisor, SystemProcessFactory};
pub use types::{
    BackendTag, CloudInitSpec, LifecycleState, NetworkConfig, SshConfig, VmDescriptor, VmHandle,
    VmSpec, VmState,
};
