//! The backend-agnostic `Hypervisor` façade the CLI talks to, plus the
//! `ProcessFactory` collaborator interface (out of scope to implement
//! deeply — `vm-manager` only needs a seam to construct
//! [`crate::process::ProcessHandle`]s, the real factory lives wherever the
//! embedding application wants to inject test doubles).

pub use crate::types::ConsoleEndpoint;
use crate::types::{VmHandle, VmSpec, VmState};
use crate::error::Result;

/// Backend-agnostic VM lifecycle operations, implemented by `QemuBackend`
/// and `NoopBackend`.
pub trait Hypervisor {
    fn prepare(&self, spec: &VmSpec) -> impl Future<Output = Result<VmHandle>> + Send;
    fn start(&self, vm: &VmHandle) -> impl Future<Output = Result<()>> + Send;
    fn stop(&self, vm: &VmHandle, timeout: std::time::Duration) -> impl Future<Output = Result<()>> + Send;
    fn suspend(&self, vm: &VmHandle) -> impl Future<Output = Result<()>> + Send;
    fn resume(&self, vm: &VmHandle) -> impl Future<Output = Result<()>> + Send;
    fn destroy(&self, vm: VmHandle) -> impl Future<Output = Result<()>> + Send;
    fn state(&self, vm: &VmHandle) -> impl Future<Output = Result<VmState>> + Send;
    fn guest_ip(&self, vm: &VmHandle) -> impl Future<Output = Result<String>> + Send;
    fn console_endpoint(&self, vm: &VmHandle) -> Result<ConsoleEndpoint>;
}

/// Dispatches to whichever backend a given `VmHandle` was prepared with.
/// The CLI constructs one of these per invocation, exactly as before.
pub enum RouterHypervisor {
    Qemu(crate::backends::qemu::QemuBackend),
    Noop(crate::backends::noop::NoopBackend),
}

impl RouterHypervisor {
    pub fn new(qemu_binary: Option<std::path::PathBuf>, default_bridge: Option<String>) -> Self {
        if std::env::var_os("VMCTL_NOOP").is_some() {
            RouterHypervisor::Noop(crate::backends::noop::NoopBackend)
        } else {
            RouterHypervisor::Qemu(crate::backends::qemu::QemuBackend::new(
                qemu_binary,
                None,
                default_bridge,
            ))
        }
    }
}

impl Hypervisor for RouterHypervisor {
    async fn prepare(&self, spec: &VmSpec) -> Result<VmHandle> {
        match self {
            RouterHypervisor::Qemu(b) => b.prepare(spec).await,
            RouterHypervisor::Noop(b) => b.prepare(spec).await,
        }
    }

    async fn start(&self, vm: &VmHandle) -> Result<()> {
        match self {
            RouterHypervisor::Qemu(b) => b.start(vm).await,
            RouterHypervisor::Noop(b) => b.start(vm).await,
        }
    }

    async fn stop(&self, vm: &VmHandle, timeout: std::time::Duration) -> Result<()> {
        match self {
            RouterHypervisor::Qemu(b) => b.stop(vm, timeout).await,
            RouterHypervisor::Noop(b) => b.stop(vm, timeout).await,
        }
    }

    async fn suspend(&self, vm: &VmHandle) -> Result<()> {
        match self {
            RouterHypervisor::Qemu(b) => b.suspend(vm).await,
            RouterHypervisor::Noop(b) => b.suspend(vm).await,
        }
    }

    async fn resume(&self, vm: &VmHandle) -> Result<()> {
        match self {
            RouterHypervisor::Qemu(b) => b.resume(vm).await,
            RouterHypervisor::Noop(b) => b.resume(vm).await,
        }
    }

    async fn destroy(&self, vm: VmHandle) -> Result<()> {
        match self {
            RouterHypervisor::Qemu(b) => b.destroy(vm).await,
            RouterHypervisor::Noop(b) => b.destroy(vm).await,
        }
    }

    async fn state(&self, vm: &VmHandle) -> Result<VmState> {
        match self {
            RouterHypervisor::Qemu(b) => b.state(vm).await,
            RouterHypervisor::Noop(b) => b.state(vm).await,
        }
    }

    async fn guest_ip(&self, vm: &VmHandle) -> Result<String> {
        match self {
            RouterHypervisor::Qemu(b) => b.guest_ip(vm).await,
            RouterHypervisor::Noop(b) => b.guest_ip(vm).await,
        }
    }

    fn console_endpoint(&self, vm: &VmHandle) -> Result<ConsoleEndpoint> {
        match self {
            RouterHypervisor::Qemu(b) => b.console_endpoint(vm),
            RouterHypervisor::Noop(b) => b.console_endpoint(vm),
        }
    }
}

/// Constructs [`crate::process::ProcessHandle`]s. `vm-manager` depends only
/// on this seam; the embedding application may
/// substitute a test double that never touches a real subprocess.
pub trait ProcessFactory: Send + Sync {
    fn spawn(
        &self,
        program: &str,
        args: &[String],
    ) -> impl Future<Output = Result<(crate::process::ProcessHandle, crate::process::ProcessEvents)>>
    + Send;
}

/// The default factory: spawns real OS processes via `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessFactory;

impl ProcessFactory for SystemProcessFactory {
    async fn spawn(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<(crate::process::ProcessHandle, crate::process::ProcessEvents)> {
        crate::process::ProcessHandle::start(program, args).await
    }
}
