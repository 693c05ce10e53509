//! `VmLifecycle`, the state machine coordinating a QEMU `ProcessHandle`,
//! QMP events, persisted metadata, and the `StatusMonitor`/`DhcpDirectory`
//! collaborators. This is the core of the crate; everything
//! else in this file's neighborhood exists to feed it or to be fed by it.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::error::{Result, VmError};
use crate::metadata::VmMetadata;
use crate::monitor::{DhcpDirectory, StatusMonitor};
use crate::process::{ProcessEvents, ProcessHandle};
use crate::qmp::{self, QmpEvent};
use crate::traits::ProcessFactory;
use crate::types::{LifecycleState, VmDescriptor};
use crate::metadata::VmMetadataStore;

/// The resume-only QEMU CLI additions: `-loadvm suspend`,
/// `-machine <machine_type>`, and exactly one of `-cdrom`/`-drive` chosen
/// by the legacy `use_cdrom` flag.
pub fn resume_args(metadata: &VmMetadata, cloud_init_path: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        "-loadvm".to_string(),
        "suspend".to_string(),
        "-machine".to_string(),
        metadata.machine_type.clone(),
    ];
    if let Some(ci) = cloud_init_path {
        if metadata.use_cdrom() {
            args.push("-cdrom".to_string());
            args.push(ci.display().to_string());
        } else {
            args.push("-drive".to_string());
            args.push(format!(
                "file={},if=virtio,format=raw,snapshot=off,read-only=on",
                ci.display()
            ));
        }
    }
    args
}

/// Full QEMU argument set for a VM, appending [`resume_args`] when resuming
/// from a suspended snapshot.
pub fn qemu_args(descriptor: &VmDescriptor, metadata: &VmMetadata, resume: bool) -> Vec<String> {
    let mut args = vec![
        "-nographic".to_string(),
        "-qmp".to_string(),
        "stdio".to_string(),
        "-netdev".to_string(),
        format!(
            "tap,id=net0,ifname={},script=no,downscript=no",
            descriptor.tap_device_name
        ),
        "-device".to_string(),
        format!(
            "virtio-net-pci,netdev=net0,mac={}",
            descriptor.mac_addr
        ),
        "-drive".to_string(),
        format!(
            "file={},if=virtio,format=qcow2",
            descriptor.image_path.display()
        ),
    ];
    if resume {
        args.extend(resume_args(metadata, descriptor.cloud_init_path.as_deref()));
    } else if let Some(ci) = &descriptor.cloud_init_path {
        args.push("-drive".to_string());
        args.push(format!(
            "file={},if=virtio,format=raw,snapshot=off,read-only=on",
            ci.display()
        ));
    }
    args
}

/// Presence of a line naming the `suspend` snapshot tag, as emitted by
/// `qemu-img snapshot -l`.
fn snapshot_tag_present(output: &str) -> bool {
    output.lines().any(|line| line.contains("suspend"))
}

async fn detect_initial_state(qemu_img_binary: &str, image_path: &Path) -> LifecycleState {
    let result = tokio::process::Command::new(qemu_img_binary)
        .args(["snapshot", "-l"])
        .arg(image_path)
        .output()
        .await;
    match result {
        Ok(output) if snapshot_tag_present(&String::from_utf8_lossy(&output.stdout)) => {
            LifecycleState::Suspended
        }
        _ => LifecycleState::Off,
    }
}

async fn probe_machine_type(qemu_binary: &str) -> Result<String> {
    let tmp = tempfile::NamedTempFile::new()?;
    let path = tmp.path().to_path_buf();
    let status = tokio::process::Command::new(qemu_binary)
        .args(["-nographic", "-dump-vmstate"])
        .arg(&path)
        .status()
        .await?;
    if !status.success() {
        return Err(VmError::other("qemu -dump-vmstate exited non-zero"));
    }
    let bytes = tokio::fs::read(&path).await?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| VmError::other(format!("invalid vmstate dump: {e}")))?;
    value
        .get("vmschkmachine")
        .and_then(|v| v.get("Name"))
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| VmError::other("vmstate dump missing vmschkmachine.Name"))
}

/// The synchronized region: `state`, `ipv4`, `saved_error_msg`,
/// `update_shutdown_status`, and the `(state_mutex, state_wait)` condition
/// pair. Modeled with `tokio::sync::Notify` rather than a condvar since the
/// waiter (`on_shutdown`'s wait for `off`) and the notifier
/// (`ensure_vm_is_running`) are both async.
struct Shared {
    state: Mutex<LifecycleState>,
    notify: Notify,
    ipv4: Mutex<Option<String>>,
    saved_error_msg: Mutex<Option<String>>,
    update_shutdown_status: AtomicBool,
    delete_memory_snapshot: AtomicBool,
}

impl Shared {
    fn new(initial: LifecycleState) -> Self {
        Self {
            state: Mutex::new(initial),
            notify: Notify::new(),
            ipv4: Mutex::new(None),
            saved_error_msg: Mutex::new(None),
            update_shutdown_status: AtomicBool::new(true),
            delete_memory_snapshot: AtomicBool::new(false),
        }
    }

    async fn state(&self) -> LifecycleState {
        *self.state.lock().await
    }

    async fn force_state(&self, new: LifecycleState) {
        *self.state.lock().await = new;
        self.notify.notify_one();
    }

    async fn set_state_and_persist<M: StatusMonitor>(
        &self,
        new: LifecycleState,
        monitor: &M,
        vm_name: &str,
    ) {
        self.force_state(new).await;
        monitor.persist_state(vm_name, new).await;
    }

    /// Blocks until state becomes `Off`. The only notifier is
    /// `ensure_vm_is_running` after it has forced that transition.
    async fn wait_until_off(&self) {
        loop {
            if *self.state.lock().await == LifecycleState::Off {
                return;
            }
            let notified = self.notify.notified();
            if *self.state.lock().await == LifecycleState::Off {
                return;
            }
            notified.await;
        }
    }
}

/// Coordinates a QEMU `ProcessHandle` through its full start/stop/suspend
/// lifecycle. Generic over the collaborator traits so callers (in
/// particular `vmd`) can substitute test doubles.
pub struct VmLifecycle<M: StatusMonitor, D: DhcpDirectory, S: VmMetadataStore, F: ProcessFactory> {
    descriptor: VmDescriptor,
    qemu_binary: String,
    qemu_img_binary: String,
    metadata_store: Arc<S>,
    monitor: Arc<M>,
    dhcp: Arc<D>,
    process_factory: Arc<F>,
    metadata: Mutex<VmMetadata>,
    shared: Arc<Shared>,
    process: Mutex<Option<Arc<ProcessHandle>>>,
}

impl<M, D, S, F> VmLifecycle<M, D, S, F>
where
    M: StatusMonitor + 'static,
    D: DhcpDirectory + 'static,
    S: VmMetadataStore + 'static,
    F: ProcessFactory + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        descriptor: VmDescriptor,
        metadata_store: Arc<S>,
        monitor: Arc<M>,
        dhcp: Arc<D>,
        process_factory: Arc<F>,
        qemu_binary: impl Into<String>,
        qemu_img_binary: impl Into<String>,
    ) -> Result<Self> {
        let metadata = metadata_store
            .load(&descriptor.vm_name)
            .await?
            .unwrap_or_default();
        let qemu_img_binary = qemu_img_binary.into();
        let initial_state =
            detect_initial_state(&qemu_img_binary, &descriptor.image_path).await;

        Ok(Self {
            descriptor,
            qemu_binary: qemu_binary.into(),
            qemu_img_binary,
            metadata_store,
            monitor,
            dhcp,
            process_factory,
            metadata: Mutex::new(metadata),
            shared: Arc::new(Shared::new(initial_state)),
            process: Mutex::new(None),
        })
    }

    pub fn vm_name(&self) -> &str {
        &self.descriptor.vm_name
    }

    pub async fn current_state(&self) -> LifecycleState {
        self.shared.state().await
    }

    pub fn ssh_port(&self) -> u16 {
        22
    }

    pub async fn ipv4(&self) -> String {
        if let Some(ip) = self.shared.ipv4.lock().await.clone() {
            return ip;
        }
        match self.dhcp.get_ip_for(&self.descriptor.mac_addr).await {
            Ok(Some(ip)) => {
                *self.shared.ipv4.lock().await = Some(ip.clone());
                ip
            }
            _ => "UNKNOWN".to_string(),
        }
    }

    pub fn ipv6(&self) -> &'static str {
        ""
    }

    /// Spawns QEMU with argument set V (resuming from the snapshot if the
    /// state is `Suspended`) and handshakes QMP.
    pub async fn start(&self) -> Result<()> {
        let current = self.shared.state().await;
        let resume = match current {
            LifecycleState::Running => return Ok(()),
            LifecycleState::Suspending => {
                return Err(VmError::CannotStartWhileSuspending {
                    name: self.descriptor.vm_name.clone(),
                });
            }
            LifecycleState::Off | LifecycleState::Unknown => false,
            LifecycleState::Suspended => true,
            other => {
                return Err(VmError::InvalidState {
                    name: self.descriptor.vm_name.clone(),
                    state: other.to_string(),
                });
            }
        };

        let metadata = self.metadata.lock().await.clone();
        let args = qemu_args(&self.descriptor, &metadata, resume);

        self.shared.update_shutdown_status.store(true, Ordering::SeqCst);
        self.shared.delete_memory_snapshot.store(resume, Ordering::SeqCst);

        let (handle, events) = self
            .process_factory
            .spawn(&self.qemu_binary, &args)
            .await?;
        let handle = Arc::new(handle);
        *self.process.lock().await = Some(handle.clone());

        handle
            .write(qmp::capabilities().encode_line().as_bytes())
            .await?;

        if let Ok(machine_type) = probe_machine_type(&self.qemu_binary).await {
            let latest = VmMetadata::latest(machine_type);
            *self.metadata.lock().await = latest.clone();
            if let Err(e) = self
                .metadata_store
                .save(&self.descriptor.vm_name, &latest)
                .await
            {
                tracing::warn!(vm = %self.descriptor.vm_name, error = %e, "failed to persist probed machine type");
            }
        }

        tokio::spawn(run_event_loop(
            self.shared.clone(),
            self.monitor.clone(),
            self.descriptor.vm_name.clone(),
            handle,
            events,
        ));

        Ok(())
    }

    /// Equivalent to [`Self::shutdown`].
    pub async fn stop(&self) -> Result<()> {
        self.shutdown().await
    }

    pub async fn shutdown(&self) -> Result<()> {
        let current = self.shared.state().await;
        if current == LifecycleState::Suspended {
            tracing::info!(vm = %self.descriptor.vm_name, "shutdown called while suspended; nothing to do");
            return Ok(());
        }

        let Some(process) = self.process.lock().await.clone() else {
            return Ok(());
        };

        if process.running()
            && matches!(
                current,
                LifecycleState::Running | LifecycleState::DelayedShutdown | LifecycleState::Unknown
            )
        {
            process
                .write(qmp::command("system_powerdown").encode_line().as_bytes())
                .await?;
        } else {
            if current == LifecycleState::Starting {
                self.shared.update_shutdown_status.store(false, Ordering::SeqCst);
            }
            process.kill().await;
        }
        process.wait_for_finished().await;
        Ok(())
    }

    pub async fn suspend(&self) -> Result<()> {
        let current = self.shared.state().await;
        match current {
            LifecycleState::Running | LifecycleState::DelayedShutdown => {
                let Some(process) = self.process.lock().await.clone() else {
                    return Ok(());
                };
                if process.running() {
                    process
                        .write(qmp::hmc("savevm suspend").encode_line().as_bytes())
                        .await?;
                    if self.shared.update_shutdown_status.load(Ordering::SeqCst) {
                        self.shared
                            .set_state_and_persist(LifecycleState::Suspending, &*self.monitor, &self.descriptor.vm_name)
                            .await;
                        self.shared.update_shutdown_status.store(false, Ordering::SeqCst);
                    }
                    process.wait_for_finished().await;
                }
                Ok(())
            }
            LifecycleState::Off | LifecycleState::Suspended => {
                tracing::info!(vm = %self.descriptor.vm_name, "suspend called while already at rest");
                self.monitor.on_suspend(&self.descriptor.vm_name).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Returns cached `ipv4` or polls [`DhcpDirectory::get_ip_for`] with
    /// retry for up to two minutes, calling [`Self::ensure_vm_is_running`]
    /// before every retry.
    pub async fn ssh_hostname(&self) -> Result<String> {
        if let Some(ip) = self.shared.ipv4.lock().await.clone() {
            return Ok(ip);
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
        loop {
            self.ensure_vm_is_running().await?;
            if let Ok(Some(ip)) = self.dhcp.get_ip_for(&self.descriptor.mac_addr).await {
                *self.shared.ipv4.lock().await = Some(ip.clone());
                return Ok(ip);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VmError::SshHostnameTimeout);
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    pub async fn wait_until_ssh_up(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.ensure_vm_is_running().await?;
            let ip = self.ipv4().await;
            if ip != "UNKNOWN" {
                let reachable = tokio::time::timeout(
                    Duration::from_secs(2),
                    tokio::net::TcpStream::connect((ip.as_str(), self.ssh_port())),
                )
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);

                if reachable {
                    if self.shared.delete_memory_snapshot.swap(false, Ordering::SeqCst) {
                        if let Some(process) = self.process.lock().await.clone() {
                            let _ = process
                                .write(qmp::hmc("delvm suspend").encode_line().as_bytes())
                                .await;
                        }
                    }
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VmError::SshUpTimeout);
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    /// Observes whether the child has already died while `state ==
    /// Starting`, forcing `Off` and raising `StartException` if so. The
    /// only unblocker of a concurrent `wait_until_off` wait.
    async fn ensure_vm_is_running(&self) -> Result<()> {
        let Some(process) = self.process.lock().await.clone() else {
            return Ok(());
        };
        if process.running() {
            return Ok(());
        }
        if self.shared.state().await == LifecycleState::Starting {
            self.shared.force_state(LifecycleState::Off).await;
            let message = self
                .shared
                .saved_error_msg
                .lock()
                .await
                .clone()
                .unwrap_or_else(|| "qemu process exited unexpectedly".to_string());
            return Err(VmError::StartException {
                name: self.descriptor.vm_name.clone(),
                message,
            });
        }
        Ok(())
    }
}

async fn handle_qmp_event<M: StatusMonitor>(
    event: QmpEvent,
    shared: &Shared,
    monitor: &M,
    process: &ProcessHandle,
    vm_name: &str,
) {
    match event {
        QmpEvent::Reset => {
            let current = shared.state().await;
            // Open question resolved: RESET while Suspending is ignored.
            if current != LifecycleState::Restarting && current != LifecycleState::Suspending {
                *shared.ipv4.lock().await = None;
                shared.set_state_and_persist(LifecycleState::Restarting, monitor, vm_name).await;
                monitor.on_restart(vm_name).await;
            }
        }
        QmpEvent::Powerdown | QmpEvent::Shutdown | QmpEvent::Stop => {
            tracing::debug!(vm = %vm_name, event = ?event, "qmp event observed (log only)");
        }
        QmpEvent::Resume => {
            let current = shared.state().await;
            if current == LifecycleState::Suspending || current == LifecycleState::Running {
                process.kill().await;
                shared.set_state_and_persist(LifecycleState::Suspended, monitor, vm_name).await;
                monitor.on_suspend(vm_name).await;
            }
        }
    }
}

async fn handle_finished<M: StatusMonitor>(shared: &Shared, monitor: &M, vm_name: &str) {
    let current = shared.state().await;
    let update_shutdown = shared.update_shutdown_status.load(Ordering::SeqCst);
    if !(update_shutdown || current == LifecycleState::Starting) {
        // The controller itself initiated this termination (suspend's
        // RESUME->kill, or the destructor); that path already ran its own
        // on_suspend/on_shutdown notification.
        return;
    }

    if current == LifecycleState::Starting {
        *shared.saved_error_msg.lock().await = Some("shutdown called while starting".to_string());
        tracing::warn!(vm = %vm_name, "shutdown called while starting");
        shared.wait_until_off().await;
    } else {
        shared.force_state(LifecycleState::Off).await;
    }

    *shared.ipv4.lock().await = None;
    monitor.persist_state(vm_name, LifecycleState::Off).await;
    monitor.on_shutdown(vm_name).await;
}

async fn run_event_loop<M: StatusMonitor>(
    shared: Arc<Shared>,
    monitor: Arc<M>,
    vm_name: String,
    process: Arc<ProcessHandle>,
    mut events: ProcessEvents,
) {
    use crate::process::ProcessEvent;

    while let Some(event) = events.next_event().await {
        match event {
            ProcessEvent::Started => {
                shared.set_state_and_persist(LifecycleState::Starting, &*monitor, &vm_name).await;
                monitor.on_resume(&vm_name).await;
            }
            ProcessEvent::Stdout(line) => {
                if let Some(qmp_event) = qmp::decode_event_line(&line) {
                    handle_qmp_event(qmp_event, &shared, &*monitor, &process, &vm_name).await;
                }
            }
            ProcessEvent::Stderr(line) => {
                tracing::warn!(vm = %vm_name, line = %line, "qemu stderr");
                *shared.saved_error_msg.lock().await = Some(line);
            }
            ProcessEvent::Error(message) => {
                tracing::warn!(vm = %vm_name, error = %message, "process abstraction reported an error");
                if shared.update_shutdown_status.load(Ordering::SeqCst) {
                    shared.force_state(LifecycleState::Off).await;
                }
            }
            ProcessEvent::Finished(_code) => {
                handle_finished(&shared, &*monitor, &vm_name).await;
            }
            ProcessEvent::StateChanged(_) => {}
        }
    }
}

impl<M, D, S, F> Drop for VmLifecycle<M, D, S, F>
where
    M: StatusMonitor + 'static,
    D: DhcpDirectory + 'static,
    S: VmMetadataStore + 'static,
    F: ProcessFactory + 'static,
{
    /// Clears `update_shutdown_status`, suspends if running else shuts
    /// down, removes the tap device (guarded by `ip addr show` succeeding
    /// first), then waits for the child. Must not panic or block the
    /// dropping thread indefinitely; `Drop` cannot be `async`, so when a
    /// Tokio runtime is already driving this thread the cleanup is merely
    /// spawned rather than awaited.
    fn drop(&mut self) {
        self.shared.update_shutdown_status.store(false, Ordering::SeqCst);

        let Ok(mut guard) = self.process.try_lock() else {
            return;
        };
        let Some(process) = guard.take() else {
            return;
        };
        drop(guard);

        let tap = self.descriptor.tap_device_name.clone();
        let cleanup = async move {
            if process.running() {
                let _ = process
                    .write(qmp::hmc("savevm suspend").encode_line().as_bytes())
                    .await;
            } else {
                process.kill().await;
            }
            process.wait_for_finished().await;

            let tap_present = tokio::process::Command::new("ip")
                .args(["addr", "show", &tap])
                .output()
                .await
                .map(|output| output.status.success())
                .unwrap_or(false);
            if tap_present {
                let _ = tokio::process::Command::new("ip")
                    .args(["link", "delete", &tap])
                    .status()
                    .await;
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup);
            }
            Err(_) => {
                if let Ok(rt) = tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    rt.block_on(cleanup);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_detection_matches_a_suspend_tag_line() {
        let present = "ID TAG VM_SIZE DATE\n1 suspend 512M 2026-01-01\n";
        assert!(snapshot_tag_present(present));
        let absent = "ID TAG VM_SIZE DATE\n";
        assert!(!snapshot_tag_present(absent));
    }

    #[test]
    fn resume_args_chooses_cdrom_for_legacy_metadata() {
        let legacy = VmMetadata {
            vm_command_version: 1,
            machine_type: "pc-i440fx-xenial".to_string(),
        };
        let args = resume_args(&legacy, Some(Path::new("/tmp/seed.iso")));
        assert!(args.iter().any(|a| a == "-cdrom"));
        assert!(!args.iter().any(|a| a.starts_with("file=") && a.contains("format=raw")));
    }

    #[test]
    fn resume_args_chooses_virtio_drive_for_current_metadata() {
        let latest = VmMetadata::latest("pc-q35-8.2");
        let args = resume_args(&latest, Some(Path::new("/tmp/seed.iso")));
        assert!(!args.iter().any(|a| a == "-cdrom"));
        assert!(args.iter().any(|a| a.contains("format=raw,snapshot=off,read-only=on")));
    }

    #[test]
    fn resume_args_always_includes_loadvm_and_machine() {
        let latest = VmMetadata::latest("pc-q35-8.2");
        let args = resume_args(&latest, None);
        assert_eq!(args[0], "-loadvm");
        assert_eq!(args[1], "suspend");
        assert_eq!(args[2], "-machine");
        assert_eq!(args[3], "pc-q35-8.2");
    }
}
