//! `StatusMonitor` and the `DhcpDirectory` collaborator. Both are named
//! interfaces only; `vm-manager` supplies a minimal
//! concrete implementation of each so the crate is usable standalone, but
//! `VmLifecycle` is generic over any implementation an embedder supplies.

use std::path::PathBuf;

use crate::error::Result;
use crate::types::LifecycleState;

/// Receives `VmLifecycle`'s lifecycle callbacks (`on_resume` / `on_restart` /
/// `on_suspend` / `on_shutdown`) and persists `LifecycleState`.
/// `persist_state` is called ahead of the corresponding `on_*` notification
/// whenever a transition requires both.
pub trait StatusMonitor: Send + Sync {
    fn persist_state(
        &self,
        vm_name: &str,
        state: LifecycleState,
    ) -> impl Future<Output = ()> + Send;
    fn on_resume(&self, vm_name: &str) -> impl Future<Output = ()> + Send;
    fn on_restart(&self, vm_name: &str) -> impl Future<Output = ()> + Send;
    fn on_suspend(&self, vm_name: &str) -> impl Future<Output = ()> + Send;
    fn on_shutdown(&self, vm_name: &str) -> impl Future<Output = ()> + Send;
}

/// Appends one JSON line per callback to a log file. This is the minimal
/// concrete `StatusMonitor`: it does not attempt to model the richer
/// persisted `State` the collaborator interface alludes to, since that
/// store is out of scope here.
pub struct FileStatusMonitor {
    path: PathBuf,
}

impl FileStatusMonitor {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn state_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".state.json");
        PathBuf::from(name)
    }

    async fn append(&self, vm_name: &str, event: &str) {
        let line = serde_json::json!({ "vm": vm_name, "event": event }).to_string();
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let result = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await;
        match result {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
                    tracing::warn!(error = %e, path = %self.path.display(), "failed to append status log");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %self.path.display(), "failed to open status log");
            }
        }
    }
}

impl StatusMonitor for FileStatusMonitor {
    async fn persist_state(&self, vm_name: &str, state: LifecycleState) {
        let line = serde_json::json!({ "vm": vm_name, "state": state.to_string() }).to_string();
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let state_path = self.state_path();
        if let Err(e) = tokio::fs::write(&state_path, line).await {
            tracing::warn!(error = %e, path = %state_path.display(), "failed to persist lifecycle state");
        }
    }

    async fn on_resume(&self, vm_name: &str) {
        self.append(vm_name, "resume").await;
    }

    async fn on_restart(&self, vm_name: &str) {
        self.append(vm_name, "restart").await;
    }

    async fn on_suspend(&self, vm_name: &str) {
        self.append(vm_name, "suspend").await;
    }

    async fn on_shutdown(&self, vm_name: &str) {
        self.append(vm_name, "shutdown").await;
    }
}

/// Out-of-scope collaborator: resolves a MAC address to an IPv4 lease.
pub trait DhcpDirectory: Send + Sync {
    fn get_ip_for(&self, mac_addr: &str) -> impl Future<Output = Result<Option<String>>> + Send;
}

/// Looks up `mac_addr` first in the kernel ARP/neighbor table, falling back
/// to the dnsmasq lease file. This is the heuristic the prior backend used
/// inline for `guest_ip`; it is preserved verbatim as the concrete
/// `DhcpDirectory`, since the collaborator has no deeper contract than
/// "resolve a MAC to an address".
pub struct ArpDhcpDirectory {
    dnsmasq_leases_path: PathBuf,
}

impl ArpDhcpDirectory {
    pub fn new() -> Self {
        Self {
            dnsmasq_leases_path: PathBuf::from("/var/lib/misc/dnsmasq.leases"),
        }
    }

    pub fn with_leases_path(path: PathBuf) -> Self {
        Self {
            dnsmasq_leases_path: path,
        }
    }
}

impl Default for ArpDhcpDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl DhcpDirectory for ArpDhcpDirectory {
    async fn get_ip_for(&self, mac_addr: &str) -> Result<Option<String>> {
        let mac_lower = mac_addr.to_lowercase();

        if let Ok(output) = tokio::process::Command::new("ip")
            .args(["neigh", "show"])
            .output()
            .await
        {
            let text = String::from_utf8_lossy(&output.stdout);
            for line in text.lines() {
                if !line.to_lowercase().contains(&mac_lower) {
                    continue;
                }
                if !(line.contains("REACHABLE") || line.contains("STALE")) {
                    continue;
                }
                if let Some(ip) = line.split_whitespace().next() {
                    if ip.contains('.') && !ip.starts_with("127.") {
                        return Ok(Some(ip.to_string()));
                    }
                }
            }
        }

        if let Ok(content) = tokio::fs::read_to_string(&self.dnsmasq_leases_path).await {
            // Lease format: epoch MAC IP hostname clientid
            for line in content.lines() {
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() >= 3 && parts[1].to_lowercase() == mac_lower {
                    return Ok(Some(parts[2].to_string()));
                }
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_status_monitor_appends_one_line_per_callback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.log");
        let monitor = FileStatusMonitor::new(path.clone());

        monitor.persist_state("nova", LifecycleState::Starting).await;
        monitor.on_resume("nova").await;
        monitor.on_restart("nova").await;
        monitor.on_suspend("nova").await;
        monitor.on_shutdown("nova").await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 4);
        assert!(content.contains("\"event\":\"resume\""));
        assert!(content.contains("\"event\":\"shutdown\""));
    }

    #[tokio::test]
    async fn dhcp_directory_finds_a_matching_lease() {
        let dir = tempfile::tempdir().unwrap();
        let leases_path = dir.path().join("dnsmasq.leases");
        tokio::fs::write(
            &leases_path,
            "1234567890 52:54:00:12:34:56 192.168.122.50 nova *\n",
        )
        .await
        .unwrap();

        let directory = ArpDhcpDirectory::with_leases_path(leases_path);
        let ip = directory.get_ip_for("52:54:00:12:34:56").await.unwrap();
        assert_eq!(ip.as_deref(), Some("192.168.122.50"));
    }

    #[tokio::test]
    async fn dhcp_directory_returns_none_for_unknown_mac() {
        let dir = tempfile::tempdir().unwrap();
        let leases_path = dir.path().join("dnsmasq.leases");
        tokio::fs::write(&leases_path, "").await.unwrap();

        let directory = ArpDhcpDirectory::with_leases_path(leases_path);
        let ip = directory.get_ip_for("00:00:00:00:00:00").await.unwrap();
        assert_eq!(ip, None);
    }
}
