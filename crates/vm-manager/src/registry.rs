//! Persisted `VmDescriptor` registry: the durable record `vmctl create`
//! writes and `vmd` reads back to lazily
//! construct a [`crate::VmLifecycle`] for a VM it hasn't loaded into memory
//! yet. Same one-JSON-file-per-VM shape as [`crate::metadata::FileMetadataStore`].

use std::path::PathBuf;

use crate::error::{Result, VmError};
use crate::types::VmDescriptor;

pub struct DescriptorStore {
    dir: PathBuf,
}

impl DescriptorStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// `{XDG_DATA_HOME}/vmctl/descriptors/`, matching `metadata.rs`'s layout
    /// and respecting `VMCTL_DATA_DIR` the same way `vmd`'s `Config::load`
    /// and `vmctl`'s `state::store_path` do, so a descriptor `vmctl create`
    /// saves is the one `vmd` looks up under a shared override.
    pub fn default_dir() -> PathBuf {
        std::env::var_os("VMCTL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join("vmctl")
            })
            .join("descriptors")
    }

    fn path_for(&self, vm_name: &str) -> PathBuf {
        self.dir.join(format!("{vm_name}.json"))
    }

    pub async fn save(&self, descriptor: &VmDescriptor) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&descriptor.vm_name);
        let bytes = serde_json::to_vec_pretty(descriptor)
            .map_err(|e| VmError::other(format!("failed to encode descriptor: {e}")))?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    pub async fn load(&self, vm_name: &str) -> Result<Option<VmDescriptor>> {
        let path = self.path_for(vm_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let descriptor = serde_json::from_slice(&bytes).map_err(|e| {
                    VmError::other(format!("malformed descriptor at {}: {e}", path.display()))
                })?;
                Ok(Some(descriptor))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove(&self, vm_name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(vm_name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.path().file_stem().and_then(|s| s.to_str()) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

impl Default for DescriptorStore {
    fn default() -> Self {
        Self::new(Self::default_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str) -> VmDescriptor {
        VmDescriptor {
            vm_name: name.to_string(),
            image_path: PathBuf::from("/var/lib/vmctl/nova.qcow2"),
            cloud_init_path: None,
            tap_device_name: "tap-nova".to_string(),
            mac_addr: "52:54:00:12:34:56".to_string(),
            ssh_username: "ubuntu".to_string(),
        }
    }

    #[tokio::test]
    async fn round_trips_a_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let store = DescriptorStore::new(dir.path().to_path_buf());

        assert!(store.load("nova").await.unwrap().is_none());

        store.save(&sample("nova")).await.unwrap();
        let loaded = store.load("nova").await.unwrap().unwrap();
        assert_eq!(loaded.vm_name, "nova");
        assert_eq!(loaded.mac_addr, "52:54:00:12:34:56");
    }

    #[tokio::test]
    async fn list_returns_all_saved_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = DescriptorStore::new(dir.path().to_path_buf());

        store.save(&sample("nova")).await.unwrap();
        store.save(&sample("webby")).await.unwrap();

        let mut names = store.list().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["nova".to_string(), "webby".to_string()]);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = DescriptorStore::new(dir.path().to_path_buf());
        store.remove("missing").await.unwrap();
    }
}
