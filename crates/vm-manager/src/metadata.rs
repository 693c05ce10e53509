//! `VmMetadataStore` collaborator.
//!
//! Persists the two fields `VmLifecycle` needs across restarts of the
//! controller itself: the QEMU command-line "version" that produced a VM's
//! current disk layout, and the machine type it was last started with.
//! Reading tolerates a legacy on-disk shape; writing always emits the
//! current shape, same as `image.rs`'s cache-file handling elsewhere in
//! this crate.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, VmError};

/// Default machine type applied when no metadata has ever been persisted.
pub const DEFAULT_MACHINE_TYPE: &str = "pc-i440fx-xenial";

/// Current latest command-line version this controller writes.
pub const LATEST_COMMAND_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmMetadata {
    pub vm_command_version: u32,
    pub machine_type: String,
}

impl Default for VmMetadata {
    fn default() -> Self {
        Self {
            vm_command_version: 0,
            machine_type: DEFAULT_MACHINE_TYPE.to_string(),
        }
    }
}

impl VmMetadata {
    /// Current metadata, ready to persist for a freshly prepared VM.
    pub fn latest(machine_type: impl Into<String>) -> Self {
        Self {
            vm_command_version: LATEST_COMMAND_VERSION,
            machine_type: machine_type.into(),
        }
    }

    /// Whether `qemu_args` should emit `-cdrom` instead of the virtio
    /// `-drive` form for the cloud-init seed on resume.
    pub fn use_cdrom(&self) -> bool {
        self.vm_command_version == 1
    }

    /// Parse possibly-legacy JSON: if `vm_command_version` is absent, infer
    /// version 1 from a legacy `use_cdrom: true`, else 0.
    fn from_json(value: Value) -> Self {
        let vm_command_version = value
            .get("vm_command_version")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or_else(|| {
                if value.get("use_cdrom").and_then(Value::as_bool) == Some(true) {
                    1
                } else {
                    0
                }
            });
        let machine_type = value
            .get("machine_type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_MACHINE_TYPE.to_string());
        Self {
            vm_command_version,
            machine_type,
        }
    }
}

/// Collaborator interface: loads/saves per-VM JSON metadata.
pub trait VmMetadataStore: Send + Sync {
    fn load(&self, vm_name: &str) -> impl Future<Output = Result<Option<VmMetadata>>> + Send;
    fn save(&self, vm_name: &str, metadata: &VmMetadata) -> impl Future<Output = Result<()>> + Send;
}

/// Default implementation: one JSON file per VM under a data directory.
pub struct FileMetadataStore {
    dir: PathBuf,
}

impl FileMetadataStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// `{XDG_DATA_HOME}/vmctl/metadata/`, matching `image::cache_dir`'s layout.
    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("vmctl")
            .join("metadata")
    }

    fn path_for(&self, vm_name: &str) -> PathBuf {
        self.dir.join(format!("{vm_name}.json"))
    }
}

impl Default for FileMetadataStore {
    fn default() -> Self {
        Self::new(Self::default_dir())
    }
}

impl VmMetadataStore for FileMetadataStore {
    async fn load(&self, vm_name: &str) -> Result<Option<VmMetadata>> {
        let path = self.path_for(vm_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let value: Value = serde_json::from_slice(&bytes).map_err(|e| {
                    VmError::other(format!(
                        "malformed metadata at {}: {e}",
                        path.display()
                    ))
                })?;
                Ok(Some(VmMetadata::from_json(value)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, vm_name: &str, metadata: &VmMetadata) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(vm_name);
        let bytes = serde_json::to_vec_pretty(metadata)
            .map_err(|e| VmError::other(format!("failed to encode metadata: {e}")))?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(v: Value) -> VmMetadata {
        VmMetadata::from_json(v)
    }

    #[test]
    fn legacy_use_cdrom_true_infers_version_one() {
        let m = check(serde_json::json!({"use_cdrom": true}));
        assert_eq!(m.vm_command_version, 1);
        assert!(m.use_cdrom());
    }

    #[test]
    fn absent_version_and_no_legacy_key_infers_zero() {
        let m = check(serde_json::json!({"machine_type": "pc-i440fx-xenial"}));
        assert_eq!(m.vm_command_version, 0);
        assert!(!m.use_cdrom());
    }

    #[test]
    fn explicit_version_wins_over_legacy_key() {
        let m = check(serde_json::json!({"vm_command_version": 0, "use_cdrom": true}));
        assert_eq!(m.vm_command_version, 0);
    }

    #[test]
    fn missing_machine_type_falls_back_to_default() {
        let m = check(serde_json::json!({"vm_command_version": 1}));
        assert_eq!(m.machine_type, DEFAULT_MACHINE_TYPE);
    }

    #[tokio::test]
    async fn round_trips_through_a_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMetadataStore::new(dir.path().to_path_buf());

        assert!(store.load("nova").await.unwrap().is_none());

        let latest = VmMetadata::latest("pc-q35-8.2");
        store.save("nova", &latest).await.unwrap();

        let loaded = store.load("nova").await.unwrap().unwrap();
        assert_eq!(loaded, latest);
    }

    #[tokio::test]
    async fn reads_a_legacy_file_written_without_vm_command_version() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("legacy.json"),
            br#"{"use_cdrom": true, "machine_type": "pc-i440fx-xenial"}"#,
        )
        .await
        .unwrap();

        let store = FileMetadataStore::new(dir.path().to_path_buf());
        let loaded = store.load("legacy").await.unwrap().unwrap();
        assert_eq!(loaded.vm_command_version, 1);
        assert_eq!(loaded.machine_type, "pc-i440fx-xenial");
    }
}
