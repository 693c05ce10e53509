//! Owns at most one `VmLifecycle` per defined VM, constructed lazily from a
//! persisted
//! `VmDescriptor` the first time a control request names that VM.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use vm_manager::{
    ArpDhcpDirectory, DescriptorStore, FileMetadataStore, FileStatusMonitor, SystemProcessFactory,
    VmError, VmLifecycle,
};

use crate::config::Config;

pub type Lifecycle =
    VmLifecycle<FileStatusMonitor, ArpDhcpDirectory, FileMetadataStore, SystemProcessFactory>;

/// A supervised VM: its lifecycle plus a lock serializing operations on it.
/// A second `start`/`stop` arriving while one is already in flight for the
/// same name queues behind this lock instead of racing a second QEMU spawn.
struct Entry {
    lifecycle: Arc<Lifecycle>,
    op_lock: Arc<Mutex<()>>,
}

pub struct Supervisor {
    config: Config,
    descriptors: DescriptorStore,
    metadata_store: Arc<FileMetadataStore>,
    monitor: Arc<FileStatusMonitor>,
    dhcp: Arc<ArpDhcpDirectory>,
    process_factory: Arc<SystemProcessFactory>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        let metadata_store = Arc::new(FileMetadataStore::new(config.data_dir.join("metadata")));
        let monitor = Arc::new(FileStatusMonitor::new(config.data_dir.join("status.log")));
        let descriptors = DescriptorStore::new(config.data_dir.join("descriptors"));
        Self {
            descriptors,
            metadata_store,
            monitor,
            dhcp: Arc::new(ArpDhcpDirectory::new()),
            process_factory: Arc::new(SystemProcessFactory),
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Returns the lifecycle for `vm_name` plus its op lock, constructing
    /// (from the persisted descriptor) and caching it on first use.
    pub async fn get_or_construct(
        &self,
        vm_name: &str,
    ) -> vm_manager::Result<(Arc<Lifecycle>, Arc<Mutex<()>>)> {
        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(vm_name) {
                return Ok((entry.lifecycle.clone(), entry.op_lock.clone()));
            }
        }

        let descriptor = self
            .descriptors
            .load(vm_name)
            .await?
            .ok_or_else(|| VmError::NotFound(vm_name.to_string()))?;

        let lifecycle = Lifecycle::new(
            descriptor,
            self.metadata_store.clone(),
            self.monitor.clone(),
            self.dhcp.clone(),
            self.process_factory.clone(),
            self.config.qemu_binary.clone(),
            self.config.qemu_img_binary.clone(),
        )
        .await?;
        let lifecycle = Arc::new(lifecycle);
        let op_lock = Arc::new(Mutex::new(()));

        // Another task may have raced us between the lookup above and here;
        // `or_insert` makes whichever one wins the one every caller sees.
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(vm_name.to_string()).or_insert(Entry {
            lifecycle,
            op_lock,
        });
        Ok((entry.lifecycle.clone(), entry.op_lock.clone()))
    }
}
