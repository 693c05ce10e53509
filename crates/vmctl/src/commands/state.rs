//! Local CLI state: the `{name: VmHandle}` map every other command reads
//! and writes, persisted as one JSON file so a `VmHandle` prepared by one
//! `vmctl` invocation is still there for the next.

use std::collections::HashMap;
use std::path::PathBuf;

use miette::{IntoDiagnostic, Result};
use vm_manager::VmHandle;

pub type Store = HashMap<String, VmHandle>;

fn store_path() -> PathBuf {
    std::env::var_os("VMCTL_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("vmctl")
        })
        .join("state.json")
}

pub async fn load_store() -> Result<Store> {
    let path = store_path();
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).into_diagnostic(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Store::new()),
        Err(e) => Err(e).into_diagnostic(),
    }
}

pub async fn save_store(store: &Store) -> Result<()> {
    let path = store_path();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.into_diagnostic()?;
    }
    let bytes = serde_json::to_vec_pretty(store).into_diagnostic()?;
    tokio::fs::write(&path, bytes).await.into_diagnostic()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_path_lands_under_data_dir_state_json() {
        let path = store_path();
        assert_eq!(path.file_name().unwrap(), "state.json");
        assert_eq!(
            path.parent().and_then(|p| p.file_name()),
            Some(std::ffi::OsStr::new("vmctl"))
        );
    }
}
