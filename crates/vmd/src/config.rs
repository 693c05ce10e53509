//! Daemon configuration: resolves the control socket, lock file, log file,
//! and QEMU binary paths,
//! all overridable by environment variable, following the
//! `QemuBackend::new` pattern already used for the CLI-facing backend.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub socket_path: PathBuf,
    pub lock_path: PathBuf,
    pub log_path: PathBuf,
    pub data_dir: PathBuf,
    pub qemu_binary: String,
    pub qemu_img_binary: String,
}

impl Config {
    pub fn load() -> Self {
        let runtime_dir = vm_manager::control::runtime_dir();

        let data_dir = std::env::var_os("VMCTL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join("vmctl")
            });

        let qemu_binary = std::env::var("VMCTL_QEMU_BINARY")
            .unwrap_or_else(|_| "qemu-system-x86_64".to_string());
        let qemu_img_binary = std::env::var("VMCTL_QEMU_IMG_BINARY")
            .unwrap_or_else(|_| "qemu-img".to_string());

        Config {
            socket_path: vm_manager::control::socket_path(),
            lock_path: runtime_dir.join("vmd.pid"),
            log_path: data_dir.join("vmd.log"),
            data_dir,
            qemu_binary,
            qemu_img_binary,
        }
    }
}
