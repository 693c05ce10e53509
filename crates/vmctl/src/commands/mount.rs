//! `vmctl mount`: the SSHFS bootstrap wired up as a CLI command.
//! Blocks in the foreground for the lifetime of the mount, the same way
//! `vmctl console` blocks while attached.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Args;
use miette::{IntoDiagnostic, Result};
use vm_manager::sshfs::mount::{IdMap, SshfsMount};
use vm_manager::ssh::SshChannelExec;
use vm_manager::{Hypervisor, NetworkConfig, RouterHypervisor, SshConfig};

use super::state;

#[derive(Args)]
pub struct MountArgs {
    /// VM name
    name: String,

    /// Local path to share
    source: PathBuf,

    /// Path inside the guest to mount it at
    target: String,

    /// SSH user (overrides VMFile ssh block)
    #[arg(long)]
    user: Option<String>,

    /// Path to SSH private key
    #[arg(long)]
    key: Option<PathBuf>,

    /// Path to VMFile.kdl (for reading ssh user)
    #[arg(long)]
    file: Option<PathBuf>,

    /// host:guest uid mappings, comma-separated (e.g. "1000:501,0:0")
    #[arg(long)]
    uidmap: Option<String>,

    /// host:guest gid mappings, comma-separated
    #[arg(long)]
    gidmap: Option<String>,
}

fn parse_id_map(raw: &str) -> Result<IdMap> {
    let mut map = BTreeMap::new();
    for pair in raw.split(',').filter(|s| !s.is_empty()) {
        let (host, guest) = pair
            .split_once(':')
            .ok_or_else(|| miette::miette!("invalid id map entry '{pair}', expected host:guest"))?;
        let host: u32 = host
            .parse()
            .map_err(|_| miette::miette!("invalid host id '{host}' in id map"))?;
        let guest: u32 = guest
            .parse()
            .map_err(|_| miette::miette!("invalid guest id '{guest}' in id map"))?;
        map.insert(host, guest);
    }
    Ok(map)
}

pub async fn run(args: MountArgs) -> Result<()> {
    let store = state::load_store().await?;
    let handle = store
        .get(&args.name)
        .ok_or_else(|| miette::miette!("VM '{}' not found", args.name))?;

    let hv = RouterHypervisor::new(None, None);
    let (ip, port) = match handle.network {
        NetworkConfig::User => ("127.0.0.1".to_string(), handle.ssh_host_port.unwrap_or(22)),
        _ => (hv.guest_ip(handle).await.into_diagnostic()?, 22),
    };

    let vmfile_user = vm_manager::vmfile::discover(args.file.as_deref())
        .ok()
        .and_then(|path| vm_manager::vmfile::parse(&path).ok())
        .and_then(|vmfile| {
            vmfile
                .vms
                .iter()
                .find(|d| d.name == args.name)
                .and_then(|d| d.ssh.as_ref())
                .map(|s| s.user.clone())
        });
    let user = args
        .user
        .or(vmfile_user)
        .unwrap_or_else(|| "vm".to_string());

    let generated_key = handle.work_dir.join(super::GENERATED_KEY_FILE);
    let key_path = args
        .key
        .or_else(|| generated_key.exists().then_some(generated_key))
        .ok_or_else(|| {
            miette::miette!("no SSH key found — provide one with --key or create the VM first")
        })?;

    let config = SshConfig {
        user: user.clone(),
        public_key: None,
        private_key_path: Some(key_path),
        private_key_pem: None,
    };

    println!("Connecting to {user}@{ip}:{port} to mount {}...", args.source.display());
    let ssh = SshChannelExec::connect(&ip, port, &config)
        .await
        .into_diagnostic()?;

    let uid_map = args
        .uidmap
        .as_deref()
        .map(parse_id_map)
        .transpose()?
        .unwrap_or_default();
    let gid_map = args
        .gidmap
        .as_deref()
        .map(parse_id_map)
        .transpose()?
        .unwrap_or_default();

    let mount = SshfsMount::mount(&ssh, &args.source, &args.target, uid_map, gid_map)
        .await
        .into_diagnostic()?;

    let (major, minor, patch) = mount.identity().fuse_version;
    let fuse_version = match patch {
        Some(patch) => format!("{major}.{minor}.{patch}"),
        None => format!("{major}.{minor}"),
    };
    println!(
        "Mounted {} at {}:{} (remote sshfs, fuse {fuse_version})",
        args.source.display(),
        args.name,
        args.target,
    );
    println!("Press Ctrl+C to unmount.");

    tokio::task::spawn_blocking(move || mount.join())
        .await
        .into_diagnostic()?
        .into_diagnostic()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_id_map_entries() {
        let map = parse_id_map("1000:501,0:0").unwrap();
        assert_eq!(map.get(&1000), Some(&501));
        assert_eq!(map.get(&0), Some(&0));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn empty_id_map_string_yields_empty_map() {
        assert!(parse_id_map("").unwrap().is_empty());
    }

    #[test]
    fn rejects_entry_missing_a_colon() {
        assert!(parse_id_map("1000").is_err());
    }

    #[test]
    fn rejects_non_numeric_ids() {
        assert!(parse_id_map("abc:0").is_err());
        assert!(parse_id_map("0:abc").is_err());
    }
}
