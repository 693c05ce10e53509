//! `vmctl create`: builds a [`vm_manager::VmSpec`] from CLI flags (optionally
//! defaulted from a `VMFile.kdl`), prepares it through the [`RouterHypervisor`],
//! and persists the resulting handle — mirroring the flag-resolution idiom
//! `ssh.rs` already established (CLI flag wins, then `VMFile.kdl`, then a
//! hardcoded default).

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use miette::{IntoDiagnostic, Result};
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use vm_manager::vmfile::VmDef;
use vm_manager::{
    CloudInitSpec, Hypervisor, NetworkConfig, RouterHypervisor, SshConfig, VmSpec,
};

use super::state;

#[derive(Args)]
pub struct CreateArgs {
    /// VM name (inferred from VMFile.kdl if omitted and only one VM is defined)
    name: Option<String>,

    /// Path to a base image, or a name already present in the image cache
    #[arg(long)]
    image: Option<String>,

    /// Path to VMFile.kdl to read defaults from
    #[arg(long)]
    file: Option<PathBuf>,

    /// Number of vCPUs
    #[arg(long)]
    cpus: Option<u32>,

    /// Memory size, e.g. "2G" or "512M"
    #[arg(long)]
    memory: Option<String>,

    /// Overlay disk size, e.g. "10G" (defaults to the base image's own size)
    #[arg(long)]
    disk: Option<String>,

    /// Networking mode: "user" (host-forwarded SSH port), "tap" (bridged,
    /// also registers the VM with `vmd` for the daemon-backed subcommands),
    /// or "none"
    #[arg(long, default_value = "user")]
    network: String,

    /// Host tap device name to bridge to, required when --network=tap
    #[arg(long)]
    tap_device: Option<String>,

    /// SSH user to authorize the generated (or supplied) key for
    #[arg(long)]
    ssh_user: Option<String>,

    /// Path to an existing SSH public key to authorize instead of generating one
    #[arg(long)]
    ssh_key: Option<PathBuf>,

    /// Start the VM immediately after creating it
    #[arg(long)]
    start: bool,
}

const DEFAULT_VCPUS: u32 = 1;
const DEFAULT_MEMORY_MB: u32 = 1024;
const DEFAULT_SSH_USER: &str = "vm";

/// Parse a size string like "2G" or "512M" into megabytes. Bare numbers are
/// taken as megabytes already (the unit `VmSpec::memory_mb` is in).
fn parse_size_mb(raw: &str) -> Result<u32> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'g') => (&raw[..raw.len() - 1], 1024),
        Some(c) if c.eq_ignore_ascii_case(&'m') => (&raw[..raw.len() - 1], 1),
        Some(c) if c.eq_ignore_ascii_case(&'k') => (&raw[..raw.len() - 1], 0),
        _ => (raw, 1),
    };
    let value: u32 = digits
        .trim()
        .parse()
        .map_err(|_| miette::miette!("invalid size '{raw}', expected e.g. '2G' or '512M'"))?;
    Ok(value * multiplier)
}

/// Same shape, but in gigabytes (`VmSpec::disk_gb`'s unit) — "10G" -> 10,
/// "2048M" -> 2 (rounded down, which is the conservative direction for an
/// overlay size).
fn parse_size_gb(raw: &str) -> Result<u32> {
    let raw = raw.trim();
    match raw.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'m') => {
            Ok(parse_size_mb(raw)? / 1024)
        }
        Some(c) if c.eq_ignore_ascii_case(&'g') => {
            raw[..raw.len() - 1]
                .trim()
                .parse()
                .map_err(|_| miette::miette!("invalid size '{raw}', expected e.g. '10G'"))
        }
        _ => raw
            .parse()
            .map_err(|_| miette::miette!("invalid size '{raw}', expected e.g. '10G'")),
    }
}

fn lookup_vmdef(name: &str, explicit_file: Option<&Path>) -> Option<VmDef> {
    let path = vm_manager::vmfile::discover(explicit_file).ok()?;
    let vmfile = vm_manager::vmfile::parse(&path).ok()?;
    vmfile.vms.into_iter().find(|d| d.name == name)
}

fn default_vm_name(explicit_file: Option<&Path>) -> Option<String> {
    let path = vm_manager::vmfile::discover(explicit_file).ok()?;
    let vmfile = vm_manager::vmfile::parse(&path).ok()?;
    if vmfile.vms.len() == 1 {
        Some(vmfile.vms[0].name.clone())
    } else {
        None
    }
}

/// Resolve `--image` (a path, or a name already pulled into the cache) to an
/// image file on disk.
async fn resolve_image(raw: &str) -> Result<PathBuf> {
    let as_path = PathBuf::from(raw);
    if as_path.is_file() {
        return Ok(as_path);
    }
    let cached = vm_manager::image::cache_dir().join(raw);
    if cached.is_file() {
        return Ok(cached);
    }
    Err(miette::miette!(
        "image '{raw}' not found as a file or in the image cache — run `vmctl image pull` first"
    ))
}

/// Generate an ed25519 keypair under `work_dir/id_ed25519{,.pub}` unless one
/// is already there from a previous `create` attempt. Returns the public key
/// in `authorized_keys` format, to embed in cloud-init.
async fn ensure_generated_key(work_dir: &Path) -> Result<String> {
    let private_path = work_dir.join(super::GENERATED_KEY_FILE);
    let public_path = work_dir.join(format!("{}.pub", super::GENERATED_KEY_FILE));

    if let Ok(existing) = tokio::fs::read_to_string(&public_path).await {
        return Ok(existing);
    }

    tokio::fs::create_dir_all(work_dir).await.into_diagnostic()?;

    let private_key = PrivateKey::random(ssh_key::rand_core::OsRng, Algorithm::Ed25519)
        .map_err(|e| miette::miette!("failed to generate SSH keypair: {e}"))?;
    let private_pem = private_key
        .to_openssh(LineEnding::LF)
        .map_err(|e| miette::miette!("failed to encode SSH private key: {e}"))?;
    let public_line = private_key
        .public_key()
        .to_openssh()
        .map_err(|e| miette::miette!("failed to encode SSH public key: {e}"))?;

    tokio::fs::write(&private_path, private_pem.as_str())
        .await
        .into_diagnostic()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&private_path, perms)
            .await
            .into_diagnostic()?;
    }
    tokio::fs::write(&public_path, format!("{public_line}\n"))
        .await
        .into_diagnostic()?;

    Ok(public_line)
}

pub async fn run(args: CreateArgs) -> Result<()> {
    let name = args
        .name
        .clone()
        .or_else(|| default_vm_name(args.file.as_deref()))
        .ok_or_else(|| {
            miette::miette!(
                "no VM name provided and VMFile.kdl defines multiple VMs — specify one explicitly"
            )
        })?;

    let mut store = state::load_store().await?;
    if store.contains_key(&name) {
        miette::bail!("VM '{name}' already exists");
    }

    let vmdef = lookup_vmdef(&name, args.file.as_deref());
    let base_dir = args
        .file
        .as_deref()
        .and_then(|p| p.parent())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let image_raw = args
        .image
        .clone()
        .or_else(|| vmdef.as_ref().and_then(|d| d.image.clone()))
        .ok_or_else(|| miette::miette!("no --image given and none found in VMFile.kdl"))?;
    let image_path = resolve_image(&image_raw).await?;

    let vcpus = args
        .cpus
        .or_else(|| vmdef.as_ref().and_then(|d| d.cpus))
        .unwrap_or(DEFAULT_VCPUS);
    let memory_mb = args
        .memory
        .as_deref()
        .map(parse_size_mb)
        .transpose()?
        .or_else(|| vmdef.as_ref().and_then(|d| d.memory.as_deref()).map(parse_size_mb).transpose().ok().flatten())
        .unwrap_or(DEFAULT_MEMORY_MB);
    let disk_gb = args
        .disk
        .as_deref()
        .map(parse_size_gb)
        .transpose()?
        .or_else(|| vmdef.as_ref().and_then(|d| d.disk.as_deref()).map(parse_size_gb).transpose().ok().flatten());

    let ssh_user = args
        .ssh_user
        .clone()
        .or_else(|| vmdef.as_ref().and_then(|d| d.ssh.as_ref()).map(|s| s.user.clone()))
        .unwrap_or_else(|| DEFAULT_SSH_USER.to_string());

    let network = match args.network.as_str() {
        "none" => NetworkConfig::None,
        "user" => NetworkConfig::User,
        "tap" => {
            let device = args
                .tap_device
                .clone()
                .ok_or_else(|| miette::miette!("--tap-device is required when --network=tap"))?;
            NetworkConfig::Tap {
                device,
                mac_addr: vm_manager::backends::qemu::QemuBackend::generate_mac(),
            }
        }
        other => {
            miette::bail!("unknown --network value '{other}', expected 'user', 'tap', or 'none'")
        }
    };

    // The work directory QemuBackend::prepare() will create for this VM
    // (`RouterHypervisor::new(None, None)`'s default data dir), precomputed
    // so the SSH key generated below can be embedded into cloud-init before
    // prepare() builds the seed ISO.
    let work_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vmctl")
        .join("vms")
        .join(&name);

    let authorized_key = if let Some(ref key_path) = args.ssh_key {
        tokio::fs::read_to_string(key_path)
            .await
            .into_diagnostic()?
    } else {
        ensure_generated_key(&work_dir).await?
    };

    let user_data = format!(
        "#cloud-config\nusers:\n  - name: {ssh_user}\n    sudo: ALL=(ALL) NOPASSWD:ALL\n    shell: /bin/bash\n    ssh_authorized_keys:\n      - {}\n",
        authorized_key.trim()
    );

    let spec = VmSpec {
        name: name.clone(),
        image_path,
        vcpus,
        memory_mb,
        disk_gb,
        network,
        cloud_init: Some(CloudInitSpec {
            instance_id: None,
            hostname: Some(name.clone()),
            user_data: user_data.into_bytes(),
        }),
        ssh: Some(SshConfig {
            user: ssh_user.clone(),
            public_key: Some(authorized_key.trim().to_string()),
            private_key_path: args.ssh_key.clone(),
            private_key_pem: None,
        }),
    };

    let hv = RouterHypervisor::new(None, None);
    let handle = hv.prepare(&spec).await.into_diagnostic()?;

    println!("VM '{name}' created (id {})", handle.id);

    // Tap-networked VMs are the ones `VmLifecycle` (driven by `vmd`) can
    // manage, since it assumes a tap device; register a descriptor so the
    // daemon-backed subcommands (`shutdown`/`ssh-hostname`/`wait-ssh`) work
    // for this VM too, alongside the coarse `RouterHypervisor` used here.
    if let NetworkConfig::Tap { device, mac_addr } = &spec.network {
        let descriptor = vm_manager::VmDescriptor {
            vm_name: name.clone(),
            image_path: spec.image_path.clone(),
            cloud_init_path: handle.seed_iso_path.clone(),
            tap_device_name: device.clone(),
            mac_addr: mac_addr.clone(),
            ssh_username: ssh_user.clone(),
        };
        vm_manager::DescriptorStore::default()
            .save(&descriptor)
            .await
            .into_diagnostic()?;
    }

    let should_start = args.start;
    store.insert(name.clone(), handle.clone());
    state::save_store(&store).await?;

    if should_start {
        hv.start(&handle).await.into_diagnostic()?;
        println!("VM '{name}' starting...");

        if let Some(def) = vmdef.filter(|d| !d.provision.is_empty()) {
            let (ip, port) = match handle.network {
                NetworkConfig::User => {
                    ("127.0.0.1".to_string(), handle.ssh_host_port.unwrap_or(22))
                }
                _ => (wait_for_ip(&hv, &handle).await?, 22),
            };
            let key_path = args
                .ssh_key
                .clone()
                .unwrap_or_else(|| handle.work_dir.join(super::GENERATED_KEY_FILE));
            let ssh_config = SshConfig {
                user: ssh_user,
                public_key: None,
                private_key_path: Some(key_path),
                private_key_pem: None,
            };
            let sess =
                vm_manager::ssh::connect_with_retry(&ip, port, &ssh_config, Duration::from_secs(120))
                    .await
                    .into_diagnostic()?;
            let provision_steps = def.provision.clone();
            let provision_base_dir = base_dir.clone();
            let provision_name = name.clone();
            let provision_work_dir = handle.work_dir.clone();
            tokio::task::spawn_blocking(move || {
                vm_manager::provision::run_provisions(
                    &sess,
                    &provision_steps,
                    &provision_base_dir,
                    &provision_name,
                    Some(&provision_work_dir),
                )
            })
            .await
            .into_diagnostic()?
            .into_diagnostic()?;
            println!("VM '{name}' provisioned");
        }
    }

    Ok(())
}

async fn wait_for_ip(hv: &RouterHypervisor, handle: &vm_manager::VmHandle) -> Result<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        match hv.guest_ip(handle).await {
            Ok(ip) => return Ok(ip),
            Err(e) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(e).into_diagnostic();
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_memory_in_gigabytes() {
        assert_eq!(parse_size_mb("2G").unwrap(), 2048);
        assert_eq!(parse_size_mb("2g").unwrap(), 2048);
    }

    #[test]
    fn parses_memory_in_megabytes() {
        assert_eq!(parse_size_mb("512M").unwrap(), 512);
        assert_eq!(parse_size_mb("512").unwrap(), 512);
    }

    #[test]
    fn rejects_kilobyte_granularity_below_a_megabyte() {
        // "500K" rounds down to 0 MB rather than erroring; callers sizing
        // memory in kilobytes are almost certainly confused, but it's not
        // this parser's job to guess.
        assert_eq!(parse_size_mb("500K").unwrap(), 0);
    }

    #[test]
    fn rejects_garbage_size_strings() {
        assert!(parse_size_mb("big").is_err());
        assert!(parse_size_mb("").is_err());
    }

    #[test]
    fn parses_disk_in_gigabytes() {
        assert_eq!(parse_size_gb("10G").unwrap(), 10);
        assert_eq!(parse_size_gb("10").unwrap(), 10);
    }

    #[test]
    fn rounds_disk_megabytes_down_to_whole_gigabytes() {
        assert_eq!(parse_size_gb("2048M").unwrap(), 2);
        assert_eq!(parse_size_gb("1500M").unwrap(), 1);
    }

    #[test]
    fn rejects_garbage_disk_size_strings() {
        assert!(parse_size_gb("huge").is_err());
    }
}
