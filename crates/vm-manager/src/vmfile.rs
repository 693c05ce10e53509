//! `VMFile.kdl` — the declarative manifest `vmctl create`/`vmctl ssh` read
//! to avoid having to repeat `--image`/`--user`/`--cpus` on every
//! invocation. One file may define several VMs:
//!
//! ```kdl
//! vm "web" {
//!     image "jammy"
//!     cpus 2
//!     memory "2G"
//!     disk "10G"
//!     ssh user="ubuntu"
//!     provision {
//!         shell inline="echo provisioning"
//!         shell script="setup.sh"
//!         file source="app.tar.gz" destination="/tmp/app.tar.gz"
//!     }
//! }
//! ```
//!
//! Kept deliberately small: this is CLI ergonomics, not a core lifecycle
//! feature, so it only parses what `vmctl`'s commands actually consult.

use std::path::{Path, PathBuf};

use kdl::{KdlDocument, KdlNode};

use crate::error::{Result, VmError};

pub const VMFILE_NAME: &str = "VMFile.kdl";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshBlock {
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellProvision {
    pub inline: Option<String>,
    pub script: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProvision {
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionDef {
    Shell(ShellProvision),
    File(FileProvision),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmDef {
    pub name: String,
    pub image: Option<String>,
    pub cpus: Option<u32>,
    pub memory: Option<String>,
    pub disk: Option<String>,
    pub ssh: Option<SshBlock>,
    pub provision: Vec<ProvisionDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VMFile {
    pub vms: Vec<VmDef>,
}

/// Resolve a path written in a `VMFile.kdl` relative to the file's own
/// directory; absolute paths pass through unchanged.
pub fn resolve_path(raw: &str, base_dir: &Path) -> PathBuf {
    let raw_path = Path::new(raw);
    if raw_path.is_absolute() {
        raw_path.to_path_buf()
    } else {
        base_dir.join(raw_path)
    }
}

/// Locate a `VMFile.kdl`: an explicit `--file` wins outright; otherwise walk
/// upward from the current directory, the way `Dockerfile`/`Cargo.toml`
/// discovery works in the tools this one is modeled on.
pub fn discover(explicit_file: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit_file {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(VmError::other(format!(
                "VMFile not found at {}",
                path.display()
            )))
        };
    }

    let mut dir = std::env::current_dir().map_err(VmError::Io)?;
    loop {
        let candidate = dir.join(VMFILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if !dir.pop() {
            return Err(VmError::other(format!(
                "no {VMFILE_NAME} found in the current directory or any parent"
            )));
        }
    }
}

fn entry_str(node: &KdlNode, idx: usize) -> Option<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .nth(idx)
        .and_then(|e| e.value().as_string())
        .map(str::to_string)
}

fn entry_i64(node: &KdlNode, idx: usize) -> Option<i64> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .nth(idx)
        .and_then(|e| e.value().as_integer())
        .map(|v| v as i64)
}

fn prop_str(node: &KdlNode, key: &str) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_some_and(|n| n.value() == key))
        .and_then(|e| e.value().as_string())
        .map(str::to_string)
}

fn parse_provision_block(doc: &KdlDocument, path: &Path) -> Result<Vec<ProvisionDef>> {
    let mut steps = Vec::new();
    for node in doc.nodes() {
        let kind = node.name().value();
        match kind {
            "shell" => {
                let inline = prop_str(node, "inline");
                let script = prop_str(node, "script");
                if inline.is_none() && script.is_none() {
                    return Err(VmError::VmFileParse {
                        path: path.to_path_buf(),
                        detail: "`shell` provision needs an `inline=` or `script=` property"
                            .to_string(),
                    });
                }
                steps.push(ProvisionDef::Shell(ShellProvision { inline, script }));
            }
            "file" => {
                let source = prop_str(node, "source").ok_or_else(|| VmError::VmFileParse {
                    path: path.to_path_buf(),
                    detail: "`file` provision needs a `source=` property".to_string(),
                })?;
                let destination =
                    prop_str(node, "destination").ok_or_else(|| VmError::VmFileParse {
                        path: path.to_path_buf(),
                        detail: "`file` provision needs a `destination=` property".to_string(),
                    })?;
                steps.push(ProvisionDef::File(FileProvision { source, destination }));
            }
            other => {
                return Err(VmError::VmFileParse {
                    path: path.to_path_buf(),
                    detail: format!("unknown provision step type `{other}`"),
                });
            }
        }
    }
    Ok(steps)
}

fn parse_vm_node(node: &KdlNode, path: &Path) -> Result<VmDef> {
    let name = entry_str(node, 0).ok_or_else(|| VmError::VmFileParse {
        path: path.to_path_buf(),
        detail: "`vm` node requires a name argument, e.g. `vm \"web\"`".to_string(),
    })?;

    let mut def = VmDef {
        name,
        ..Default::default()
    };

    let Some(children) = node.children() else {
        return Ok(def);
    };

    for child in children.nodes() {
        match child.name().value() {
            "image" => {
                def.image = entry_str(child, 0);
            }
            "cpus" => {
                def.cpus = entry_i64(child, 0).map(|v| v as u32);
            }
            "memory" => {
                def.memory = entry_str(child, 0);
            }
            "disk" => {
                def.disk = entry_str(child, 0);
            }
            "ssh" => {
                let user = prop_str(child, "user").ok_or_else(|| VmError::VmFileParse {
                    path: path.to_path_buf(),
                    detail: "`ssh` block requires a `user=` property".to_string(),
                })?;
                def.ssh = Some(SshBlock { user });
            }
            "provision" => {
                let block = child.children().ok_or_else(|| VmError::VmFileParse {
                    path: path.to_path_buf(),
                    detail: "`provision` node requires a `{ ... }` block".to_string(),
                })?;
                def.provision = parse_provision_block(block, path)?;
            }
            other => {
                return Err(VmError::VmFileParse {
                    path: path.to_path_buf(),
                    detail: format!("unknown field `{other}` in `vm {}`", def.name),
                });
            }
        }
    }

    Ok(def)
}

/// Parse a `VMFile.kdl` from disk.
pub fn parse(path: &Path) -> Result<VMFile> {
    let text = std::fs::read_to_string(path).map_err(VmError::Io)?;
    let doc: KdlDocument = text.parse().map_err(|e| VmError::VmFileParse {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    let mut vms = Vec::new();
    for node in doc.nodes() {
        if node.name().value() == "vm" {
            vms.push(parse_vm_node(node, path)?);
        }
    }

    if vms.is_empty() {
        return Err(VmError::VmFileParse {
            path: path.to_path_buf(),
            detail: "no `vm` nodes found".to_string(),
        });
    }

    Ok(VMFile { vms })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_vm_with_ssh_and_provision() {
        let kdl = r#"
            vm "web" {
                image "jammy"
                cpus 2
                memory "2G"
                disk "10G"
                ssh user="ubuntu"
                provision {
                    shell inline="echo hi"
                    file source="app.tar" destination="/tmp/app.tar"
                }
            }
        "#;
        let doc: KdlDocument = kdl.parse().unwrap();
        let node = doc.nodes().iter().find(|n| n.name().value() == "vm").unwrap();
        let def = parse_vm_node(node, Path::new("VMFile.kdl")).unwrap();

        assert_eq!(def.name, "web");
        assert_eq!(def.image.as_deref(), Some("jammy"));
        assert_eq!(def.cpus, Some(2));
        assert_eq!(def.memory.as_deref(), Some("2G"));
        assert_eq!(def.disk.as_deref(), Some("10G"));
        assert_eq!(def.ssh, Some(SshBlock { user: "ubuntu".to_string() }));
        assert_eq!(
            def.provision,
            vec![
                ProvisionDef::Shell(ShellProvision {
                    inline: Some("echo hi".to_string()),
                    script: None
                }),
                ProvisionDef::File(FileProvision {
                    source: "app.tar".to_string(),
                    destination: "/tmp/app.tar".to_string()
                }),
            ]
        );
    }

    #[test]
    fn vm_without_children_parses_with_defaults() {
        let doc: KdlDocument = r#"vm "bare""#.parse().unwrap();
        let node = doc.nodes().first().unwrap();
        let def = parse_vm_node(node, Path::new("VMFile.kdl")).unwrap();
        assert_eq!(def.name, "bare");
        assert!(def.ssh.is_none());
        assert!(def.provision.is_empty());
    }

    #[test]
    fn shell_provision_without_inline_or_script_is_rejected() {
        let doc: KdlDocument = r#"
            vm "web" {
                provision {
                    shell
                }
            }
        "#
        .parse()
        .unwrap();
        let node = doc.nodes().first().unwrap();
        assert!(parse_vm_node(node, Path::new("VMFile.kdl")).is_err());
    }

    #[test]
    fn resolve_path_joins_relative_paths_to_base_dir() {
        let base = Path::new("/home/user/project");
        assert_eq!(
            resolve_path("setup.sh", base),
            PathBuf::from("/home/user/project/setup.sh")
        );
        assert_eq!(
            resolve_path("/abs/setup.sh", base),
            PathBuf::from("/abs/setup.sh")
        );
    }

    #[test]
    fn discover_returns_error_for_missing_explicit_file() {
        let result = discover(Some(Path::new("/no/such/VMFile.kdl")));
        assert!(result.is_err());
    }
}
