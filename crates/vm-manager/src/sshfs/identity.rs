//! `IdentityProbe`, the ordered remote capability probe that runs
//! before a [`super::mount::SshfsMount`] is established.

use std::collections::BTreeMap;

use crate::error::{Result, VmError};
use crate::ssh::SshChannelExec;

/// Remote identity + tooling info collected by [`IdentityProbe::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityInfo {
    /// Environment variables collected from `multipass-sshfs.env` (notably
    /// `LD_LIBRARY_PATH`, `SNAP`), prefixed onto every later command.
    pub env: BTreeMap<String, String>,
    pub login: String,
    pub group: String,
    pub uid: u32,
    pub gid: u32,
    /// `(major, minor, patch)` parsed from `sshfs -V`'s `FUSE library
    /// version:` line. `patch` is optional — some builds report only
    /// `major.minor`.
    pub fuse_version: (u32, u32, Option<u32>),
}

fn env_prefix(env: &BTreeMap<String, String>) -> String {
    if env.is_empty() {
        return String::new();
    }
    let assignments = env
        .iter()
        .map(|(k, v)| format!("{k}={}", shell_quote(v)))
        .collect::<Vec<_>>()
        .join(" ");
    format!("env {assignments} ")
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn parse_env_lines(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Parses `FUSE library version: <major>.<minor>[.<patch>]` out of `sshfs
/// -V`'s stdout.
fn parse_fuse_version(stdout: &str) -> Option<(u32, u32, Option<u32>)> {
    let line = stdout
        .lines()
        .find(|l| l.contains("FUSE library version:"))?;
    let version = line.split("FUSE library version:").nth(1)?.trim();
    let mut parts = version.split('.');
    let major: u32 = parts.next()?.trim().parse().ok()?;
    let minor: u32 = parts.next()?.trim().parse().ok()?;
    let patch = parts.next().and_then(|p| p.trim().parse().ok());
    Some((major, minor, patch))
}

pub struct IdentityProbe;

impl IdentityProbe {
    /// Run the eight ordered remote commands, returning the
    /// collected [`IdentityInfo`]. `target` is the directory the mount will
    /// eventually be served at (created and chowned to the remote user).
    pub async fn run(ssh: &SshChannelExec, target: &str) -> Result<IdentityInfo> {
        // Step 1: locate sshfs's env helper (or fall back to a bare `sshfs`
        // check). Either both are missing -> SshfsMissing.
        let (env_code, env_stdout, _env_stderr) = ssh.exec("sudo multipass-sshfs.env").await?;
        let env = if env_code == 0 {
            parse_env_lines(&env_stdout)
        } else {
            let (which_code, _, _) = ssh.exec("which sshfs").await?;
            if which_code != 0 {
                return Err(VmError::SshfsMissing);
            }
            BTreeMap::new()
        };
        let prefix = env_prefix(&env);

        // Step 2: mkdir -p <target>
        let mkdir_cmd = format!("{prefix}mkdir -p {target}");
        let (code, _, stderr) = ssh.exec(&mkdir_cmd).await?;
        if code != 0 {
            return Err(VmError::RemoteCommandFailed {
                command: mkdir_cmd,
                exit_code: code,
                stderr,
            });
        }

        // Step 3: id -nu -> login
        let login = run_and_trim(ssh, &prefix, "id -nu").await?;

        // Step 4: id -ng -> group
        let group = run_and_trim(ssh, &prefix, "id -ng").await?;

        // Step 5: chown <user>:<group> <target>
        let chown_cmd = format!("{prefix}chown {login}:{group} {target}");
        let (code, _, stderr) = ssh.exec(&chown_cmd).await?;
        if code != 0 {
            return Err(VmError::RemoteCommandFailed {
                command: chown_cmd,
                exit_code: code,
                stderr,
            });
        }

        // Step 6: id -u -> numeric uid
        let uid_str = run_and_trim(ssh, &prefix, "id -u").await?;
        let uid: u32 = uid_str.parse().map_err(|_| VmError::InvalidRemoteValue {
            what: "id -u".to_string(),
            value: uid_str.clone(),
        })?;

        // Step 7: id -g -> numeric gid
        let gid_str = run_and_trim(ssh, &prefix, "id -g").await?;
        let gid: u32 = gid_str.parse().map_err(|_| VmError::InvalidRemoteValue {
            what: "id -g".to_string(),
            value: gid_str.clone(),
        })?;

        // Step 8: sshfs -V -> FUSE library version line
        let version_cmd = format!("{prefix}sshfs -V");
        let (code, stdout, stderr) = ssh.exec(&version_cmd).await?;
        if code != 0 {
            return Err(VmError::RemoteCommandFailed {
                command: version_cmd,
                exit_code: code,
                stderr,
            });
        }
        let fuse_version = parse_fuse_version(&stdout).ok_or_else(|| VmError::InvalidFuseVersion {
            raw: stdout.trim().to_string(),
        })?;

        Ok(IdentityInfo {
            env,
            login,
            group,
            uid,
            gid,
            fuse_version,
        })
    }
}

async fn run_and_trim(ssh: &SshChannelExec, prefix: &str, command: &str) -> Result<String> {
    let full = format!("{prefix}{command}");
    let (code, stdout, stderr) = ssh.exec(&full).await?;
    if code != 0 {
        return Err(VmError::RemoteCommandFailed {
            command: full,
            exit_code: code,
            stderr,
        });
    }
    Ok(stdout.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_env_lines_into_a_map() {
        let env = parse_env_lines("LD_LIBRARY_PATH=/snap/multipass-sshfs/x/lib\nSNAP=/snap/multipass-sshfs/x\n");
        assert_eq!(
            env.get("LD_LIBRARY_PATH").map(String::as_str),
            Some("/snap/multipass-sshfs/x/lib")
        );
        assert_eq!(env.get("SNAP").map(String::as_str), Some("/snap/multipass-sshfs/x"));
    }

    #[test]
    fn parses_fuse_version_with_patch() {
        let out = "FUSE library version: 2.9.9\nusing FUSE kernel interface version 7.19\n";
        assert_eq!(parse_fuse_version(out), Some((2, 9, Some(9))));
    }

    #[test]
    fn parses_fuse_version_without_patch() {
        let out = "FUSE library version: 3.10\n";
        assert_eq!(parse_fuse_version(out), Some((3, 10, None)));
    }

    #[test]
    fn rejects_an_invalid_fuse_version_line() {
        assert_eq!(parse_fuse_version("FUSE library version: fu.man.chu\n"), None);
    }

    #[test]
    fn env_prefix_is_empty_for_an_empty_map() {
        assert_eq!(env_prefix(&BTreeMap::new()), "");
    }

    #[test]
    fn env_prefix_quotes_values() {
        let mut env = BTreeMap::new();
        env.insert("SNAP".to_string(), "/snap/x".to_string());
        assert_eq!(env_prefix(&env), "env SNAP='/snap/x' ");
    }
}
