//! Subcommands backed by `vmd`'s control socket instead of a per-invocation
//! `RouterHypervisor` — the fine-grained `VmLifecycle` state machine vs. the
//! coarse `Hypervisor` façade `create`/`start`/`stop`/etc. use.
//! A VM only has a lifecycle here once `vmd` can find a [`VmDescriptor`] for
//! it, which tap-networked `create` runs register in the `DescriptorStore`.

use clap::Args;
use miette::{IntoDiagnostic, Result};
use vm_manager::{ControlClient, ControlOp, ControlRequest};

#[derive(Args)]
pub struct ShutdownArgs {
    /// VM name
    name: String,
}

#[derive(Args)]
pub struct SshHostnameArgs {
    /// VM name
    name: String,
}

#[derive(Args)]
pub struct WaitSshArgs {
    /// VM name
    name: String,

    /// Seconds to wait before giving up
    #[arg(long)]
    timeout: Option<u64>,
}

pub async fn run_shutdown(args: ShutdownArgs) -> Result<()> {
    let mut client = ControlClient::connect().await.into_diagnostic()?;
    client
        .call_ok(ControlRequest::new(args.name.clone(), ControlOp::Shutdown))
        .await
        .into_diagnostic()?;
    println!("VM '{}' shutdown requested", args.name);
    Ok(())
}

pub async fn run_ssh_hostname(args: SshHostnameArgs) -> Result<()> {
    let mut client = ControlClient::connect().await.into_diagnostic()?;
    let data = client
        .call_ok(ControlRequest::new(args.name.clone(), ControlOp::SshHostname))
        .await
        .into_diagnostic()?;
    let ip = data
        .get("ip")
        .and_then(|v| v.as_str())
        .ok_or_else(|| miette::miette!("vmd returned no 'ip' field"))?;
    println!("{ip}");
    Ok(())
}

pub async fn run_wait_ssh(args: WaitSshArgs) -> Result<()> {
    let mut client = ControlClient::connect().await.into_diagnostic()?;
    client
        .call_ok(ControlRequest::new(
            args.name.clone(),
            ControlOp::WaitSshUp {
                timeout_secs: args.timeout,
            },
        ))
        .await
        .into_diagnostic()?;
    println!("VM '{}' is reachable over SSH", args.name);
    Ok(())
}
