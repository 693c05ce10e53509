pub mod console;
pub mod create;
pub mod daemon;
pub mod destroy;
pub mod image;
pub mod list;
pub mod log;
pub mod mount;
pub mod ssh;
pub mod start;
pub mod state;
pub mod status;
pub mod stop;

use clap::{Parser, Subcommand};
use miette::Result;

/// Filename of the SSH private key `vmctl create` generates for a VM when
/// the caller doesn't supply `--ssh-key`, stored in the VM's work directory.
pub const GENERATED_KEY_FILE: &str = "id_ed25519";

#[derive(Parser)]
#[command(name = "vmctl", about = "Manage virtual machines", version)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new VM (and optionally start it)
    Create(create::CreateArgs),
    /// Start an existing VM
    Start(start::StartArgs),
    /// Stop a running VM
    Stop(stop::StopArgs),
    /// Destroy a VM and clean up all resources
    Destroy(destroy::DestroyArgs),
    /// List all VMs
    List(list::ListArgs),
    /// Show VM status
    Status(status::StatusArgs),
    /// Attach to a VM's serial console
    Console(console::ConsoleArgs),
    /// SSH into a VM
    Ssh(ssh::SshArgs),
    /// Suspend a running VM (pause vCPUs)
    Suspend(start::SuspendArgs),
    /// Resume a suspended VM
    Resume(start::ResumeArgs),
    /// Manage VM images
    Image(image::ImageCommand),
    /// Mount a local directory into a VM over SSHFS
    Mount(mount::MountArgs),
    /// Show console/provision logs for a VM
    Log(log::LogArgs),
    /// Gracefully shut down a VM via vmd's lifecycle state machine
    Shutdown(daemon::ShutdownArgs),
    /// Print a VM's SSH-reachable hostname/IP via vmd
    SshHostname(daemon::SshHostnameArgs),
    /// Block until a VM's SSH server is reachable, via vmd
    WaitSsh(daemon::WaitSshArgs),
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Create(args) => create::run(args).await,
            Command::Start(args) => start::run_start(args).await,
            Command::Stop(args) => stop::run(args).await,
            Command::Destroy(args) => destroy::run(args).await,
            Command::List(args) => list::run(args).await,
            Command::Status(args) => status::run(args).await,
            Command::Console(args) => console::run(args).await,
            Command::Ssh(args) => ssh::run(args).await,
            Command::Suspend(args) => start::run_suspend(args).await,
            Command::Resume(args) => start::run_resume(args).await,
            Command::Image(args) => image::run(args).await,
            Command::Mount(args) => mount::run(args).await,
            Command::Log(args) => log::run(args).await,
            Command::Shutdown(args) => daemon::run_shutdown(args).await,
            Command::SshHostname(args) => daemon::run_ssh_hostname(args).await,
            Command::WaitSsh(args) => daemon::run_wait_ssh(args).await,
        }
    }
}
