//! The SSHFS mount bootstrap: remote capability probing plus the SFTP
//! bridge it unlocks.

pub mod identity;
pub mod mount;

pub use identity::{IdentityInfo, IdentityProbe};
pub use mount::{IdMap, SshfsMount};
