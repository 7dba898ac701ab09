//! Remote hosts over SSH.
//!
//! Commands and SFTP run over one authenticated session per host, while `scp` and `rsync` run
//! locally and open connections of their own with the same settings.

pub mod manager;
pub mod retry;
pub mod session;
pub mod transfer;

pub use manager::SshProcessManager;
pub use retry::{diagnose_ssh_error, retry_with_backoff, RetryConfig};
pub use session::{ConnectParams, SshTransport};
pub use transfer::{ScpTransfer, SshOptions};
