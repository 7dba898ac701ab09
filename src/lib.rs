//! Run commands and access files on the local host or on a remote host over SSH.
//!
//! Commands on a remote host run either in an SSH channel of their own, or in a persistent
//! interactive shell on the host, which is much faster for short commands. See [`executor`] for
//! how the two are chosen and [`manager`] for the entry point.
//!
//! ```no_run
//! use hostexec::{get_pman, Command, ProcessManager, RunOptions};
//!
//! let pman = get_pman(None)?;
//! let result = pman.run_verify(&Command::new("uname -r"), &RunOptions::default())?;
//! println!("kernel: {}", result.stdout.trim());
//! # Ok::<(), hostexec::Error>(())
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod file;
pub mod manager;
pub mod process;
pub mod remote;
pub mod transport;

pub use command::{Command, ProcResult, RunOptions};
pub use error::{Error, HostExecError, Result};
pub use file::{FileStream, OpenMode};
pub use manager::{get_pman, get_pman_with, LocalProcessManager, ProcessManager};
pub use process::{OutputSink, ProcOutput, Process, WaitOptions};
pub use remote::SshProcessManager;
