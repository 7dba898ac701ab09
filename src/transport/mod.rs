//! The seam between command execution and the mechanism that starts processes.
//!
//! A [`Transport`] starts one command per call and hands back its standard streams plus a way to
//! retrieve the exit status. The process handle, the interactive shell and the process managers are
//! written against this trait, so the same machinery drives local child processes and remote SSH
//! channels.

pub mod local;

use crate::error::Result;
use std::io::{Read, Write};
use std::time::Duration;

pub use local::LocalTransport;

/// Identifies one of the output streams of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
    Stdout,
    Stderr,
}

impl StreamId {
    pub const ALL: [StreamId; 2] = [StreamId::Stdout, StreamId::Stderr];

    pub fn index(self) -> usize {
        match self {
            StreamId::Stdout => 0,
            StreamId::Stderr => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StreamId::Stdout => "stdout",
            StreamId::Stderr => "stderr",
        }
    }
}

/// Retrieves the exit status of a started command.
pub trait ExitWaiter: Send {
    /// Waits for the exit status for at most `timeout` (`None` means no limit).
    ///
    /// Returns `Ok(None)` if the status did not become available in time.
    fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<i32>>;

    /// Returns the exit status if the command has already finished.
    fn poll(&mut self) -> Result<Option<i32>>;

    /// Process ID of the started command, if the transport knows it.
    fn pid(&self) -> Option<u32> {
        None
    }

    /// Releases the underlying channel. Best effort, never fails.
    fn close(&mut self) {}
}

/// Standard streams and exit status access of one started command.
pub struct Channel {
    pub stdin: Box<dyn Write + Send>,
    pub stdout: Box<dyn Read + Send>,
    pub stderr: Box<dyn Read + Send>,
    pub waiter: Box<dyn ExitWaiter>,
}

/// Something that can start commands.
pub trait Transport: Send + Sync + 'static {
    /// Starts `command`. When `shell` is false, the transport must not involve a shell if it has a
    /// choice (remote transports always run commands via the login shell of the user).
    fn exec(&self, command: &str, shell: bool) -> Result<Channel>;
}
