//! The persistent shell which runs commands of the fast path.

use crate::error::{Error, Result};
use crate::process::ChannelIo;
use crate::transport::Transport;
use log::debug;

/// Command starting the interactive shell: a plain `sh` reading commands from stdin.
const SHELL_COMMAND: &str = "sh -s";

pub(crate) struct InteractiveShell {
    pub(crate) io: ChannelIo,
}

impl InteractiveShell {
    /// Starts a new shell via `transport`.
    pub(crate) fn start<T: Transport>(transport: &T) -> Result<Self> {
        let channel = transport.exec(SHELL_COMMAND, false)?;
        let shell = Self {
            io: ChannelIo::start(channel)?,
        };
        debug!("started the interactive shell (PID {:?})", shell.pid());
        Ok(shell)
    }

    /// Process ID of the shell, if the transport knows it.
    pub(crate) fn pid(&self) -> Option<u32> {
        self.io.waiter.pid()
    }

    /// Submits shell input.
    pub(crate) fn send(&mut self, text: &str) -> Result<()> {
        self.io.send(text.as_bytes()).map_err(|e| {
            Error::Transport(format!(
                "failed to send a command to the interactive shell: {}",
                e
            ))
        })
    }

    /// Stops the shell. Best effort, errors are ignored.
    pub(crate) fn teardown(mut self) {
        let _ = self.io.send(b"exit\n");
        self.io.shutdown();
    }
}
