//! Running commands on a host.
//!
//! The [`Executor`] runs every command either in a dedicated channel of its own, or in the
//! interactive shell, a persistent `sh` which saves the cost of setting up a new channel per
//! command. Completion of a command in the interactive shell is detected with a random marker, see
//! [`crate::process::marker`].
//!
//! The interactive shell runs one command at a time. If it is busy, or its guard cannot be acquired
//! quickly, the command runs in a dedicated channel instead. If the shell breaks, it is torn down
//! and the command is retried once in a dedicated channel.

pub mod guard;
pub(crate) mod shell;

#[cfg(test)]
mod tests;

use crate::command::{quote, Command, ProcResult, RunOptions};
use crate::error::{Error, Result};
use crate::process::marker::Marker;
use crate::process::{ChannelIo, Process, WaitOptions};
use crate::transport::Transport;
use guard::{ShellLease, SingleFlightGuard, Unavailable, DEFAULT_LOCK_TIMEOUT};
use log::{debug, warn};
use shell::InteractiveShell;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Wraps `cmd` so that it first prints its process ID on a line of its own.
///
/// The command is started with `exec`, so the printed ID is the ID of the command itself, not of
/// a shell running it. If `cwd` is given, the command runs in that directory.
pub fn format_cmd_for_pid(cmd: &str, cwd: Option<&Path>) -> Result<String> {
    let mut wrapped = String::from("printf \"%s\\n\" \"$$\"; ");
    if let Some(cwd) = cwd {
        wrapped.push_str(&format!("cd {} && ", quote(&cwd.to_string_lossy())?));
    }
    wrapped.push_str("exec ");
    wrapped.push_str(cmd);
    Ok(wrapped)
}

/// Runs commands on one host via a transport.
pub struct Executor<T: Transport> {
    transport: Arc<T>,
    hostname: Option<String>,
    guard: Arc<SingleFlightGuard>,
    fast_path: bool,
}

impl<T: Transport> Executor<T> {
    /// Creates an executor. `hostname` is only used in messages, `None` stands for the local host.
    pub fn new(transport: T, hostname: Option<String>) -> Self {
        Self {
            transport: Arc::new(transport),
            hostname,
            guard: Arc::new(SingleFlightGuard::new(DEFAULT_LOCK_TIMEOUT)),
            fast_path: true,
        }
    }

    /// Builder method to bound waiting for the interactive shell guard.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.guard = Arc::new(SingleFlightGuard::new(timeout));
        self
    }

    /// Builder method to enable or disable the interactive shell altogether.
    pub fn with_fast_path(mut self, enabled: bool) -> Self {
        self.fast_path = enabled;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    fn hostmsg(&self) -> String {
        self.hostname
            .as_deref()
            .map(|h| format!(" on host '{}'", h))
            .unwrap_or_default()
    }

    /// Runs `cmd` in a new channel.
    pub fn run_in_new_session(&self, cmd: &Command) -> Result<Process> {
        cmd.validate()?;
        let real_cmd = if cmd.uses_shell() {
            format_cmd_for_pid(cmd.text(), cmd.working_dir())?
        } else {
            cmd.text().to_string()
        };

        debug!("running in a new session{}: {}", self.hostmsg(), real_cmd);
        let channel = self.transport.exec(&real_cmd, cmd.uses_shell())?;
        let io = ChannelIo::start(channel)?;
        Process::new_dedicated(
            io,
            cmd.text(),
            real_cmd,
            cmd.uses_shell(),
            self.hostname.clone(),
        )
    }

    /// Runs `cmd` in the interactive shell held by `lease`, starting the shell if needed.
    fn run_in_intsh(&self, cmd: &Command, mut lease: ShellLease) -> Result<Process> {
        if !lease.has_shell() {
            lease.install(InteractiveShell::start(self.transport.as_ref())?);
        }

        let marker = Marker::generate();
        let inner = format_cmd_for_pid(cmd.text(), cmd.working_dir())?;
        // The command must not read the shell's own input.
        let real_cmd = format!(
            "sh -c {} < /dev/null\n{}",
            quote(&inner)?,
            marker.trailer_command()
        );

        debug!("running in the interactive shell{}: {}", self.hostmsg(), cmd.text());
        lease.shell_mut()?.send(&real_cmd)?;
        Process::new_interactive(
            lease,
            marker,
            cmd.text(),
            real_cmd,
            self.hostname.clone(),
        )
    }

    /// Starts `cmd` and returns its handle without waiting for it.
    ///
    /// The interactive shell is used if the command allows the shell and prefers the fast path
    /// (`default_fast_path` applies when the command has no preference). Otherwise, or when the
    /// interactive shell is unavailable, the command runs in a new channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the command is invalid or cannot be started. Problems with the
    /// interactive shell only result in a fallback, except for [`Error::Protocol`].
    pub fn run_async(&self, cmd: &Command, default_fast_path: bool) -> Result<Process> {
        cmd.validate()?;
        if !self.fast_path || !cmd.uses_shell() || !cmd.wants_fast_path(default_fast_path) {
            return self.run_in_new_session(cmd);
        }

        match self.guard.acquire(cmd.text()) {
            Ok(lease) => match self.run_in_intsh(cmd, lease) {
                Ok(proc) => return Ok(proc),
                Err(err @ Error::Protocol(_)) => return Err(err),
                Err(err) => warn!(
                    "failed to run the following command in the interactive shell{}:\n  {}\n\
                     The error was: {}\nRunning it in a new session",
                    self.hostmsg(),
                    cmd.text(),
                    err
                ),
            },
            Err(Unavailable::Busy) => warn!(
                "interactive shell is busy, running the following command in a new session:\n  {}",
                cmd.text()
            ),
            Err(Unavailable::LockTimeout) => warn!(
                "interactive shell lock is not available, running the following command in a new \
                 session:\n  {}",
                cmd.text()
            ),
            Err(Unavailable::Closed) => {
                debug!("interactive shell is closed, running in a new session: {}", cmd.text())
            }
        }

        self.run_in_new_session(cmd)
    }

    fn finish(&self, proc: &mut Process, opts: &RunOptions) -> Result<ProcResult> {
        proc.set_combine_streams(opts.combine_streams);
        let wait_opts = WaitOptions {
            timeout: opts.timeout,
            capture_output: opts.capture_output,
            lines: [None, None],
            sinks: opts.sinks.clone(),
        };
        let output = proc.wait(&wait_opts)?;
        let mut stdout = output.stdout_text();
        let mut stderr = output.stderr_text();

        match output.exit_code {
            Some(exit_code) => Ok(ProcResult {
                stdout,
                stderr,
                exit_code,
            }),
            None => {
                let [stdout_rest, stderr_rest] = proc.take_partial();
                stdout.push_str(&stdout_rest);
                stderr.push_str(&stderr_rest);
                Err(Error::Timeout {
                    message: proc.cmd_failed_msg(&stdout, &stderr, None),
                    stdout,
                    stderr,
                })
            }
        }
    }

    /// Runs `cmd` and waits for it to finish.
    ///
    /// The interactive shell is used by default for commands that allow the shell. A non-zero exit
    /// status is not an error, see [`ProcResult::exit_code`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] with the output captured so far if the command did not finish in
    /// `opts.timeout`. The command is not killed in that case.
    pub fn run(&self, cmd: &Command, opts: &RunOptions) -> Result<ProcResult> {
        let mut proc = self.run_async(cmd, cmd.uses_shell())?;
        match self.finish(&mut proc, opts) {
            Err(err) if err.is_transport() && proc.is_interactive() => {
                warn!(
                    "the interactive shell{} failed while running the following command:\n  {}\n\
                     The error was: {}\nRunning it again in a new session",
                    self.hostmsg(),
                    cmd.text(),
                    err
                );
                drop(proc);
                let mut proc = self.run_in_new_session(cmd)?;
                self.finish(&mut proc, opts)
            }
            result => result,
        }
    }

    /// Stops the interactive shell. Commands still work afterwards, in new sessions.
    pub fn close(&self) {
        self.guard.close();
    }

    /// Process ID of the idle interactive shell.
    #[cfg(test)]
    pub(crate) fn shell_pid(&self) -> Option<u32> {
        let state = self.guard.lock()?;
        state.shell_pid()
    }

    #[cfg(test)]
    pub(crate) fn guard(&self) -> &Arc<SingleFlightGuard> {
        &self.guard
    }
}

impl<T: Transport> Drop for Executor<T> {
    fn drop(&mut self) {
        self.close();
    }
}
