//! Process managers: the entry point for running commands and accessing files on a host.
//!
//! [`LocalProcessManager`] works on the local host, [`SshProcessManager`] on a remote host over
//! SSH. Use [`get_pman`] to get the right one for an optional host.

pub mod local;

pub use local::LocalProcessManager;

use crate::command::{quote, Command, ProcResult, RunOptions};
use crate::config::{DefaultSettings, HostConfig};
use crate::error::{cmd_failed_msg, Error, Result};
use crate::file::FileStream;
use crate::process::Process;
use crate::remote::manager::SshProcessManager;
use std::path::{Path, PathBuf};

/// Runs commands and accesses files on one host.
pub trait ProcessManager: Send + Sync {
    /// Name of the host, `None` for the local host.
    fn hostname(&self) -> Option<&str>;

    /// " on host '<name>'" for remote hosts, an empty string for the local host.
    fn hostmsg(&self) -> String {
        self.hostname()
            .map(|h| format!(" on host '{}'", h))
            .unwrap_or_default()
    }

    fn is_remote(&self) -> bool {
        self.hostname().is_some()
    }

    /// Starts `cmd` and returns its handle without waiting for it.
    ///
    /// The interactive shell is only used if the command asks for it with
    /// [`Command::fast_path`].
    fn run_async(&self, cmd: &Command) -> Result<Process>;

    /// Runs `cmd` and waits for it. A non-zero exit status is not an error.
    fn run(&self, cmd: &Command, opts: &RunOptions) -> Result<ProcResult>;

    /// Runs `cmd` and waits for it, failing unless it exits with status 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Command`] describing the command, its output and the exit status if the
    /// status is not 0.
    fn run_verify(&self, cmd: &Command, opts: &RunOptions) -> Result<ProcResult> {
        let result = self.run(cmd, opts)?;
        if result.exit_code != 0 {
            return Err(Error::Command(cmd_failed_msg(
                cmd.text(),
                &result.stdout,
                &result.stderr,
                Some(result.exit_code),
                self.hostname(),
                None,
            )));
        }
        Ok(result)
    }

    /// Opens a file. `mode` is an `fopen()`-style string, see [`crate::file::OpenMode`].
    fn open(&self, path: &Path, mode: &str) -> Result<FileStream>;

    /// Copies `src` on this host to local `dst`.
    fn get(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Copies local `src` to `dst` on this host.
    fn put(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Synchronizes `src` to `dst` with `rsync`. The `remote_src` and `remote_dst` flags tell
    /// whether the paths are on this host rather than on the local host.
    fn rsync(&self, src: &str, dst: &str, opts: &str, remote_src: bool, remote_dst: bool)
        -> Result<()>;

    /// Looks `tool` up in `PATH`. Returns `None` if it is not there.
    fn find_tool(&self, tool: &str) -> Result<Option<PathBuf>> {
        if tool.is_empty() {
            return Err(Error::Command("cannot look up a tool with an empty name".to_string()));
        }

        let script = format!("command -v {}", quote(tool)?);
        let cmd = Command::new(format!("sh -c {}", quote(&script)?));
        let result = self.run(&cmd, &RunOptions::default())?;
        if result.exit_code != 0 {
            return Ok(None);
        }

        // Aliases, functions and builtins are reported as plain names.
        let path = result
            .stdout_lines()
            .map(str::trim)
            .find(|line| line.starts_with('/'))
            .map(PathBuf::from);
        Ok(path)
    }

    /// Returns the full path of `tool`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `tool` is not in `PATH`.
    fn which(&self, tool: &str) -> Result<PathBuf> {
        self.find_tool(tool)?.ok_or_else(|| {
            Error::NotFound(format!("tool '{}' was not found{}", tool, self.hostmsg()))
        })
    }

    /// Stops the interactive shell and releases the connection, if any.
    fn close(&self);
}

/// Returns a process manager for `host`, or for the local host if `host` is `None`.
pub fn get_pman(host: Option<&HostConfig>) -> Result<Box<dyn ProcessManager>> {
    get_pman_with(host, &DefaultSettings::default())
}

/// Like [`get_pman`], with the execution settings given explicitly.
pub fn get_pman_with(
    host: Option<&HostConfig>,
    settings: &DefaultSettings,
) -> Result<Box<dyn ProcessManager>> {
    match host {
        Some(host) => Ok(Box::new(SshProcessManager::connect(host, settings)?)),
        None => Ok(Box::new(LocalProcessManager::new())),
    }
}
