//! Command requests and results.

use crate::error::{Error, Result};
use crate::process::OutputSink;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Quotes `text` as a single word for `sh`.
pub(crate) fn quote(text: &str) -> Result<String> {
    shlex::try_quote(text)
        .map(|quoted| quoted.into_owned())
        .map_err(|e| Error::Command(format!("cannot quote '{}' for the shell: {}", text, e)))
}

/// A request to run a command on a host.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    text: String,
    cwd: Option<PathBuf>,
    shell: bool,
    fast_path: Option<bool>,
}

impl Command {
    /// Creates a request to run `text` via the shell.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cwd: None,
            shell: true,
            fast_path: None,
        }
    }

    /// Builder method to set the working directory. Requires shell usage.
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Builder method to allow or disallow using the shell.
    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    /// Builder method to express a preference for running in the interactive shell.
    pub fn fast_path(mut self, fast_path: bool) -> Self {
        self.fast_path = Some(fast_path);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn uses_shell(&self) -> bool {
        self.shell
    }

    /// Returns the fast path preference, or `default` if none was expressed.
    pub fn wants_fast_path(&self, default: bool) -> bool {
        self.fast_path.unwrap_or(default)
    }

    /// Checks the request for conflicting settings.
    pub fn validate(&self) -> Result<()> {
        if let Some(cwd) = &self.cwd {
            if !self.shell {
                return Err(Error::Command(format!(
                    "cannot set working directory to '{}' - using shell is disallowed",
                    cwd.display()
                )));
            }
        }
        if self.fast_path == Some(true) && !self.shell {
            return Err(Error::Command(
                "the interactive shell cannot be used when using shell is disallowed".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<&str> for Command {
    fn from(text: &str) -> Self {
        Command::new(text)
    }
}

impl From<String> for Command {
    fn from(text: String) -> Self {
        Command::new(text)
    }
}

/// Options for running a command to completion.
#[derive(Clone)]
pub struct RunOptions {
    /// How long to wait for the command. `None` means waiting without a limit.
    pub timeout: Option<Duration>,
    /// Whether to capture the output of the command.
    pub capture_output: bool,
    /// Whether to merge standard error into standard output.
    pub combine_streams: bool,
    /// Where to echo standard output and standard error while the command runs.
    pub sinks: [Option<OutputSink>; 2],
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            capture_output: true,
            combine_streams: false,
            sinks: [None, None],
        }
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("timeout", &self.timeout)
            .field("capture_output", &self.capture_output)
            .field("combine_streams", &self.combine_streams)
            .field("stdout_sink", &self.sinks[0].is_some())
            .field("stderr_sink", &self.sinks[1].is_some())
            .finish()
    }
}

impl RunOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_capture_output(mut self, capture_output: bool) -> Self {
        self.capture_output = capture_output;
        self
    }

    pub fn with_combined_streams(mut self, combine: bool) -> Self {
        self.combine_streams = combine;
        self
    }

    /// Builder method to echo the output as it arrives. With combined streams, everything goes to
    /// the stdout sink.
    pub fn with_sinks(mut self, stdout: Option<OutputSink>, stderr: Option<OutputSink>) -> Self {
        self.sinks = [stdout, stderr];
        self
    }
}

/// Result of a command that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcResult {
    /// Standard output of the command
    pub stdout: String,
    /// Standard error of the command
    pub stderr: String,
    /// Exit code of the command
    pub exit_code: i32,
}

impl ProcResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }

    pub fn stderr_lines(&self) -> impl Iterator<Item = &str> {
        self.stderr.lines()
    }

    /// Output lines with their newline characters, the last one may lack it.
    pub fn stdout_split(&self) -> Vec<&str> {
        self.stdout.split_inclusive('\n').collect()
    }

    pub fn stderr_split(&self) -> Vec<&str> {
        self.stderr.split_inclusive('\n').collect()
    }
}
