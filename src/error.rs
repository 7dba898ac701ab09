use std::time::Duration;
use thiserror::Error;

/// Maximum number of output lines included into a command failure message, per stream.
const MAX_MSG_LINES: usize = 64;

#[derive(Error, Debug)]
pub enum HostExecError {
    /// Authentication or transport establishment failure.
    #[error("{0}")]
    Connect(String),

    /// The command did not finish within the deadline. Carries whatever was captured so far.
    #[error("{message}")]
    Timeout {
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PermissionDenied(String),

    /// The interactive shell completion marker matched, but the trailer was malformed.
    #[error("{0}")]
    Protocol(String),

    /// Generic command failure, e.g. a non-zero exit status.
    #[error("{0}")]
    Command(String),

    /// I/O failure on a session or a channel while a command was running.
    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    NotSupported(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostExecError {
    /// Returns true for failures of a command, including transport I/O failures while it ran.
    pub fn is_command_failure(&self) -> bool {
        matches!(self, Self::Command(_) | Self::Transport(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Maps an I/O error to the taxonomy, prefixing the message with `prefix`.
    pub fn from_io(err: &std::io::Error, prefix: &str) -> Self {
        let msg = format!("{}: {}", prefix, err);
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(msg),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(msg),
            _ => Self::Command(msg),
        }
    }
}

pub type Error = HostExecError;
pub type Result<T> = std::result::Result<T, Error>;

fn tail_lines(output: &str) -> String {
    let lines: Vec<&str> = output.trim_end().lines().collect();
    if lines.len() <= MAX_MSG_LINES {
        return lines.join("\n");
    }

    let skipped = lines.len() - MAX_MSG_LINES;
    format!(
        "... ({} lines skipped) ...\n{}",
        skipped,
        lines[skipped..].join("\n")
    )
}

/// Formats the message describing a failed or timed out command.
///
/// `exit_code` being `None` means the command did not finish, in which case `timeout` (if known)
/// is mentioned in the message.
pub fn cmd_failed_msg(
    command: &str,
    stdout: &str,
    stderr: &str,
    exit_code: Option<i32>,
    hostname: Option<&str>,
    timeout: Option<Duration>,
) -> String {
    let hostmsg = hostname
        .map(|h| format!(" on host '{}'", h))
        .unwrap_or_default();

    let mut msg = match exit_code {
        Some(code) => format!(
            "ran the following command{}, but it exited with status {}:\n  {}",
            hostmsg, code, command
        ),
        None => match timeout {
            Some(timeout) => format!(
                "the following command{} did not finish executing in {:.1} seconds:\n  {}",
                hostmsg,
                timeout.as_secs_f64(),
                command
            ),
            None => format!(
                "the following command{} did not finish executing:\n  {}",
                hostmsg, command
            ),
        },
    };

    if !stdout.trim().is_empty() {
        msg.push_str("\nThe standard output of the command:\n");
        msg.push_str(&tail_lines(stdout));
    }
    if !stderr.trim().is_empty() {
        msg.push_str("\nThe standard error of the command:\n");
        msg.push_str(&tail_lines(stderr));
    }

    msg
}
