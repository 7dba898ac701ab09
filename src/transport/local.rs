//! Local child processes behind the [`Transport`] seam.

use super::{Channel, ExitWaiter, Transport};
use crate::error::{Error, Result};
use log::debug;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// How often a child is polled while waiting for it with a timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Starts commands as children of the current process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        Self
    }

    fn build(command: &str, shell: bool) -> Result<std::process::Command> {
        if shell {
            let mut cmd = std::process::Command::new("sh");
            cmd.arg("-c").arg(command);
            return Ok(cmd);
        }

        let argv = shlex::split(command).ok_or_else(|| {
            Error::Command(format!("cannot split the following command into arguments:\n  {}", command))
        })?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Command("cannot run an empty command".to_string()))?;

        let mut cmd = std::process::Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}

impl Transport for LocalTransport {
    fn exec(&self, command: &str, shell: bool) -> Result<Channel> {
        let mut cmd = Self::build(command, shell)?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            Error::from_io(
                &e,
                &format!("cannot execute the following command:\n  {}\nThe error is", command),
            )
        })?;
        debug!("started local process {}: {}", child.id(), command);

        let missing = || Error::Transport(format!("no standard stream pipes for: {}", command));
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;

        Ok(Channel {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            waiter: Box::new(LocalWaiter { child }),
        })
    }
}

/// Exit code of a local process, signals are reported the way shells do (128 + signal number).
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

struct LocalWaiter {
    child: Child,
}

impl ExitWaiter for LocalWaiter {
    fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<i32>> {
        let Some(timeout) = timeout else {
            let status = self.child.wait().map_err(|e| {
                Error::Transport(format!("failed to wait for process {}: {}", self.child.id(), e))
            })?;
            return Ok(Some(exit_code(status)));
        };

        let start = Instant::now();
        loop {
            if let Some(code) = self.poll()? {
                return Ok(Some(code));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn poll(&mut self) -> Result<Option<i32>> {
        let status = self.child.try_wait().map_err(|e| {
            Error::Transport(format!("failed to check process {}: {}", self.child.id(), e))
        })?;
        Ok(status.map(exit_code))
    }

    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn close(&mut self) {
        // Reap the child if it is already gone, it is never killed.
        let _ = self.child.try_wait();
    }
}
