//! Process manager for the local host.

use super::ProcessManager;
use crate::command::{quote, Command, ProcResult, RunOptions};
use crate::error::Result;
use crate::executor::Executor;
use crate::file::{FileStream, OpenMode};
use crate::process::Process;
use crate::remote::transfer::local_rsync_command;
use crate::transport::local::LocalTransport;
use std::path::Path;

/// Runs commands as children of the current process.
///
/// Starting a local process is cheap, so commands always run in a process of their own and the
/// interactive shell is not used.
pub struct LocalProcessManager {
    executor: Executor<LocalTransport>,
}

impl LocalProcessManager {
    pub fn new() -> Self {
        Self {
            executor: Executor::new(LocalTransport::new(), None).with_fast_path(false),
        }
    }

    fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
        let cmd = format!(
            "cp -r -- {} {}",
            quote(&src.to_string_lossy())?,
            quote(&dst.to_string_lossy())?
        );
        self.run_verify(&Command::new(cmd), &RunOptions::default())
            .map(|_| ())
    }
}

impl Default for LocalProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessManager for LocalProcessManager {
    fn hostname(&self) -> Option<&str> {
        None
    }

    fn run_async(&self, cmd: &Command) -> Result<Process> {
        self.executor.run_async(cmd, false)
    }

    fn run(&self, cmd: &Command, opts: &RunOptions) -> Result<ProcResult> {
        self.executor.run(cmd, opts)
    }

    fn open(&self, path: &Path, mode: &str) -> Result<FileStream> {
        FileStream::open_local(path, OpenMode::parse(mode)?)
    }

    fn get(&self, src: &Path, dst: &Path) -> Result<()> {
        self.copy(src, dst)
    }

    fn put(&self, src: &Path, dst: &Path) -> Result<()> {
        self.copy(src, dst)
    }

    fn rsync(
        &self,
        src: &str,
        dst: &str,
        opts: &str,
        _remote_src: bool,
        _remote_dst: bool,
    ) -> Result<()> {
        let cmd = local_rsync_command(src, dst, opts)?;
        self.run_verify(&Command::new(cmd), &RunOptions::default())
            .map(|_| ())
    }

    fn close(&self) {
        self.executor.close();
    }
}
