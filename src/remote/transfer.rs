//! Copying files to and from a remote host with `scp` and `rsync`.
//!
//! The transfer tools run on the local host, through the local process manager, and reach the
//! remote host with the same settings the SSH session was established with.

use crate::command::{quote, Command, RunOptions};
use crate::error::{Error, Result};
use crate::manager::{LocalProcessManager, ProcessManager};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn quote_path(path: &Path) -> Result<String> {
    quote(&path.to_string_lossy())
}

/// How the transfer tools reach the remote host.
#[derive(Debug, Clone, PartialEq)]
pub struct SshOptions {
    /// Name or address to connect to.
    pub connhost: String,
    pub port: u16,
    pub user: String,
    pub privkey: Option<PathBuf>,
    pub timeout: Duration,
}

impl SshOptions {
    /// Options for `ssh` and `scp`, quoted for the shell.
    pub fn to_opts_string(&self) -> Result<String> {
        let mut opts = vec![
            "-o BatchMode=yes".to_string(),
            format!("-o ConnectTimeout={}", self.timeout.as_secs().max(1)),
            format!("-o Port={}", self.port),
            format!("-o User={}", quote(&self.user)?),
        ];
        if let Some(key) = &self.privkey {
            opts.push(format!("-o IdentityFile={}", quote_path(key)?));
        }
        Ok(opts.join(" "))
    }

    /// `host:path` for the transfer tools, quoted for the local shell.
    ///
    /// The remote half is passed literally. This is right for `scp` in SFTP mode, the default
    /// since OpenSSH 9.0, and for `rsync` 3.2.4 and later, which protects its arguments from the
    /// remote shell. The legacy protocol of `scp -O` would need the path quoted once more.
    fn remote_spec(&self, path: &str) -> Result<String> {
        quote(&format!("{}:{}", self.connhost, path))
    }
}

/// Runs the transfer tools for one remote host.
pub struct ScpTransfer {
    opts: SshOptions,
    local: LocalProcessManager,
}

impl ScpTransfer {
    pub fn new(opts: SshOptions) -> Self {
        Self {
            opts,
            local: LocalProcessManager::new(),
        }
    }

    pub fn ssh_options(&self) -> &SshOptions {
        &self.opts
    }

    fn run_local(&self, cmd: String) -> Result<()> {
        self.local
            .run_verify(&Command::new(cmd), &RunOptions::default())
            .map(|_| ())
    }

    /// Copies `src` on the remote host to local `dst`. Directories are copied recursively.
    pub fn get(&self, src: &Path, dst: &Path) -> Result<()> {
        let cmd = format!(
            "scp -r {} -- {} {}",
            self.opts.to_opts_string()?,
            self.opts.remote_spec(&src.to_string_lossy())?,
            quote_path(dst)?
        );
        self.run_local(cmd)
    }

    /// Copies local `src` to `dst` on the remote host. Directories are copied recursively.
    pub fn put(&self, src: &Path, dst: &Path) -> Result<()> {
        let cmd = format!(
            "scp -r {} -- {} {}",
            self.opts.to_opts_string()?,
            quote_path(src)?,
            self.opts.remote_spec(&dst.to_string_lossy())?
        );
        self.run_local(cmd)
    }

    /// Synchronizes `src` to `dst`, where at most one of them is on the remote host.
    pub fn rsync(&self, src: &str, dst: &str, opts: &str, remote_src: bool, remote_dst: bool) -> Result<()> {
        if remote_src && remote_dst {
            return Err(Error::NotSupported(
                "rsync between two remote paths must run on the remote host".to_string(),
            ));
        }

        let src = if remote_src {
            self.opts.remote_spec(src)?
        } else {
            quote(src)?
        };
        let dst = if remote_dst {
            self.opts.remote_spec(dst)?
        } else {
            quote(dst)?
        };
        let rsh = quote(&format!("ssh {}", self.opts.to_opts_string()?))?;
        self.run_local(format!("rsync {} -e {} -- {} {}", opts, rsh, src, dst))
    }
}

/// The `rsync` command line for two local paths.
pub(crate) fn local_rsync_command(src: &str, dst: &str, opts: &str) -> Result<String> {
    Ok(format!("rsync {} -- {} {}", opts, quote(src)?, quote(dst)?))
}
