//! Process manager for a remote host reached over SSH.

use crate::command::{quote, Command, ProcResult, RunOptions};
use crate::config::ssh_config::{self, HostParams};
use crate::config::{DefaultSettings, HostConfig, DEFAULT_SSH_PORT};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::file::{FileStream, OpenMode};
use crate::manager::ProcessManager;
use crate::process::Process;
use crate::remote::retry::RetryConfig;
use crate::remote::session::{retry_eagain, sftp_error, Blocking, ConnectParams, SshTransport};
use crate::remote::transfer::{ScpTransfer, SshOptions};
use log::debug;
use ssh2::{OpenFlags, OpenType, Sftp};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Permissions of files created via [`ProcessManager::open`].
const NEW_FILE_MODE: i32 = 0o644;

/// Checks that `path` is a private key file OpenSSH would accept.
fn check_privkey(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        Error::from_io(&e, &format!("cannot access SSH private key '{}'", path.display()))
    })?;
    if !metadata.is_file() {
        return Err(Error::Config(format!(
            "SSH private key '{}' is not a regular file",
            path.display()
        )));
    }
    if metadata.permissions().mode() & 0o007 != 0 {
        return Err(Error::Config(format!(
            "SSH private key '{}' is accessible by others, run 'chmod o-rwx {}'",
            path.display(),
            path.display()
        )));
    }
    Ok(())
}

/// Combines the host configuration with what the SSH configuration files say about the host.
fn resolve_params(host: &HostConfig, found: &HostParams) -> Result<ConnectParams> {
    let username = host
        .user
        .clone()
        .or_else(|| found.user.clone())
        .unwrap_or_else(whoami::username);
    let connhost = host
        .ipaddr
        .clone()
        .or_else(|| found.hostname.clone())
        .unwrap_or_else(|| host.host.clone());
    let port = host.port.or(found.port).unwrap_or(DEFAULT_SSH_PORT);

    let privkey = match host.expanded_ssh_key() {
        Some(key) => Some(key),
        None => found
            .identity_paths(&host.host, &username)
            .into_iter()
            .find(|path| path.exists()),
    };
    if let Some(key) = &privkey {
        check_privkey(key)?;
    }

    Ok(ConnectParams {
        hostname: host.host.clone(),
        connhost,
        port,
        username,
        password: host.password.clone(),
        privkey,
        timeout: host.timeout(),
    })
}

fn open_flags(mode: OpenMode) -> OpenFlags {
    let mut flags = OpenFlags::empty();
    if mode.is_read() {
        flags |= OpenFlags::READ;
    }
    if mode.is_write() {
        flags |= OpenFlags::WRITE;
    }
    if mode.is_append() {
        flags |= OpenFlags::APPEND;
    }
    if mode.is_create() {
        flags |= OpenFlags::CREATE;
    }
    if mode.is_truncate() {
        flags |= OpenFlags::TRUNCATE;
    }
    flags
}

/// Runs commands and accesses files on a remote host over one SSH session.
pub struct SshProcessManager {
    executor: Executor<SshTransport>,
    /// Opened on first use.
    sftp: Mutex<Option<Sftp>>,
    transfer: ScpTransfer,
}

impl SshProcessManager {
    /// Connects to `host`. Settings missing from `host` are looked up in the SSH configuration
    /// files.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] if the connection or the authentication fails, and
    /// [`Error::Config`] for unusable private keys and broken SSH configuration files.
    pub fn connect(host: &HostConfig, settings: &DefaultSettings) -> Result<Self> {
        let found = ssh_config::lookup(&host.host)?;
        let params = resolve_params(host, &found)?;
        debug!(
            "connecting to '{}' as {}@{}:{}, key: {:?}",
            host.host, params.username, params.connhost, params.port, params.privkey
        );

        let transport = SshTransport::connect(&params, &RetryConfig::default())?;
        let executor = Executor::new(transport, Some(host.host.clone()))
            .with_lock_timeout(settings.shell_lock_timeout())
            .with_fast_path(settings.fast_path);

        let transfer = ScpTransfer::new(SshOptions {
            connhost: params.connhost,
            port: params.port,
            user: params.username,
            privkey: params.privkey,
            timeout: params.timeout,
        });

        Ok(Self {
            executor,
            sftp: Mutex::new(None),
            transfer,
        })
    }

    /// Options for running `ssh` or `scp` against the host from the local host.
    pub fn ssh_opts(&self) -> Result<String> {
        self.transfer.ssh_options().to_opts_string()
    }

    fn sftp(&self) -> Result<MutexGuard<'_, Option<Sftp>>> {
        let mut sftp = self
            .sftp
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if sftp.is_none() {
            *sftp = Some(self.executor.transport().open_sftp()?);
        }
        Ok(sftp)
    }
}

impl ProcessManager for SshProcessManager {
    fn hostname(&self) -> Option<&str> {
        self.executor.hostname()
    }

    fn run_async(&self, cmd: &Command) -> Result<Process> {
        self.executor.run_async(cmd, false)
    }

    fn run(&self, cmd: &Command, opts: &RunOptions) -> Result<ProcResult> {
        self.executor.run(cmd, opts)
    }

    fn open(&self, path: &Path, mode: &str) -> Result<FileStream> {
        let mode = OpenMode::parse(mode)?;
        let hostmsg = self.hostmsg();

        let guard = self.sftp()?;
        let sftp = guard.as_ref().ok_or_else(|| {
            Error::Transport(format!("no SFTP session{}", hostmsg))
        })?;
        let mut file = retry_eagain(|| {
            sftp.open_mode(path, open_flags(mode), NEW_FILE_MODE, OpenType::File)
        })
        .map_err(|e| sftp_error(e, "open file", path, &hostmsg))?;
        drop(guard);

        // Servers commonly ignore the append flag, so writing starts at the end explicitly.
        if mode.is_append() {
            let stat = retry_eagain(|| file.stat())
                .map_err(|e| sftp_error(e, "stat file", path, &hostmsg))?;
            file.seek(SeekFrom::Start(stat.size.unwrap_or(0)))
                .map_err(|e| {
                    Error::from_io(&e, &format!("failed to seek in '{}'{}", path.display(), hostmsg))
                })?;
        }

        Ok(FileStream::new(Box::new(Blocking(file)), path, mode, &hostmsg))
    }

    fn get(&self, src: &Path, dst: &Path) -> Result<()> {
        self.transfer.get(src, dst)
    }

    fn put(&self, src: &Path, dst: &Path) -> Result<()> {
        self.transfer.put(src, dst)
    }

    fn rsync(
        &self,
        src: &str,
        dst: &str,
        opts: &str,
        remote_src: bool,
        remote_dst: bool,
    ) -> Result<()> {
        if remote_src && remote_dst {
            // Both paths are on the remote host, so is the sync.
            let cmd = format!("rsync {} -- {} {}", opts, quote(src)?, quote(dst)?);
            return self
                .run_verify(&Command::new(cmd), &RunOptions::default())
                .map(|_| ());
        }
        self.transfer.rsync(src, dst, opts, remote_src, remote_dst)
    }

    /// Stops the interactive shell and disconnects. Nothing works afterwards.
    fn close(&self) {
        self.executor.close();
        self.sftp
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.executor.transport().disconnect();
    }
}

impl std::fmt::Debug for SshProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshProcessManager")
            .field("hostname", &self.executor.hostname())
            .field("ssh_options", self.transfer.ssh_options())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn write_key(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "key").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn test_resolve_explicit_values_win() {
        let dir = tempfile::tempdir().unwrap();
        let key = write_key(dir.path(), "id_test", 0o600);

        let host = HostConfig::new("sut")
            .with_ipaddr("10.0.0.5")
            .with_user("root")
            .with_port(2222)
            .with_ssh_key(key.to_string_lossy().to_string())
            .with_timeout(7);
        let found = HostParams {
            hostname: Some("sut.lab".to_string()),
            user: Some("admin".to_string()),
            port: Some(22),
            identity_files: vec![],
        };

        let params = resolve_params(&host, &found).unwrap();
        assert_eq!(params.hostname, "sut");
        assert_eq!(params.connhost, "10.0.0.5");
        assert_eq!(params.username, "root");
        assert_eq!(params.port, 2222);
        assert_eq!(params.privkey, Some(key));
        assert_eq!(params.timeout, Duration::from_secs(7));
    }

    #[test]
    fn test_resolve_from_ssh_config() {
        let dir = tempfile::tempdir().unwrap();
        write_key(dir.path(), "id_sut", 0o600);

        let found = HostParams {
            hostname: Some("sut.lab".to_string()),
            user: Some("admin".to_string()),
            port: Some(2200),
            identity_files: vec![
                dir.path().join("id_missing").to_string_lossy().to_string(),
                format!("{}/id_%h", dir.path().display()),
            ],
        };

        let params = resolve_params(&HostConfig::new("sut"), &found).unwrap();
        assert_eq!(params.connhost, "sut.lab");
        assert_eq!(params.username, "admin");
        assert_eq!(params.port, 2200);
        // %h expands to the resolved host name.
        assert_eq!(params.privkey, None);

        let found = HostParams {
            hostname: None,
            ..found
        };
        let params = resolve_params(&HostConfig::new("sut"), &found).unwrap();
        assert_eq!(params.connhost, "sut");
        assert_eq!(params.privkey, Some(dir.path().join("id_sut")));
    }

    #[test]
    fn test_resolve_defaults() {
        let params = resolve_params(&HostConfig::new("box"), &HostParams::default()).unwrap();
        assert_eq!(params.connhost, "box");
        assert_eq!(params.port, DEFAULT_SSH_PORT);
        assert_eq!(params.username, whoami::username());
        assert_eq!(params.privkey, None);
        assert_eq!(params.password, None);
    }

    #[test]
    fn test_check_privkey() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_privkey(&write_key(dir.path(), "good", 0o600)).is_ok());
        assert!(check_privkey(&write_key(dir.path(), "group", 0o640)).is_ok());
        assert!(matches!(
            check_privkey(&write_key(dir.path(), "open", 0o644)),
            Err(Error::Config(_))
        ));
        assert!(matches!(check_privkey(dir.path()), Err(Error::Config(_))));
        assert!(matches!(
            check_privkey(&dir.path().join("missing")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_open_flags() {
        let bits = |mode: &str| open_flags(OpenMode::parse(mode).unwrap()).bits();

        assert_eq!(bits("r"), OpenFlags::READ.bits());
        assert_eq!(
            bits("w"),
            (OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE).bits()
        );
        assert_eq!(
            bits("a+"),
            (OpenFlags::READ | OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::CREATE).bits()
        );
    }
}
