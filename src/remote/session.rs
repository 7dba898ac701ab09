//! SSH sessions behind the [`Transport`] seam.
//!
//! The session is switched to non-blocking mode once authenticated. The stdout and stderr readers
//! of a channel run in separate threads, and a blocking read on one of them would hold the session
//! lock until data arrives on that very stream. In non-blocking mode reads return `WouldBlock`
//! instead, and the readers poll.

use crate::error::{Error, Result};
use crate::remote::retry::{diagnose_ssh_error, is_transient, retry_with_backoff, RetryConfig};
use crate::transport::{Channel, ExitWaiter, Transport};
use log::{debug, info, warn};
use ssh2::{ErrorCode, Session, Sftp};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// libssh2 return code for "would block".
const LIBSSH2_ERROR_EAGAIN: i32 = -37;
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;
const LIBSSH2_FX_PERMISSION_DENIED: i32 = 3;

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Private keys tried when no key is configured.
const DEFAULT_KEYS: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

fn is_eagain(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

/// Repeats a libssh2 operation until it stops reporting "would block".
pub(crate) fn retry_eagain<T, F>(mut op: F) -> std::result::Result<T, ssh2::Error>
where
    F: FnMut() -> std::result::Result<T, ssh2::Error>,
{
    loop {
        match op() {
            Err(e) if is_eagain(&e) => thread::sleep(POLL_INTERVAL),
            result => return result,
        }
    }
}

/// Maps an SFTP failure on `path` to the error taxonomy.
pub(crate) fn sftp_error(err: ssh2::Error, what: &str, path: &Path, hostmsg: &str) -> Error {
    let msg = format!("failed to {} '{}'{}: {}", what, path.display(), hostmsg, err);
    match err.code() {
        ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) => Error::NotFound(msg),
        ErrorCode::SFTP(LIBSSH2_FX_PERMISSION_DENIED) => Error::PermissionDenied(msg),
        _ => Error::Command(msg),
    }
}

/// Turns a non-blocking reader or writer into a blocking one by polling.
pub(crate) struct Blocking<T>(pub(crate) T);

impl<T: Read> Read for Blocking<T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.0.read(buf) {
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
                result => return result,
            }
        }
    }
}

impl<T: Write> Write for Blocking<T> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        loop {
            match self.0.write(buf) {
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
                result => return result,
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        loop {
            match self.0.flush() {
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
                result => return result,
            }
        }
    }
}

fn lock_channel(channel: &Mutex<ssh2::Channel>) -> std::sync::MutexGuard<'_, ssh2::Channel> {
    channel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Standard input of a remote command. Dropping it sends end of file.
struct SshStdin {
    stream: Blocking<ssh2::Stream>,
    channel: Arc<Mutex<ssh2::Channel>>,
}

impl Write for SshStdin {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl Drop for SshStdin {
    fn drop(&mut self) {
        let mut channel = lock_channel(&self.channel);
        if let Err(e) = retry_eagain(|| channel.send_eof()) {
            debug!("failed to send EOF: {}", e);
        }
    }
}

struct SshWaiter {
    channel: Arc<Mutex<ssh2::Channel>>,
    closed: bool,
}

impl SshWaiter {
    /// Collects the exit status once the remote side sent EOF.
    fn try_finish(&mut self) -> Result<Option<i32>> {
        let mut channel = lock_channel(&self.channel);
        if !channel.eof() {
            return Ok(None);
        }

        let channel_err = |e: ssh2::Error| Error::Transport(format!("SSH channel failure: {}", e));
        if !self.closed {
            match channel.close() {
                Ok(()) => self.closed = true,
                Err(e) if is_eagain(&e) => return Ok(None),
                Err(e) => return Err(channel_err(e)),
            }
        }
        match channel.wait_close() {
            Ok(()) => {}
            Err(e) if is_eagain(&e) => return Ok(None),
            Err(e) => return Err(channel_err(e)),
        }

        if let Ok(signal) = channel.exit_signal() {
            if let Some(name) = signal.exit_signal {
                debug!("remote process was killed by signal {}", name);
            }
        }
        channel.exit_status().map(Some).map_err(channel_err)
    }
}

impl ExitWaiter for SshWaiter {
    fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<i32>> {
        let start = Instant::now();
        loop {
            if let Some(code) = self.try_finish()? {
                return Ok(Some(code));
            }
            if timeout.is_some_and(|timeout| start.elapsed() >= timeout) {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn poll(&mut self) -> Result<Option<i32>> {
        self.try_finish()
    }

    fn close(&mut self) {
        if !self.closed {
            let _ = lock_channel(&self.channel).close();
            self.closed = true;
        }
    }
}

/// Parameters of an SSH connection, resolved from the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    /// Name of the host as the user refers to it, used in messages.
    pub hostname: String,
    /// Name or address to connect to.
    pub connhost: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub privkey: Option<PathBuf>,
    /// Connection establishment timeout.
    pub timeout: Duration,
}

/// An authenticated SSH session.
pub struct SshTransport {
    session: Session,
    hostname: String,
}

impl SshTransport {
    /// Connects and authenticates, retrying transient connection failures.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] with troubleshooting suggestions if the connection cannot be
    /// established or authentication fails.
    pub fn connect(params: &ConnectParams, retry: &RetryConfig) -> Result<Self> {
        info!(
            "Establishing SSH connection to {} using address {}:{} as '{}'",
            params.hostname, params.connhost, params.port, params.username
        );

        let name = format!("SSH connection to {}", params.hostname);
        let session = retry_with_backoff(retry, || Self::connect_once(params), is_transient, &name)
            .map_err(|e| {
                let key = params.privkey.as_ref().map(|k| k.display().to_string());
                Error::Connect(diagnose_ssh_error(
                    &e,
                    &params.connhost,
                    params.port,
                    key.as_deref(),
                ))
            })?;

        session.set_blocking(false);
        Ok(Self {
            session,
            hostname: params.hostname.clone(),
        })
    }

    fn connect_once(params: &ConnectParams) -> Result<Session> {
        let connect_err = |msg: String| {
            Error::Connect(format!(
                "cannot establish TCP connection to host '{}' ({}:{}): {}",
                params.hostname, params.connhost, params.port, msg
            ))
        };

        let addr = (params.connhost.as_str(), params.port)
            .to_socket_addrs()
            .map_err(|e| connect_err(format!("failed to resolve the address: {}", e)))?
            .next()
            .ok_or_else(|| connect_err("failed to resolve the address".to_string()))?;

        let tcp = TcpStream::connect_timeout(&addr, params.timeout)
            .map_err(|e| connect_err(e.to_string()))?;

        let mut session = Session::new()
            .map_err(|e| Error::Connect(format!("failed to create SSH session: {}", e)))?;
        session.set_timeout(params.timeout.as_millis().min(u32::MAX as u128) as u32);
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| {
            Error::Connect(format!(
                "SSH handshake with host '{}' failed: {}",
                params.hostname, e
            ))
        })?;

        Self::authenticate(&session, params)?;
        // Commands may run for a long time, the timeout only applies to connecting.
        session.set_timeout(0);
        debug!("SSH connection to {} established", params.hostname);
        Ok(session)
    }

    fn authenticate(session: &Session, params: &ConnectParams) -> Result<()> {
        let user = params.username.as_str();
        let mut tried = Vec::new();

        if let Some(key) = &params.privkey {
            debug!("authenticating as '{}' with key {}", user, key.display());
            match session.userauth_pubkey_file(user, None, key, None) {
                Ok(()) => return Ok(()),
                Err(e) => warn!("public key authentication with {} failed: {}", key.display(), e),
            }
            tried.push(key.display().to_string());
        }

        if let Some(password) = &params.password {
            debug!("authenticating as '{}' with a password", user);
            match session.userauth_password(user, password) {
                Ok(()) => return Ok(()),
                Err(e) => warn!("password authentication failed: {}", e),
            }
            tried.push("password".to_string());
        }

        debug!("authenticating as '{}' via the SSH agent", user);
        match session.userauth_agent(user) {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => {}
            Err(e) => debug!("agent authentication failed: {}", e),
        }
        tried.push("agent".to_string());

        if params.privkey.is_none() {
            if let Some(ssh_dir) = dirs::home_dir().map(|home| home.join(".ssh")) {
                for name in DEFAULT_KEYS {
                    let key = ssh_dir.join(name);
                    if !key.is_file() {
                        continue;
                    }
                    debug!("authenticating as '{}' with key {}", user, key.display());
                    if session.userauth_pubkey_file(user, None, &key, None).is_ok() {
                        return Ok(());
                    }
                    tried.push(key.display().to_string());
                }
            }
        }

        Err(Error::Connect(format!(
            "SSH authentication failed for user '{}' on host '{}'. Tried: {}",
            user,
            params.hostname,
            tried.join(", ")
        )))
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Opens an SFTP session.
    pub(crate) fn open_sftp(&self) -> Result<Sftp> {
        retry_eagain(|| self.session.sftp()).map_err(|e| {
            Error::Transport(format!(
                "failed to establish SFTP session with host '{}': {}",
                self.hostname, e
            ))
        })
    }

    /// Sends disconnect. The session cannot be used afterwards.
    pub fn disconnect(&self) {
        if let Err(e) = retry_eagain(|| self.session.disconnect(None, "closing", None)) {
            debug!("failed to disconnect from {}: {}", self.hostname, e);
        }
    }
}

impl Transport for SshTransport {
    fn exec(&self, command: &str, _shell: bool) -> Result<Channel> {
        let exec_err = |e: ssh2::Error| {
            Error::Transport(format!(
                "failed to run the following command on host '{}':\n  {}\nThe error is: {}",
                self.hostname, command, e
            ))
        };

        let mut channel = retry_eagain(|| self.session.channel_session()).map_err(exec_err)?;
        retry_eagain(|| channel.exec(command)).map_err(exec_err)?;

        let stdout = channel.stream(0);
        let stdin = Blocking(channel.stream(0));
        let stderr = channel.stderr();
        let channel = Arc::new(Mutex::new(channel));

        Ok(Channel {
            stdin: Box::new(SshStdin {
                stream: stdin,
                channel: Arc::clone(&channel),
            }),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            waiter: Box::new(SshWaiter {
                channel,
                closed: false,
            }),
        })
    }
}
