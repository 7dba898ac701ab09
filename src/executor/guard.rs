//! Single-flight guard of the interactive shell.
//!
//! The interactive shell can run one command at a time. The guard keeps a busy flag and the idle
//! shell behind a mutex which is only held to flip the flag, never while a command runs. Acquiring
//! the mutex is bounded, so callers never block for long on the shared shell and fall back to a
//! dedicated session instead.

use super::shell::InteractiveShell;
use crate::error::{Error, Result};
use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

/// Default bound on waiting for the guard mutex.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Default)]
pub(crate) struct GuardState {
    busy: bool,
    /// The idle shell, `None` if it was not started yet or is leased out.
    shell: Option<InteractiveShell>,
    closed: bool,
}

impl GuardState {
    #[cfg(test)]
    pub(crate) fn shell_pid(&self) -> Option<u32> {
        self.shell.as_ref().and_then(|shell| shell.pid())
    }
}

/// Why the interactive shell could not be leased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    /// Another command is running in the shell.
    Busy,
    /// The guard mutex could not be acquired in time.
    LockTimeout,
    /// The executor was closed.
    Closed,
}

pub struct SingleFlightGuard {
    state: Mutex<GuardState>,
    lock_timeout: Duration,
}

impl SingleFlightGuard {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(GuardState::default()),
            lock_timeout,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Acquires the guard mutex, giving up after the lock timeout.
    pub(crate) fn lock(&self) -> Option<MutexGuard<'_, GuardState>> {
        let start = Instant::now();
        loop {
            match self.state.try_lock() {
                Ok(state) => return Some(state),
                // The state is a flag and an idle shell, both stay consistent if a holder panicked.
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {}
            }
            if start.elapsed() >= self.lock_timeout {
                return None;
            }
            thread::sleep(LOCK_RETRY_INTERVAL);
        }
    }

    /// Marks the shell busy and leases it out for running `cmd`.
    pub fn acquire(self: &Arc<Self>, cmd: &str) -> std::result::Result<ShellLease, Unavailable> {
        let Some(mut state) = self.lock() else {
            warn!(
                "failed to acquire the interactive shell lock in {:?} for: {}",
                self.lock_timeout, cmd
            );
            return Err(Unavailable::LockTimeout);
        };

        if state.closed {
            return Err(Unavailable::Closed);
        }
        if state.busy {
            return Err(Unavailable::Busy);
        }

        state.busy = true;
        debug!("interactive shell acquired for: {}", cmd);
        Ok(ShellLease {
            shell: state.shell.take(),
            guard: Arc::clone(self),
            released: false,
        })
    }

    /// Whether a command currently occupies the shell.
    pub fn is_busy(&self) -> bool {
        self.lock().map(|state| state.busy).unwrap_or(true)
    }

    /// Returns a healthy shell after its command finished.
    fn release(&self, shell: Option<InteractiveShell>, cmd: &str) {
        let Some(mut state) = self.lock() else {
            warn!(
                "failed to acquire the interactive shell lock to release it after: {}. New \
                 commands will run in new sessions",
                cmd
            );
            if let Some(shell) = shell {
                shell.teardown();
            }
            return;
        };

        if state.closed {
            if let Some(shell) = shell {
                shell.teardown();
            }
        } else {
            state.shell = shell;
        }
        state.busy = false;
        debug!("interactive shell released after: {}", cmd);
    }

    /// Clears the busy flag after the leased shell was torn down.
    fn discard(&self) {
        match self.lock() {
            Some(mut state) => state.busy = false,
            None => warn!("failed to acquire the interactive shell lock to discard the shell"),
        }
    }

    /// Stops the idle shell. A leased shell is stopped once its command finishes.
    pub fn close(&self) {
        let shell = match self.lock() {
            Some(mut state) => {
                state.closed = true;
                state.shell.take()
            }
            None => {
                warn!("failed to acquire the interactive shell lock to close the shell");
                None
            }
        };
        if let Some(shell) = shell {
            debug!("closing the interactive shell");
            shell.teardown();
        }
    }
}

/// Exclusive use of the interactive shell for one command.
///
/// Dropping a lease without [`ShellLease::release`] means the shell is in an unknown state, e.g. the
/// command timed out or the shell broke. The shell is then torn down and a new one is started for
/// a later command.
pub struct ShellLease {
    shell: Option<InteractiveShell>,
    guard: Arc<SingleFlightGuard>,
    released: bool,
}

impl ShellLease {
    pub(crate) fn has_shell(&self) -> bool {
        self.shell.is_some()
    }

    pub(crate) fn install(&mut self, shell: InteractiveShell) {
        self.shell = Some(shell);
    }

    pub(crate) fn shell_mut(&mut self) -> Result<&mut InteractiveShell> {
        self.shell
            .as_mut()
            .ok_or_else(|| Error::Transport("the interactive shell is not running".to_string()))
    }

    /// Hands the shell back to the guard. The shell must not be used after this.
    pub(crate) fn release(&mut self, cmd: &str) {
        if self.released {
            return;
        }
        self.released = true;
        self.guard.release(self.shell.take(), cmd);
    }
}

impl Drop for ShellLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(shell) = self.shell.take() {
            debug!("tearing down the interactive shell");
            shell.teardown();
        }
        self.guard.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_busy_and_release() {
        let guard = Arc::new(SingleFlightGuard::new(DEFAULT_LOCK_TIMEOUT));
        let mut lease = guard.acquire("first").unwrap();
        assert!(!lease.has_shell());
        assert!(guard.is_busy());
        assert_eq!(guard.acquire("second").err(), Some(Unavailable::Busy));

        lease.release("first");
        assert!(!guard.is_busy());
        assert!(guard.acquire("third").is_ok());
    }

    #[test]
    fn test_dropped_lease_clears_busy() {
        let guard = Arc::new(SingleFlightGuard::new(DEFAULT_LOCK_TIMEOUT));
        let lease = guard.acquire("cmd").unwrap();
        drop(lease);
        assert!(!guard.is_busy());
    }

    #[test]
    fn test_lock_timeout() {
        let guard = Arc::new(SingleFlightGuard::new(Duration::from_millis(50)));
        let held = guard.lock().unwrap();

        let start = Instant::now();
        assert_eq!(guard.acquire("cmd").err(), Some(Unavailable::LockTimeout));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(2));
        drop(held);

        assert!(guard.acquire("cmd").is_ok());
    }

    #[test]
    fn test_closed_guard() {
        let guard = Arc::new(SingleFlightGuard::new(DEFAULT_LOCK_TIMEOUT));
        guard.close();
        assert_eq!(guard.acquire("cmd").err(), Some(Unavailable::Closed));
    }

    #[test]
    fn test_release_after_close() {
        let guard = Arc::new(SingleFlightGuard::new(DEFAULT_LOCK_TIMEOUT));
        let mut lease = guard.acquire("cmd").unwrap();
        guard.close();
        lease.release("cmd");
        assert!(!guard.is_busy());
        assert_eq!(guard.acquire("cmd").err(), Some(Unavailable::Closed));
    }
}
