//! Retrying SSH connection attempts and explaining connection failures.

use crate::error::{Error, Result};
use log::{debug, warn};
use std::thread;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the initial attempt)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub backoff_multiplier: f64,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            ..Self::default()
        }
    }

    /// A configuration which makes a single attempt.
    pub fn no_retries() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Calculates the delay before retry number `attempt` (counting from 0).
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Returns true for connection failures which may go away when trying again.
///
/// Authentication failures and bad host names are not transient.
pub fn is_transient(error: &Error) -> bool {
    let Error::Connect(msg) = error else {
        return false;
    };
    let msg = msg.to_lowercase();
    ["connection refused", "timed out", "connection reset", "no route to host"]
        .iter()
        .any(|pattern| msg.contains(pattern))
}

/// Runs `operation` and retries it with exponential backoff while it fails with an error for which
/// `should_retry` returns true.
///
/// # Errors
///
/// Returns the last error if all attempts fail, or the first error `should_retry` rejects.
pub fn retry_with_backoff<T, F, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
    operation_name: &str,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 0;
    loop {
        let err = match operation() {
            Ok(result) => {
                if attempt > 0 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) => e,
        };

        if attempt >= config.max_retries || !should_retry(&err) {
            debug!("{} failed, giving up: {}", operation_name, err);
            return Err(err);
        }

        let delay = config.calculate_delay(attempt);
        attempt += 1;
        warn!(
            "{} failed: {}. Retrying (attempt {}/{}) after {:?}",
            operation_name, err, attempt, config.max_retries, delay
        );
        thread::sleep(delay);
    }
}

/// Adds troubleshooting suggestions to an SSH connection failure.
pub fn diagnose_ssh_error(error: &Error, host: &str, port: u16, ssh_key: Option<&str>) -> String {
    let error_str = error.to_string().to_lowercase();
    let mut suggestions = Vec::new();

    if error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("no route to host")
    {
        suggestions.push(format!("• Verify the host '{}' is reachable", host));
        suggestions.push(format!(
            "• Check if SSH is running on port {} (try: ssh -p {} {})",
            port, port, host
        ));
    }

    if error_str.contains("authentication")
        || error_str.contains("permission denied")
        || error_str.contains("publickey")
    {
        match ssh_key {
            Some(key) => {
                suggestions.push(format!("• Check that the private key exists: {}", key));
                suggestions.push(format!(
                    "• Verify the public key is in ~/.ssh/authorized_keys on {}",
                    host
                ));
            }
            None => {
                suggestions.push("• Specify a private key with '--key'".to_string());
                suggestions.push("• Verify your SSH agent is running (ssh-add -l)".to_string());
            }
        }
    }

    if error_str.contains("resolve") {
        suggestions.push(format!(
            "• Check the host name '{}' and the 'HostName' option in your SSH configuration",
            host
        ));
    }

    if suggestions.is_empty() {
        suggestions.push(format!(
            "• Test the connection manually: ssh -p {} {}",
            port, host
        ));
    }

    format!(
        "{}\n\nTroubleshooting suggestions:\n{}",
        error,
        suggestions.join("\n")
    )
}
