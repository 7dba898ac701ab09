//! Configuration management for hostexec.
//!
//! This module handles loading and saving the named hosts commands can be run on, plus the
//! settings of the command execution layer.
//!
//! # Configuration File Location
//!
//! The configuration file is stored at:
//! - Linux: `~/.config/hostexec/config.yml`
//! - macOS: `~/Library/Application Support/hostexec/config.yml`
//!
//! # Example Configuration
//!
//! ```yaml
//! hosts:
//!   sut:
//!     host: "sut.example.com"
//!     user: "root"
//!     ssh_key: "~/.ssh/id_ed25519"
//!   lab-box:
//!     host: "lab-box"
//!     ipaddr: "10.0.0.7"
//!     port: 2222
//! defaults:
//!   shell_lock_timeout: 5
//!   fast_path: true
//! ```

pub mod ssh_config;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default SSH connection timeout in seconds
const DEFAULT_TIMEOUT: u64 = 60;

/// Default bound on waiting for the interactive shell, in seconds
const DEFAULT_SHELL_LOCK_TIMEOUT: u64 = 5;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Named hosts
    #[serde(default)]
    pub hosts: HashMap<String, HostConfig>,

    /// Default settings that apply when not overridden
    #[serde(default)]
    pub defaults: DefaultSettings,
}

/// Configuration for a remote host. Unset values are taken from the SSH configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Name of the host, also used for looking it up in the SSH configuration
    pub host: String,

    /// Address to connect to instead of resolving `host`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipaddr: Option<String>,

    /// SSH username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// SSH port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Path to the SSH private key file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,

    /// Password for password authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

/// Default settings of the execution layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultSettings {
    /// How long to wait for the interactive shell lock before running in a new session, seconds
    #[serde(default = "default_shell_lock_timeout")]
    pub shell_lock_timeout: u64,

    /// Timeout for commands run from the command line, seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout: Option<u64>,

    /// Whether to run commands in the interactive shell when possible
    #[serde(default = "default_fast_path")]
    pub fast_path: bool,
}

impl Default for DefaultSettings {
    fn default() -> Self {
        Self {
            shell_lock_timeout: DEFAULT_SHELL_LOCK_TIMEOUT,
            command_timeout: None,
            fast_path: true,
        }
    }
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT
}

fn default_shell_lock_timeout() -> u64 {
    DEFAULT_SHELL_LOCK_TIMEOUT
}

fn default_fast_path() -> bool {
    true
}

impl Config {
    /// Returns the default configuration file path for the current platform.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("hostexec").join("config.yml"))
    }

    /// Loads configuration from the default location.
    ///
    /// Returns `Ok(Config::default())` if no config file exists.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Config::default()),
        }
    }

    /// Loads configuration from a specific file path.
    ///
    /// Returns `Ok(Config::default())` if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "failed to read config file '{}': {}\n\n\
                 Suggestions:\n\
                 • Check file permissions: ls -la {}",
                path.display(),
                e,
                path.display()
            ))
        })?;

        serde_yaml::from_str(&contents).map_err(|e| {
            Error::Config(format!(
                "failed to parse config file '{}': {}\n\n\
                 Suggestions:\n\
                 • Check YAML syntax in the config file\n\
                 • Verify indentation uses spaces, not tabs\n\n\
                 Example valid config:\n\
                 hosts:\n\
                   sut:\n\
                     host: \"sut.example.com\"\n\
                     user: \"root\"",
                path.display(),
                e
            ))
        })
    }

    /// Saves configuration to the default location.
    pub fn save(&self) -> Result<()> {
        match Self::default_path() {
            Some(path) => self.save_to(&path),
            None => Err(Error::Config(
                "could not determine the config directory, check that HOME is set".to_string(),
            )),
        }
    }

    /// Saves configuration to a specific file path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::from_io(
                    &e,
                    &format!("failed to create config directory '{}'", parent.display()),
                )
            })?;
        }

        let contents = serde_yaml::to_string(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;

        fs::write(path, contents).map_err(|e| {
            Error::from_io(
                &e,
                &format!("failed to write config file '{}'", path.display()),
            )
        })
    }

    /// Gets a host configuration by name.
    pub fn get_host(&self, name: &str) -> Option<&HostConfig> {
        self.hosts.get(name)
    }

    /// Adds or updates a host configuration.
    pub fn set_host(&mut self, name: String, config: HostConfig) {
        self.hosts.insert(name, config);
    }

    /// Removes a host configuration.
    pub fn remove_host(&mut self, name: &str) -> Option<HostConfig> {
        self.hosts.remove(name)
    }

    /// Lists all configured host names, sorted.
    pub fn host_names(&self) -> Vec<&String> {
        let mut names: Vec<&String> = self.hosts.keys().collect();
        names.sort();
        names
    }
}

impl DefaultSettings {
    pub fn shell_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_lock_timeout)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout.map(Duration::from_secs)
    }
}

impl HostConfig {
    /// Creates a new host configuration. Everything else is taken from the SSH configuration.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ipaddr: None,
            user: None,
            port: None,
            ssh_key: None,
            password: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Builder method to set the address to connect to.
    pub fn with_ipaddr(mut self, ipaddr: impl Into<String>) -> Self {
        self.ipaddr = Some(ipaddr.into());
        self
    }

    /// Builder method to set the SSH username.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Builder method to set the SSH port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Builder method to set the SSH key path.
    pub fn with_ssh_key(mut self, key_path: impl Into<String>) -> Self {
        self.ssh_key = Some(key_path.into());
        self
    }

    /// Builder method to set the password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Builder method to set the timeout.
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Returns the SSH connection string ([user@]host[:port]).
    pub fn connection_string(&self) -> String {
        let mut result = match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        };
        if let Some(port) = self.port.filter(|port| *port != DEFAULT_SSH_PORT) {
            result.push_str(&format!(":{}", port));
        }
        result
    }

    /// Expands the SSH key path, replacing ~ with the home directory.
    pub fn expanded_ssh_key(&self) -> Option<PathBuf> {
        self.ssh_key.as_deref().map(ssh_config::expand_tilde)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.hosts.is_empty());
        assert_eq!(config.defaults.shell_lock_timeout(), Duration::from_secs(5));
        assert!(config.defaults.fast_path);
        assert!(config.defaults.command_timeout().is_none());
    }

    #[test]
    fn test_host_config_builder() {
        let host = HostConfig::new("example.com")
            .with_user("root")
            .with_port(2222)
            .with_ipaddr("10.0.0.1")
            .with_ssh_key("~/.ssh/id_ed25519")
            .with_timeout(120);

        assert_eq!(host.user.as_deref(), Some("root"));
        assert_eq!(host.port, Some(2222));
        assert_eq!(host.ipaddr.as_deref(), Some("10.0.0.1"));
        assert_eq!(host.timeout(), Duration::from_secs(120));
        assert!(host.password.is_none());
    }

    #[test]
    fn test_connection_string() {
        let host = HostConfig::new("example.com");
        assert_eq!(host.connection_string(), "example.com");

        let host = host.with_user("user").with_port(22);
        assert_eq!(host.connection_string(), "user@example.com");

        let host = host.with_port(2222);
        assert_eq!(host.connection_string(), "user@example.com:2222");
    }

    #[test]
    fn test_expanded_ssh_key() {
        let host = HostConfig::new("example.com").with_ssh_key("~/.ssh/id_rsa");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(host.expanded_ssh_key(), Some(home.join(".ssh/id_rsa")));
        }

        let host = HostConfig::new("example.com").with_ssh_key("/keys/id_rsa");
        assert_eq!(host.expanded_ssh_key(), Some(PathBuf::from("/keys/id_rsa")));
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.yml");

        let mut config = Config::default();
        config.set_host("sut".to_string(), HostConfig::new("sut.example.com").with_user("root"));
        config.defaults.command_timeout = Some(30);
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.get_host("sut"), config.get_host("sut"));
        assert_eq!(loaded.defaults, config.defaults);
        assert_eq!(loaded.host_names(), vec!["sut"]);
    }

    #[test]
    fn test_load_missing_and_partial() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("missing.yml")).unwrap();
        assert!(config.hosts.is_empty());

        let path = dir.path().join("config.yml");
        fs::write(&path, "hosts:\n  box:\n    host: box.lan\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        let host = config.get_host("box").unwrap();
        assert_eq!(host.timeout, 60);
        assert!(host.port.is_none());
        assert!(config.defaults.fast_path);
    }

    #[test]
    fn test_load_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "hosts: [unclosed").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_remove_host() {
        let mut config = Config::default();
        config.set_host("a".to_string(), HostConfig::new("a"));
        assert!(config.remove_host("a").is_some());
        assert!(config.remove_host("a").is_none());
    }
}
