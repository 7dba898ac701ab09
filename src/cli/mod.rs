pub mod config;
pub mod file;
pub mod run;
pub mod transfer;
pub mod which;

use anyhow::{bail, Context, Result};
use clap::Args;
use hostexec::config::{Config, HostConfig};
use hostexec::{get_pman_with, ProcessManager};
use std::time::Duration;

/// Selects the host subcommands operate on. The local host is used when no host is given.
#[derive(Args, Debug, Default)]
pub struct HostArgs {
    #[arg(short = 'H', long, global = true, help = "Host name or address to connect to")]
    host: Option<String>,

    #[arg(
        long,
        global = true,
        conflicts_with = "host",
        help = "Name of a host from the configuration file"
    )]
    remote: Option<String>,

    #[arg(short = 'U', long, global = true, help = "SSH username")]
    user: Option<String>,

    #[arg(short = 'K', long, global = true, help = "Path to the SSH private key")]
    key: Option<String>,

    #[arg(short = 'p', long, global = true, help = "SSH port")]
    port: Option<u16>,

    #[arg(short = 'T', long, global = true, help = "Command timeout in seconds")]
    timeout: Option<u64>,
}

/// The process manager selected by [`HostArgs`], plus the command timeout to use with it.
pub struct Target {
    pub pman: Box<dyn ProcessManager>,
    pub timeout: Option<Duration>,
}

impl Drop for Target {
    fn drop(&mut self) {
        self.pman.close();
    }
}

impl HostArgs {
    fn host_config(&self, config: &Config) -> Result<Option<HostConfig>> {
        let host = match (&self.remote, &self.host) {
            (Some(name), _) => Some(
                config
                    .get_host(name)
                    .cloned()
                    .with_context(|| format!("host '{}' is not in the configuration file", name))?,
            ),
            (None, Some(host)) => Some(HostConfig::new(host.clone())),
            (None, None) => None,
        };

        let Some(mut host) = host else {
            if self.user.is_some() || self.key.is_some() || self.port.is_some() {
                bail!("--user, --key and --port require --host or --remote");
            }
            return Ok(None);
        };

        if let Some(user) = &self.user {
            host.user = Some(user.clone());
        }
        if let Some(key) = &self.key {
            host.ssh_key = Some(key.clone());
        }
        if let Some(port) = self.port {
            host.port = Some(port);
        }
        Ok(Some(host))
    }

    /// Connects to the selected host.
    pub fn connect(&self) -> Result<Target> {
        let config = Config::load()?;
        let host = self.host_config(&config)?;
        let pman = get_pman_with(host.as_ref(), &config.defaults)?;
        let timeout = self
            .timeout
            .map(Duration::from_secs)
            .or_else(|| config.defaults.command_timeout());
        Ok(Target { pman, timeout })
    }
}
