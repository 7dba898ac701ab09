//! CLI command for managing the hostexec configuration.

use anyhow::Result;
use clap::{Args, Subcommand};
use hostexec::config::{Config, HostConfig};
use hostexec::{get_pman_with, Command, RunOptions};

#[derive(Args)]
#[command(about = "Manage the hostexec configuration")]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show the configuration file path
    Path,

    /// List all configured hosts
    ListHosts,

    /// Add a new host, or update an existing one
    AddHost {
        /// Name to refer to the host by (e.g., "sut")
        name: String,

        /// Host name, also looked up in the SSH configuration files
        #[arg(long)]
        host: String,

        /// Address to connect to instead of resolving the host name
        #[arg(long)]
        ipaddr: Option<String>,

        /// SSH username
        #[arg(long)]
        user: Option<String>,

        /// SSH port
        #[arg(long)]
        port: Option<u16>,

        /// Path to SSH private key
        #[arg(long)]
        ssh_key: Option<String>,

        /// Connection timeout in seconds
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Remove a host
    RemoveHost {
        /// Name of the host to remove
        name: String,
    },

    /// Show details of a specific host
    ShowHost {
        /// Name of the host to show
        name: String,
    },

    /// Check that configured hosts can be reached and run commands
    Validate {
        /// Specific host to validate (validates all if not specified)
        name: Option<String>,
    },
}

impl ConfigCommand {
    pub fn execute(&self) -> Result<()> {
        match &self.action {
            ConfigAction::Show => self.show_config(),
            ConfigAction::Path => self.show_path(),
            ConfigAction::ListHosts => self.list_hosts(),
            ConfigAction::AddHost {
                name,
                host,
                ipaddr,
                user,
                port,
                ssh_key,
                timeout,
            } => {
                let mut config = HostConfig::new(host.clone()).with_timeout(*timeout);
                config.ipaddr = ipaddr.clone();
                config.user = user.clone();
                config.port = *port;
                config.ssh_key = ssh_key.clone();
                self.add_host(name, config)
            }
            ConfigAction::RemoveHost { name } => self.remove_host(name),
            ConfigAction::ShowHost { name } => self.show_host(name),
            ConfigAction::Validate { name } => self.validate_hosts(name.as_deref()),
        }
    }

    fn show_config(&self) -> Result<()> {
        let config = Config::load()?;
        let yaml = serde_yaml::to_string(&config)?;
        println!("{}", yaml);
        Ok(())
    }

    fn show_path(&self) -> Result<()> {
        match Config::default_path() {
            Some(path) => {
                println!("Configuration file path: {}", path.display());
                if path.exists() {
                    println!("Status: File exists");
                } else {
                    println!("Status: File does not exist");
                }
            }
            None => {
                println!("Could not determine configuration directory");
            }
        }

        Ok(())
    }

    fn list_hosts(&self) -> Result<()> {
        let config = Config::load()?;

        if config.hosts.is_empty() {
            println!("No hosts configured.");
            return Ok(());
        }

        println!("Configured hosts:");
        for name in config.host_names() {
            if let Some(host) = config.get_host(name) {
                println!("  {} - {}", name, host.connection_string());
            }
        }

        Ok(())
    }

    fn add_host(&self, name: &str, host: HostConfig) -> Result<()> {
        let mut config = Config::load()?;

        if config.get_host(name).is_some() {
            println!("Warning: Host '{}' already exists, updating...", name);
        }

        config.set_host(name.to_string(), host);
        config.save()?;

        println!("Added host '{}'", name);
        if let Some(path) = Config::default_path() {
            println!("Configuration saved to: {}", path.display());
        }

        Ok(())
    }

    fn remove_host(&self, name: &str) -> Result<()> {
        let mut config = Config::load()?;

        if config.remove_host(name).is_some() {
            config.save()?;
            println!("Removed host '{}'", name);
        } else {
            println!("Host '{}' not found", name);
        }

        Ok(())
    }

    fn show_host(&self, name: &str) -> Result<()> {
        let config = Config::load()?;

        match config.get_host(name) {
            Some(host) => {
                println!("Host: {}", name);
                println!("  Host name: {}", host.host);
                println!(
                    "  Address: {}",
                    host.ipaddr.as_deref().unwrap_or("(resolved)")
                );
                println!(
                    "  User: {}",
                    host.user.as_deref().unwrap_or("(from SSH config)")
                );
                match host.port {
                    Some(port) => println!("  Port: {}", port),
                    None => println!("  Port: (from SSH config)"),
                }
                println!(
                    "  SSH key: {}",
                    host.ssh_key.as_deref().unwrap_or("(from SSH config)")
                );
                println!("  Timeout: {}s", host.timeout);
                println!();
                println!("Connection string: {}", host.connection_string());
            }
            None => {
                println!("Host '{}' not found", name);
            }
        }

        Ok(())
    }

    fn validate_hosts(&self, name: Option<&str>) -> Result<()> {
        let config = Config::load()?;

        let names: Vec<String> = match name {
            Some(n) if config.get_host(n).is_some() => vec![n.to_string()],
            Some(n) => {
                println!("Host '{}' not found", n);
                return Ok(());
            }
            None => config.host_names().into_iter().cloned().collect(),
        };

        if names.is_empty() {
            println!("No hosts configured to validate.");
            return Ok(());
        }

        println!("Validating {} host(s)...", names.len());
        println!();

        let mut success_count = 0;
        let mut failure_count = 0;

        for name in &names {
            let Some(host) = config.get_host(name) else {
                continue;
            };
            print!("  {} ({})... ", name, host.connection_string());

            let result = get_pman_with(Some(host), &config.defaults).and_then(|pman| {
                let result = pman.run_verify(&Command::new("true"), &RunOptions::default());
                pman.close();
                result
            });
            match result {
                Ok(_) => {
                    println!("✓ OK");
                    success_count += 1;
                }
                Err(e) => {
                    println!("✗ {}", e);
                    failure_count += 1;
                }
            }
        }

        println!();
        println!(
            "Results: {} passed, {} failed",
            success_count, failure_count
        );

        Ok(())
    }
}
