use anyhow::{Context, Result};
use clap::Args;
use hostexec::{Command, Error, RunOptions};
use std::io::Write;
use std::path::PathBuf;

use super::HostArgs;

#[derive(Args)]
#[command(about = "Run a command on the host")]
pub struct RunCommand {
    #[arg(short = 'C', long, help = "Directory to run the command in")]
    cwd: Option<PathBuf>,

    #[arg(long, help = "Run in a new session rather than in the interactive shell")]
    no_fast_path: bool,

    #[arg(long, help = "Merge standard error into standard output")]
    combine: bool,

    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        help = "The command, interpreted by the shell on the host"
    )]
    command: Vec<String>,
}

impl RunCommand {
    fn to_command(&self) -> Result<Command> {
        // The command line is run via 'exec', so shell syntax needs a shell of its own.
        let script = self.command.join(" ");
        let quoted = shlex::try_quote(&script).context("cannot quote the command")?;
        let mut cmd = Command::new(format!("sh -c {}", quoted));
        if let Some(cwd) = &self.cwd {
            cmd = cmd.cwd(cwd);
        }
        if self.no_fast_path {
            cmd = cmd.fast_path(false);
        }
        Ok(cmd)
    }

    pub fn execute(self, host: &HostArgs) -> Result<()> {
        let target = host.connect()?;
        let cmd = self.to_command()?;

        let mut opts = RunOptions::default().with_combined_streams(self.combine);
        if let Some(timeout) = target.timeout {
            opts = opts.with_timeout(timeout);
        }

        let result = match target.pman.run(&cmd, &opts) {
            Ok(result) => result,
            Err(Error::Timeout {
                message,
                stdout,
                stderr,
            }) => {
                print!("{}", stdout);
                eprint!("{}", stderr);
                anyhow::bail!(message);
            }
            Err(e) => return Err(e.into()),
        };

        print!("{}", result.stdout);
        eprint!("{}", result.stderr);
        std::io::stdout().flush()?;

        if result.exit_code != 0 {
            log::debug!("command exited with status {}", result.exit_code);
            drop(target);
            std::process::exit(result.exit_code);
        }
        Ok(())
    }
}
