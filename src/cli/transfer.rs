use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use super::HostArgs;

#[derive(Args)]
#[command(about = "Copy a file or a directory from the host")]
pub struct GetCommand {
    #[arg(help = "Path on the host")]
    src: PathBuf,

    #[arg(help = "Local path")]
    dst: PathBuf,
}

impl GetCommand {
    pub fn execute(self, host: &HostArgs) -> Result<()> {
        let target = host.connect()?;
        target.pman.get(&self.src, &self.dst)?;
        Ok(())
    }
}

#[derive(Args)]
#[command(about = "Copy a local file or directory to the host")]
pub struct PutCommand {
    #[arg(help = "Local path")]
    src: PathBuf,

    #[arg(help = "Path on the host")]
    dst: PathBuf,
}

impl PutCommand {
    pub fn execute(self, host: &HostArgs) -> Result<()> {
        let target = host.connect()?;
        target.pman.put(&self.src, &self.dst)?;
        Ok(())
    }
}

#[derive(Args)]
#[command(about = "Synchronize files between the local host and the host with rsync")]
pub struct RsyncCommand {
    #[arg(help = "Source path")]
    src: String,

    #[arg(help = "Destination path")]
    dst: String,

    #[arg(
        short,
        long,
        default_value = "-rlpD",
        allow_hyphen_values = true,
        help = "Options for rsync"
    )]
    opts: String,

    #[arg(long, help = "The source path is on the host")]
    remote_src: bool,

    #[arg(long, help = "The destination path is on the host")]
    remote_dst: bool,
}

impl RsyncCommand {
    pub fn execute(self, host: &HostArgs) -> Result<()> {
        let target = host.connect()?;
        target.pman.rsync(
            &self.src,
            &self.dst,
            &self.opts,
            self.remote_src,
            self.remote_dst,
        )?;
        Ok(())
    }
}
