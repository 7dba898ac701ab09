use anyhow::Result;
use clap::Args;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use super::HostArgs;

#[derive(Args)]
#[command(about = "Print a file from the host")]
pub struct CatCommand {
    #[arg(help = "Path of the file on the host")]
    path: PathBuf,
}

impl CatCommand {
    pub fn execute(self, host: &HostArgs) -> Result<()> {
        let target = host.connect()?;
        let mut file = target.pman.open(&self.path, "rb")?;
        let data = file.read_bytes()?;

        let mut stdout = io::stdout().lock();
        stdout.write_all(&data)?;
        stdout.flush()?;
        Ok(())
    }
}

#[derive(Args)]
#[command(about = "Write standard input to a file on the host")]
pub struct WriteCommand {
    #[arg(help = "Path of the file on the host")]
    path: PathBuf,

    #[arg(short, long, help = "Append instead of overwriting")]
    append: bool,
}

impl WriteCommand {
    pub fn execute(self, host: &HostArgs) -> Result<()> {
        let mut data = Vec::new();
        io::stdin().lock().read_to_end(&mut data)?;

        let target = host.connect()?;
        let mode = if self.append { "ab" } else { "wb" };
        let mut file = target.pman.open(&self.path, mode)?;
        file.write_bytes(&data)?;
        log::info!(
            "wrote {} bytes to '{}'{}",
            data.len(),
            self.path.display(),
            target.pman.hostmsg()
        );
        Ok(())
    }
}
