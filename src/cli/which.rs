use anyhow::Result;
use clap::Args;

use super::HostArgs;

#[derive(Args)]
#[command(about = "Print the full path of a tool on the host")]
pub struct WhichCommand {
    #[arg(required = true, help = "Names of the tools")]
    tools: Vec<String>,
}

impl WhichCommand {
    pub fn execute(self, host: &HostArgs) -> Result<()> {
        let target = host.connect()?;
        for tool in &self.tools {
            let path = target.pman.which(tool)?;
            println!("{}", path.display());
        }
        Ok(())
    }
}
