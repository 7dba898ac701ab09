use anyhow::Result;
use clap::{Parser, Subcommand};

mod cli;

use cli::config::ConfigCommand;
use cli::file::{CatCommand, WriteCommand};
use cli::run::RunCommand;
use cli::transfer::{GetCommand, PutCommand, RsyncCommand};
use cli::which::WhichCommand;
use cli::HostArgs;

#[derive(Parser)]
#[command(name = "hostexec")]
#[command(about = "Run commands and access files on the local host or on a remote host over SSH", long_about = None)]
struct Cli {
    #[command(flatten)]
    host: HostArgs,

    #[arg(short, long, global = true, help = "Print debug messages")]
    debug: bool,

    #[arg(
        short,
        long,
        global = true,
        conflicts_with = "debug",
        help = "Print only warnings and errors"
    )]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run(RunCommand),
    Which(WhichCommand),
    Cat(CatCommand),
    Write(WriteCommand),
    Get(GetCommand),
    Put(PutCommand),
    Rsync(RsyncCommand),
    Config(ConfigCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Run(cmd) => cmd.execute(&cli.host),
        Commands::Which(cmd) => cmd.execute(&cli.host),
        Commands::Cat(cmd) => cmd.execute(&cli.host),
        Commands::Write(cmd) => cmd.execute(&cli.host),
        Commands::Get(cmd) => cmd.execute(&cli.host),
        Commands::Put(cmd) => cmd.execute(&cli.host),
        Commands::Rsync(cmd) => cmd.execute(&cli.host),
        Commands::Config(cmd) => cmd.execute(),
    }
}
