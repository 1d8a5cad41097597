use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

#[derive(Parser)]
#[command(
    name = "offload",
    version,
    about = "GPU offload runner for Game of Life and SHA-256 password search"
)]
struct Cli {
    /// Configuration file (defaults to ./offload.toml when present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Advance a Game of Life grid by a number of generations
    Life(cli::life::LifeArgs),
    /// Search a password list for the preimage of a SHA-256 digest
    Crack(cli::crack::CrackArgs),
}

fn init_logging(verbose: bool) {
    let default = if verbose { "offload=debug" } else { "offload=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Life(args) => cli::life::cmd_life(args, cli.config.as_deref()),
        Command::Crack(args) => cli::crack::cmd_crack(args, cli.config.as_deref()),
    }
}
