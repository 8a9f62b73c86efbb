use std::path::PathBuf;

use clap::{Parser, Subcommand};
use plugin_host::{
    app::{run_master, run_worker},
    config::{HostConfig, load_env_file},
};
use tokio::runtime::Builder;

#[derive(Parser, Debug)]
#[command(
    name = "plugin-host",
    about = "Runs a pool of plugin workers behind one port",
    version
)]
struct Cli {
    /// Optional .env file loaded before the environment is read
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    #[command(flatten)]
    config: HostConfig,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Supervise the worker pool (default)
    Master,

    /// Serve requests; started by the master, one per slot
    Worker {
        #[arg(long)]
        slot: usize,
    },
}

fn main() -> anyhow::Result<()> {
    // .env must be in the environment before clap reads the env fallbacks
    load_env_file(&env_file_arg(std::env::args()));

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Master) {
        Commands::Master => Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(run_master(cli.config)),
        // requests are served cooperatively on one thread per worker process
        Commands::Worker { slot } => Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(run_worker(cli.config, slot)),
    }
}

/// `--env-file <path>` or `--env-file=<path>`, else `.env`.
fn env_file_arg(args: impl IntoIterator<Item = String>) -> PathBuf {
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--env-file" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        } else if let Some(path) = arg.strip_prefix("--env-file=") {
            return PathBuf::from(path);
        }
    }
    PathBuf::from(".env")
}
