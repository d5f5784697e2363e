use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "plexus", about = "Provider routing and plugin lifecycle host")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved routing table
    Routes(commands::routes::RoutesArgs),
    /// Resolve the shard key and owner of an event
    Shard(commands::shard::ShardArgs),
    /// Load and activate plugins until Ctrl-C
    Run(commands::run::RunArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = config::ConfigLoader::load()?;

    match cli.command {
        Commands::Routes(args) => commands::routes::run(args, &config),
        Commands::Shard(args) => commands::shard::run(args, &config),
        Commands::Run(args) => commands::run::run(args, &config).await,
    }
}
