mod commands;
mod config;
mod console;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "weaver")]
#[command(about = "Disposable QEMU machines for integration tests")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot a machine and attach to its console
    Run(commands::run::RunArgs),

    /// Show which host tools weaver found
    Backends(commands::backends::BackendsArgs),

    /// List host interfaces created by weaver
    Links(commands::links::LinksArgs),

    /// Delete host interfaces left behind by weaver processes that died
    Cleanup(commands::links::CleanupArgs),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => commands::run::run(args).await,
        Commands::Backends(args) => {
            commands::backends::run(args);
            Ok(())
        }
        Commands::Links(args) => commands::links::list(args).await,
        Commands::Cleanup(args) => commands::links::cleanup(args).await,
        Commands::Version => {
            println!("weaver {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
