//! Attune CLI — the main entry point.
//!
//! Commands:
//! - `onboard` — Initialize config
//! - `serve`   — Start the HTTP gateway
//! - `sweep`   — Remove expired conversation ledgers

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "attune",
    about = "Attune — context assembly and feedback learning for conversational agents",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration
    Onboard,

    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Physically remove expired conversation ledgers
    Sweep,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Onboard => commands::onboard::run().await?,
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Sweep => commands::sweep::run().await?,
    }

    Ok(())
}
