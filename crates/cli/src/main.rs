//! Arbiter CLI — the main entry point.
//!
//! Commands:
//! - `init`    — Write a starter config file
//! - `ask`     — Answer a question through the full pipeline
//! - `routes`  — Show the routing decision for a query
//! - `tools`   — List the available tools
//! - `status`  — Show the effective configuration

use clap::{Parser, Subcommand};

mod bootstrap;
mod commands;

#[derive(Parser)]
#[command(
    name = "arbiter",
    about = "Arbiter — agentic retrieval-augmented answering",
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
    /// Write a starter configuration file
    Init,

    /// Answer a question
    Ask {
        /// The question to answer
        query: String,

        /// Stream the answer as it is generated
        #[arg(short, long)]
        stream: bool,

        /// Resume an existing session
        #[arg(long)]
        session: Option<String>,

        /// Print retrieval sources and conflicts after the answer
        #[arg(long)]
        sources: bool,
    },

    /// Show the routing decision for a query without answering it
    Routes {
        /// The query to classify
        query: String,
    },

    /// List available tools
    Tools,

    /// Show the effective configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Init => commands::init::run().await?,
        Commands::Ask {
            query,
            stream,
            session,
            sources,
        } => commands::ask::run(query, stream, session, sources).await?,
        Commands::Routes { query } => commands::routes::run(query).await?,
        Commands::Tools => commands::tools_cmd::run().await?,
        Commands::Status => commands::status::run().await?,
    }

    Ok(())
}
