use anyhow::Result;
use clap::{Parser, Subcommand};
use hindsight::{config, protocol};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hindsight", version, about = "Durable event streams with memory recall")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server
    Serve,
    /// Print store statistics as JSON
    Stats {
        /// Restrict counts to one memory bank
        #[arg(long)]
        bank: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::HindsightConfig::load()?;

    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => {
            protocol::serve(config).await?;
        }
        Command::Stats { bank } => {
            let state = protocol::build_state(config)?;
            let stats = state.memory.stats(bank.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
