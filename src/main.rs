use clap::{Parser, Subcommand};
use vault_pilot::app;
use vault_pilot::config::STRATEGY_ID_MORPHO_REBALANCER_MAINNET;

#[derive(Parser)]
#[command(name = "vault-pilot", about = "Automation control plane for on-chain vault rebalancing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the subscription sync scheduler
    Scheduler,
    /// Runs the base workflow worker
    #[command(alias = "base")]
    BaseWorker,
    /// Runs the morpho strategy worker
    #[command(alias = "morpho")]
    MorphoWorker {
        #[arg(long, default_value = STRATEGY_ID_MORPHO_REBALANCER_MAINNET)]
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to `info` when `RUST_LOG` is unset or invalid to avoid a
    // silent startup.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Scheduler => app::scheduler::run().await,
        Command::BaseWorker => app::base_worker::run().await,
        Command::MorphoWorker { id } => app::morpho_worker::run(&id).await,
    }
}
