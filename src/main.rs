use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use settlement_core::cli::{self, Cli, Commands, DbCommands, Runtime, TxCommands, WorkerCommands};
use settlement_core::config::Config;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn connect() -> anyhow::Result<Runtime> {
    Runtime::connect(Config::load().await?).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Db(DbCommands::Migrate) => {
            let config = Config::from_env()?;
            cli::handle_db_migrate(&config).await
        }
        Commands::Config { check } => {
            let config = Config::load().await?;
            cli::handle_config_validate(&config, check).await
        }
        Commands::Serve => cli::handle_serve(connect().await?).await,
        Commands::Worker(WorkerCommands::BlockchainSettlement) => {
            cli::handle_worker_blockchain_settlement(connect().await?).await
        }
        Commands::Worker(WorkerCommands::Scheduler) => {
            cli::handle_worker_scheduler(connect().await?).await
        }
        Commands::Reconcile => cli::handle_reconcile(connect().await?).await,
        Commands::Tx(TxCommands::Settle { tx_id, outcome }) => {
            cli::handle_tx_settle(connect().await?, tx_id, outcome.into()).await
        }
    }
}
