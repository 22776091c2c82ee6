use anyhow::Result;
use clap::Parser;
use pollen_core::HexGroup;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pollen-cli")]
#[command(about = "Sync the Pollen explorer into Postgres")]
struct Cli {
    /// Comma-separated H3 cell ids bounding an area to sync; repeat for more areas.
    hex_groups: Vec<HexGroup>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging();

    match pollen_sync::run_sync_once_from_env(&cli.hex_groups).await {
        Ok(summary) => {
            info!(
                run_id = %summary.run_id,
                flowers = summary.flowers,
                rewards = summary.rewards,
                hexes = summary.hexes,
                hex_groups = summary.hex_groups,
                "sync complete"
            );
            Ok(())
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "sync failed");
            Err(err)
        }
    }
}
