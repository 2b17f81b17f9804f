use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use pos_sync_engine::{
    logging::{init_tracing, DEFAULT_FILTER},
    util::env as env_util,
    PosError, SyncConfig, SyncOptions,
};
use serde::Serialize;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pos_sync", version, about = "POS catalog/inventory sync and transform CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync one connection (or every active one) and transform the result
    Sync(SyncArgs),
    /// Tier counts and whether a connection needs a sync
    Status { connection_id: i64 },
    /// Tier-1 vs Tier-2 coverage for a restaurant
    Stats { restaurant_id: i64 },
    /// Check that Tier-2 covers at least 95% of Tier-1 items
    Validate { restaurant_id: i64 },
    /// Delete both tiers of provider data for a restaurant
    Clear {
        restaurant_id: i64,
        /// Required; clearing is not reversible
        #[arg(long, action = ArgAction::SetTrue)]
        yes: bool,
    },
    /// One lightweight upstream call to verify credentials
    Health { connection_id: i64 },
    /// Apply embedded migrations and exit
    Migrate,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Connection to sync; omit together with --all
    #[arg(required_unless_present = "all")]
    connection_id: Option<i64>,
    /// Sync every active connection concurrently
    #[arg(long, action = ArgAction::SetTrue, conflicts_with = "connection_id")]
    all: bool,
    /// Only pull catalog objects changed since the last sync
    #[arg(long, action = ArgAction::SetTrue)]
    incremental: bool,
    /// Map to Tier-2 without writing it
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,
    /// Clear existing data for the restaurant first
    #[arg(long = "clear", action = ArgAction::SetTrue)]
    clear_before_sync: bool,
    /// Skip the Tier-2 transform
    #[arg(long = "no-transform", action = ArgAction::SetTrue)]
    no_transform: bool,
    /// Also pull orders and transform their line items
    #[arg(long = "orders", action = ArgAction::SetTrue)]
    include_orders: bool,
}

impl SyncArgs {
    fn options(&self) -> SyncOptions {
        SyncOptions {
            incremental: self.incremental,
            dry_run: self.dry_run,
            clear_before_sync: self.clear_before_sync,
            transform: !self.no_transform,
            include_orders: self.include_orders,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    init_tracing(DEFAULT_FILTER)?;
    let cli = Cli::parse();
    env_util::preflight_check(
        "pos_sync",
        &[],
        &[
            "POS_SYNC_DATABASE_URL",
            "DATABASE_URL",
            "SQUARE_BASE_URL",
            "SQUARE_API_VERSION",
            "POS_SYNC_RATE_LIMIT_CAPACITY",
            "POS_SYNC_MAX_RETRIES",
        ],
    )?;

    let config = SyncConfig::from_env().context("invalid sync configuration")?;
    let db = config
        .connect_db()
        .await
        .context("failed to open sync database")?;
    db.migrate().await.context("failed to apply migrations")?;
    if matches!(cli.command, Command::Migrate) {
        info!("migrations applied");
        return Ok(());
    }
    let orch = config.build_orchestrator(db)?;

    let outcome = match cli.command {
        Command::Sync(args) if args.all => {
            let outcomes = orch.sync_all_active(args.options()).await?;
            print_json(&outcomes)
        }
        Command::Sync(args) => {
            let connection_id = args
                .connection_id
                .context("connection id required without --all")?;
            match orch.sync_and_transform(connection_id, args.options()).await {
                Ok(result) => print_json(&result),
                Err(e) => {
                    if let Some(partial) = e.sync_result() {
                        print_json(partial)?;
                    }
                    Err(e.into())
                }
            }
        }
        Command::Status { connection_id } => print_json(&orch.get_sync_status(connection_id).await?),
        Command::Stats { restaurant_id } => {
            print_json(&orch.get_transformation_stats(restaurant_id).await?)
        }
        Command::Validate { restaurant_id } => {
            print_json(&orch.validate_transformation(restaurant_id).await?)
        }
        Command::Clear { restaurant_id, yes } => {
            if !yes {
                return Err(PosError::Config("refusing to clear without --yes".into()).into());
            }
            print_json(&orch.clear_data(restaurant_id).await?)
        }
        Command::Health { connection_id } => print_json(&orch.health_check(connection_id).await?),
        Command::Migrate => Ok(()),
    };

    orch.teardown();
    if let Err(e) = &outcome {
        error!(error = %e, "pos_sync command failed");
    }
    outcome
}
