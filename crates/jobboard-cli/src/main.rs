use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobboard_storage::JobStore;
use jobboard_sync::{
    seed_from_file, spawn_startup_fetch, start_scheduler, CategoryRegistry, FetchConfig,
    FetchOutcome, FetchPipeline,
};
use jobboard_web::{AppState, WebConfig};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobboard")]
#[command(about = "Policy internship job board: API server and fetch pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API with the fetch scheduler.
    Serve,
    /// Run one full provider fetch and exit.
    Fetch,
    /// Load sample postings into the store.
    Seed {
        #[arg(long, default_value = "fixtures/seed/sample_jobs.json")]
        file: PathBuf,
    },
    /// Create the schema if it does not exist yet.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await?,
        Commands::Fetch => match jobboard_sync::run_fetch_once_from_env().await? {
            FetchOutcome::Completed(report) => println!(
                "fetch complete: run_id={} requests={} fetched={} saved={} errors={}",
                report.run_id,
                report.requests_issued,
                report.postings_fetched,
                report.summary.saved,
                report.summary.errors
            ),
            FetchOutcome::AlreadyRunning => println!("fetch skipped: another run is active"),
        },
        Commands::Seed { file } => {
            let config = FetchConfig::from_env();
            let store = JobStore::open(&config.database_path).await?;
            let summary = seed_from_file(&store, &file).await;
            store.close().await;
            let summary = summary?;
            println!(
                "seed complete: file={} saved={} errors={}",
                file.display(),
                summary.saved,
                summary.errors
            );
        }
        Commands::Migrate => {
            let config = FetchConfig::from_env();
            let store = JobStore::open(&config.database_path).await?;
            store.close().await;
            println!("schema ready: {}", config.database_path.display());
        }
    }

    Ok(())
}

async fn serve() -> Result<()> {
    let fetch_config = FetchConfig::from_env();
    let web_config = WebConfig::from_env();
    let registry = Arc::new(CategoryRegistry::load(fetch_config.categories_file.as_deref()).await?);
    let store = JobStore::open(&fetch_config.database_path).await?;

    let mut state = AppState::new(store.clone(), registry.clone(), web_config);
    // Held for the lifetime of the server so scheduled jobs keep firing.
    let mut _scheduler = None;
    if fetch_config.fetching_enabled() {
        let pipeline = Arc::new(
            FetchPipeline::from_config(&fetch_config, store.clone(), registry)
                .context("building fetch pipeline")?,
        );
        if fetch_config.scheduler_enabled {
            _scheduler = Some(start_scheduler(pipeline.clone(), &fetch_config.fetch_cron).await?);
            spawn_startup_fetch(
                pipeline.clone(),
                Duration::from_secs(fetch_config.startup_delay_secs),
            );
        } else {
            info!("fetch scheduler disabled; manual trigger only");
        }
        state = state.with_pipeline(pipeline);
    } else {
        warn!("RAPIDAPI_KEY not set; job fetching disabled");
    }

    let result = jobboard_web::serve(state, shutdown_signal()).await;
    store.close().await;
    info!("job store closed");
    result
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
