use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use fluxblox::admin::{AdminService, TokenVerifier};
use fluxblox::api::{self, ApiState};
use fluxblox::apps::{LoggingLifecycle, StaticPriceSchedule};
use fluxblox::config::Settings;
use fluxblox::daemon::JsonRpcDaemon;
use fluxblox::db_handles::DbHandles;
use fluxblox::metrics;
use fluxblox::store::IndexStore;
use fluxblox::sync::{PassOptions, SyncContext};
use fluxblox::telemetry::{init_tracing, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "fluxblox", about = "Block sync and indexing service")]
struct Args {
    /// Path to the TOML config file
    #[arg(long)]
    config: Option<String>,

    /// Drop all derived collections and index from genesis
    #[arg(long)]
    reindex: bool,

    /// Do not serve the HTTP API
    #[arg(long)]
    no_api: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;

    // Held until exit so the file writer flushes
    let _log_guard = init_tracing(TelemetryConfig::default())?;
    metrics::init_metrics()?;

    info!(db = %settings.db.path, insight = settings.sync.insight, "Starting fluxblox");

    let handles = DbHandles::open(&settings.db.path)?;
    let store = Arc::new(IndexStore::new(handles, settings.sync.address_bucket_capacity));
    let daemon = Arc::new(JsonRpcDaemon::new(&settings.daemon)?);
    let prices = Arc::new(StaticPriceSchedule::new(settings.apps.price_intervals.clone()));

    let ctx = SyncContext {
        store: store.clone(),
        daemon,
        prices,
        lifecycle: Arc::new(LoggingLifecycle),
        settings: settings.clone(),
    };
    let admin = Arc::new(AdminService::new(ctx));

    if args.reindex {
        admin.reindex(true).await?;
    } else {
        admin
            .start(PassOptions::startup(settings.sync.deep_restore_on_start))
            .await;
    }

    if settings.api.enabled && !args.no_api {
        if settings.api.admin_token.is_empty() {
            warn!("No admin token configured, admin routes will reject every request");
        }
        let state = Arc::new(ApiState {
            store,
            admin: admin.clone(),
            verifier: Arc::new(TokenVerifier::new(settings.api.admin_token.clone())),
            insight: settings.sync.insight,
        });
        let listener = tokio::net::TcpListener::bind(&settings.api.bind).await?;
        info!(bind = %settings.api.bind, "API listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, api::router(state)).await {
                error!(error = %e, "API server stopped");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    admin.stop().await;
    Ok(())
}
