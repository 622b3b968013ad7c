//! Lagoon binary entry point

use lagoon::data::Store;
use lagoon::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Interval between counter reconciliation passes.
const RECONCILE_INTERVAL_SECS: u64 = 3600;

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState
/// 4. Build Axum router
/// 5. Start HTTP server
/// 6. Start background tasks (counter reconciliation)
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("LAGOON__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "lagoon=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "lagoon=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting Lagoon...");

    // 2. Initialize metrics
    lagoon::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Configuration loaded"
    );

    // 4. Initialize application state
    let state = AppState::new(config.clone()).await?;

    // 5. Build Axum router
    let app = lagoon::build_router(state.clone());

    // 6. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    // 7. Start background tasks
    spawn_reconciliation_task(state);

    // Start server
    axum::serve(listener, app).await?;

    Ok(())
}

/// Spawn the periodic counter reconciliation task.
///
/// Denormalized counters are maintained transactionally at each state
/// transition; this pass recomputes them from edge tables to correct any
/// drift.
fn spawn_reconciliation_task(state: AppState) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(RECONCILE_INTERVAL_SECS));

        // Consume the immediate first tick so the first pass runs one
        // interval after startup.
        interval.tick().await;

        loop {
            interval.tick().await;

            match state.store.reconcile_counters().await {
                Ok(report) => {
                    if report.actors_adjusted > 0 || report.statuses_adjusted > 0 {
                        tracing::info!(
                            actors = report.actors_adjusted,
                            statuses = report.statuses_adjusted,
                            "Counter reconciliation corrected drift"
                        );
                    }
                }
                Err(error) => {
                    tracing::error!(%error, "Counter reconciliation failed");
                }
            }
        }
    });

    tracing::info!("Reconciliation task spawned");
}
