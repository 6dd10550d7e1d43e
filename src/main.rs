use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod db;
mod metrics;
mod models;
mod services;
mod utils;
mod websocket;

use crate::config::AppConfig;
use crate::db::Database;
use crate::services::assets::AssetLedger;
use crate::services::events::EventPublisher;
use crate::services::fees::FeeSchedule;
use crate::services::flusher::StoreSyncWorker;
use crate::services::history::TradeHistory;
use crate::services::matching::{EngineConfig, MatchingEngine};
use crate::services::orders::OrderStore;
use crate::services::sequence::IdAllocator;
use crate::services::ticker::TickerService;
use crate::services::writeback::WriteQueue;

/// Trades retained in memory per symbol for runtime queries.
const TRADE_HISTORY_CAPACITY: usize = 10_000;

pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub engine: Arc<MatchingEngine>,
    pub ledger: Arc<AssetLedger>,
    pub orders: Arc<OrderStore>,
    pub ticker: Arc<TickerService>,
    pub history: Arc<TradeHistory>,
    pub events: Arc<EventPublisher>,
    pub metrics: PrometheusHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spot_exchange_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting spot exchange backend v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.environment);

    let metrics_handle = metrics::init_metrics();

    // Initialize database
    let db = Database::connect(&config.database_url).await?;
    tracing::info!("Database connected");

    // Build the in-memory authoritative tier.
    let queue = Arc::new(WriteQueue::new(config.batch_size * 64));
    let events = Arc::new(EventPublisher::new(config.event_queue_depth));
    let ledger = Arc::new(AssetLedger::new(Arc::clone(&queue), Arc::clone(&events)));
    let orders = Arc::new(OrderStore::new(Arc::clone(&queue)));
    let ids = Arc::new(IdAllocator::new());
    let fees = Arc::new(FeeSchedule::new(config.default_fee_rate));
    let ticker = Arc::new(TickerService::new());
    let history = Arc::new(TradeHistory::new(TRADE_HISTORY_CAPACITY));

    let engine = Arc::new(MatchingEngine::new(
        Arc::clone(&ledger),
        Arc::clone(&orders),
        Arc::clone(&ids),
        Arc::clone(&fees),
        Arc::clone(&events),
        Arc::clone(&queue),
        Arc::clone(&ticker),
        Arc::clone(&history),
        EngineConfig {
            market_maker_user_id: config.market_maker_user_id,
            market_buy_collateral_margin: config.market_buy_collateral_margin,
        },
    ));

    // Rebuild state from the durable store before accepting traffic.
    let supported = config.get_supported_symbols();
    let summary = services::recovery::load(
        &db.pool,
        &supported,
        &engine,
        &ledger,
        &orders,
        &ids,
    )
    .await?;
    if summary.open_orders > 0 {
        tracing::info!("Recovered {} open orders to their books", summary.open_orders);
    } else {
        tracing::info!("No open orders to recover");
    }

    if let Some(market_maker) = config.market_maker_user_id {
        tracing::info!(
            "Market maker account {} exempt from self-trade prevention",
            market_maker
        );
    }

    // Start the durable-store sync worker.
    StoreSyncWorker::new(
        db.pool.clone(),
        Arc::clone(&queue),
        Arc::clone(&orders),
        Arc::clone(&ledger),
        config.flush_interval_ms,
        config.batch_size,
    )
    .spawn();
    tracing::info!(
        "Store sync worker spawned (every {}ms, batches of {})",
        config.flush_interval_ms,
        config.batch_size
    );

    // Build application state
    let port = config.port;
    let state = Arc::new(AppState {
        config,
        db,
        engine,
        ledger,
        orders,
        ticker,
        history,
        events,
        metrics: metrics_handle,
    });

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .nest("/api/v1", api::routes::create_router(state.clone()))
        .nest("/ws", websocket::routes::create_router(state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Recovery finished; only now does the front door open.
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "environment": state.config.environment,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.render()
}
