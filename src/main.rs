//! vigil - log-driven incident detection and remediation
//!
//! Watches Railway-hosted services through streaming log subscriptions,
//! classifies failures into deduplicated incidents, alerts a Slack channel
//! with interactive controls, and drives approved remediations back
//! against the platform.

mod api;
mod broker;
mod config;
mod conversation;
mod db;
mod detector;
mod events;
mod llm;
mod railway;
mod remediation;
mod retention;
mod slack;
mod stream;
mod telemetry;

use api::{create_router, AppState};
use broker::Broker;
use config::Config;
use conversation::ConversationManager;
use db::Database;
use detector::{Detector, IngestBus};
use llm::AnalystRegistry;
use railway::RailwayClient;
use remediation::RemediationCoordinator;
use slack::SlackNotifier;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stream::{SubscriptionSettings, SubscriptionSupervisor};
use telemetry::Telemetry;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Capacity of each per-service ingest queue
const INGEST_CAPACITY: usize = 1_000;
/// Grace period before subscriptions start, letting the database and
/// network come up
const STARTUP_DEFERRAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil=info,tower_http=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Arc::new(Config::from_env()?);
    tracing::info!(
        mode = ?config.mode,
        railway = config.railway.enabled(),
        slack = config.slack.enabled(),
        llm = config.llm.enabled(),
        "configuration loaded"
    );

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(path = %config.db_path, "opening database");
    let db = Database::open(&config.db_path)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let telemetry = Telemetry::new();
    let broker = Arc::new(Broker::new());
    let analysts = Arc::new(AnalystRegistry::new(&config.llm));
    if analysts.has_analysts() {
        tracing::info!(providers = ?analysts.available(), "LLM analysts initialized");
    } else {
        tracing::warn!("no LLM API keys configured; detector runs on patterns only");
    }

    let railway = Arc::new(RailwayClient::new(
        config.railway.api_token.clone(),
        config.perf.rate_limit_per_second,
        config.perf.rate_limit_per_hour,
    ));
    let notifier = SlackNotifier::new(&config.slack, telemetry.clone());
    if !notifier.is_configured() {
        tracing::warn!("Slack not configured; alerts degrade to no-ops");
    }

    let ingest = IngestBus::new(INGEST_CAPACITY);
    let supervisor = SubscriptionSupervisor::new(
        SubscriptionSettings::new(
            config.railway.api_token.clone().unwrap_or_default(),
            &config.perf,
        ),
        ingest.clone(),
        config.perf.max_retry_attempts,
        shutdown_rx.clone(),
    );

    let conversations = ConversationManager::new(
        db.clone(),
        broker.clone(),
        railway.clone(),
        analysts.clone(),
        telemetry.clone(),
        config.railway.projects.first().cloned(),
    );

    // Background tasks
    tokio::spawn(telemetry.clone().run(broker.clone(), shutdown_rx.clone()));
    tokio::spawn(notifier.clone().run(broker.clone(), shutdown_rx.clone()));
    tokio::spawn(conversations.clone().run(shutdown_rx.clone()));
    tokio::spawn(retention::run(
        db.clone(),
        config.perf.retention_days,
        config.perf.buffer_retention_hours,
        shutdown_rx.clone(),
    ));

    let detector = Detector::new(
        db.clone(),
        broker.clone(),
        analysts.clone(),
        telemetry.clone(),
        ingest.clone(),
        config.perf.batch_window_min,
    );
    tokio::spawn(detector.run(shutdown_rx.clone()));

    let coordinator = RemediationCoordinator::new(
        db.clone(),
        broker.clone(),
        railway.clone(),
        telemetry.clone(),
        &config,
        shutdown_rx.clone(),
    );
    tokio::spawn(coordinator.run());

    // Subscriptions start after a short deferral so a slow database or
    // DNS does not burn retry budget at boot.
    if config.railway.enabled() {
        let supervisor = supervisor.clone();
        let targets = stream::expand_targets(&config.railway);
        tokio::spawn(async move {
            tokio::time::sleep(STARTUP_DEFERRAL).await;
            for target in targets {
                let key = target.key();
                if let Err(e) = supervisor.start(target).await {
                    tracing::error!(target = %key, error = %e, "subscription start failed");
                }
            }
        });
    } else {
        tracing::warn!("Railway not configured; no log subscriptions will start");
    }

    let state = AppState {
        config: config.clone(),
        db,
        broker,
        railway,
        analysts,
        notifier,
        telemetry,
        supervisor,
        conversations,
        ingest,
        http: reqwest::Client::new(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = create_router(state).layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "vigil listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            // Give tasks a beat to flush and send complete frames.
            tokio::time::sleep(Duration::from_secs(2)).await;
        })
        .await?;

    Ok(())
}
