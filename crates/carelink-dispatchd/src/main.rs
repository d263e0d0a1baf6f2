//! Dispatch daemon for CareLink.
//!
//! Wires the durable store, the dispatch core, the event relay and the
//! HTTP/WebSocket surface together and serves until the listener fails.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `carelink-config.yaml` (or `CARELINK_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Open the store, running migrations for `PostgreSQL`
//! 4. Build the distance and offline-notification collaborators
//! 5. Create the dispatch coordinator
//! 6. Start the event relay, then re-arm pending requests
//! 7. Serve HTTP and `WebSocket` traffic

mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use carelink_core::config::{LogFormat, LoggingConfig, StoreBackend, StoreConfig};
use carelink_core::{DispatchConfig, DispatchCoordinator, DistanceProvider, EventBus, Notifier};
use carelink_db::{PostgresConfig, PostgresPool, Store};
use carelink_server::{AppState, TokenService, spawn_relay_and_resume, start_server};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::DaemonError;

/// Config file looked up in the working directory when `CARELINK_CONFIG`
/// is unset.
const DEFAULT_CONFIG_PATH: &str = "carelink-config.yaml";

/// Application entry point for the dispatch daemon.
///
/// # Errors
///
/// Returns an error if any startup step fails or the server stops.
#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    // 1. Load configuration.
    let config_path = std::env::var_os("CARELINK_CONFIG")
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let config = load_config(&config_path)?;

    // 2. Initialize structured logging.
    init_tracing(&config.logging);
    info!(
        config = %config_path.display(),
        host = config.server.host,
        port = config.server.port,
        "carelink-dispatchd starting"
    );

    // 3. Open the store.
    let store = open_store(&config.store).await?;
    info!(backend = store.backend(), "Store ready");

    // 4. Build collaborators.
    let distance = DistanceProvider::from_config(&config.distance)?;
    let notifier = Notifier::from_config(&config.notifications)?;
    info!(
        distance = ?config.distance.backend,
        offline_webhook = config.notifications.webhook_url.is_some(),
        "Collaborators configured"
    );

    // 5. Create the coordinator.
    let dispatch = DispatchCoordinator::new(
        store,
        distance,
        EventBus::default(),
        config.dispatch.clone(),
    );
    let tokens = TokenService::from_config(&config.auth);
    let state = Arc::new(AppState::new(dispatch, tokens, notifier));

    // 6. Start the event relay, then pick up requests left pending.
    let (_relay, resumed) = spawn_relay_and_resume(Arc::clone(&state)).await?;
    info!(
        resumed,
        max_distance_km = config.dispatch.max_distance_km,
        offer_window_ms = config.dispatch.offer_window_ms,
        "Dispatch coordinator initialized"
    );

    // 7. Serve until the listener fails.
    let served = start_server(&config.server, Arc::clone(&state)).await;
    state.dispatch.store().close().await;
    served?;

    info!("carelink-dispatchd shutdown complete");
    Ok(())
}

/// Load configuration from `path`, falling back to defaults when the file
/// is absent. Environment overrides apply either way.
fn load_config(path: &Path) -> Result<DispatchConfig, DaemonError> {
    if path.exists() {
        Ok(DispatchConfig::from_file(path)?)
    } else {
        let mut config = DispatchConfig::default();
        config.apply_env_overrides()?;
        Ok(config)
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    match logging.format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}

async fn open_store(config: &StoreConfig) -> Result<Store, DaemonError> {
    match config.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store, state is lost on restart");
            Ok(Store::memory())
        }
        StoreBackend::Postgres => {
            let pool = PostgresPool::connect(&PostgresConfig::new(
                &config.postgres_url,
                config.max_connections,
            ))
            .await?;
            pool.run_migrations().await?;
            Ok(Store::Postgres(pool))
        }
    }
}
