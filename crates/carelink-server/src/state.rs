//! Shared application state for the HTTP surface.
//!
//! [`AppState`] bundles the dispatch core with the connection registry,
//! the token service and the offline notifier. It is wrapped in [`Arc`]
//! and injected through Axum's `State` extractor.
//!
//! [`Arc`]: std::sync::Arc

use carelink_core::{DispatchCoordinator, Notifier, PresenceRegistry};
use chrono::{DateTime, Utc};

use crate::auth::TokenService;

/// Shared state for the Axum application.
#[derive(Clone)]
pub struct AppState {
    /// Request and session lifecycles.
    pub dispatch: DispatchCoordinator,
    /// Live socket connections by party.
    pub presence: PresenceRegistry,
    /// Bearer token verification.
    pub tokens: TokenService,
    /// Push channel for parties without a live connection.
    pub notifier: Notifier,
    /// When the server started.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Create state around an existing coordinator.
    pub fn new(dispatch: DispatchCoordinator, tokens: TokenService, notifier: Notifier) -> Self {
        Self {
            dispatch,
            presence: PresenceRegistry::new(),
            tokens,
            notifier,
            started_at: Utc::now(),
        }
    }
}
