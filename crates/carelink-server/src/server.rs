//! HTTP listener lifecycle.
//!
//! [`bind`] resolves the configured host and opens the listener; [`serve`]
//! runs the router on it until the process exits. [`start_server`] does
//! both. Binding separately lets callers learn the real port when the
//! config asks for port 0.

use std::net::SocketAddr;
use std::sync::Arc;

use carelink_core::config::HttpConfig;
use tokio::net::TcpListener;
use tracing::info;

use crate::router::build_router;
use crate::state::AppState;

/// Open a listener on `host:port`. Host names are resolved.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] if the host does not resolve or the port
/// is taken.
pub async fn bind(config: &HttpConfig) -> Result<(TcpListener, SocketAddr), ServerError> {
    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .map_err(|e| ServerError::Bind(format!("{}:{}: {e}", config.host, config.port)))?;
    let addr = listener
        .local_addr()
        .map_err(|e| ServerError::Bind(format!("no local address: {e}")))?;
    Ok((listener, addr))
}

/// Serve REST and `WebSocket` traffic on an open listener.
///
/// # Errors
///
/// Returns [`ServerError::Serve`] on a fatal I/O error.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<(), ServerError> {
    axum::serve(listener, build_router(state))
        .await
        .map_err(|e| ServerError::Serve(e.to_string()))
}

/// Bind the configured address and serve on it.
///
/// # Errors
///
/// See [`bind`] and [`serve`].
pub async fn start_server(config: &HttpConfig, state: Arc<AppState>) -> Result<(), ServerError> {
    let (listener, addr) = bind(config).await?;
    info!(%addr, "CareLink dispatch listening");
    serve(listener, state).await
}

/// Errors from starting or running the listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The address could not be bound.
    #[error("bind error: {0}")]
    Bind(String),

    /// The listener failed while serving.
    #[error("serve error: {0}")]
    Serve(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use carelink_core::config::MatchingConfig;
    use carelink_core::{DispatchCoordinator, DistanceProvider, EventBus, Notifier};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::auth::TokenService;

    #[tokio::test]
    async fn serves_health_on_an_ephemeral_port() {
        let config = HttpConfig {
            host: String::from("127.0.0.1"),
            port: 0,
        };
        let (listener, addr) = bind(&config).await.unwrap();
        assert_ne!(addr.port(), 0);

        let state = Arc::new(AppState::new(
            DispatchCoordinator::new(
                carelink_db::Store::memory(),
                DistanceProvider::Haversine,
                EventBus::default(),
                MatchingConfig::default(),
            ),
            TokenService::new("secret", "carelink"),
            Notifier::Disabled,
        ));
        let server = tokio::spawn(serve(listener, state));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""store":"memory""#));

        server.abort();
    }

    #[tokio::test]
    async fn taken_port_is_a_bind_error() {
        let first = HttpConfig {
            host: String::from("127.0.0.1"),
            port: 0,
        };
        let (_held, addr) = bind(&first).await.unwrap();
        let second = HttpConfig {
            host: String::from("127.0.0.1"),
            port: addr.port(),
        };
        assert!(matches!(bind(&second).await, Err(ServerError::Bind(_))));
    }
}
