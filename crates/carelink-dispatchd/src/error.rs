//! Error types for the dispatch daemon.
//!
//! [`DaemonError`] wraps every failure that can stop the daemon during
//! startup or while serving.

/// Top-level error for the dispatch daemon.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: carelink_core::ConfigError,
    },

    /// The store could not be opened or migrated.
    #[error("store error: {source}")]
    Store {
        /// The underlying database error.
        #[from]
        source: carelink_db::DbError,
    },

    /// The distance collaborator could not be built.
    #[error("distance error: {source}")]
    Distance {
        /// The underlying distance error.
        #[from]
        source: carelink_core::distance::DistanceError,
    },

    /// The offline notifier could not be built.
    #[error("notifier error: {source}")]
    Notifier {
        /// The underlying notifier error.
        #[from]
        source: carelink_core::notify::NotifyError,
    },

    /// Re-arming pending requests failed.
    #[error("dispatch error: {source}")]
    Dispatch {
        /// The underlying dispatch error.
        #[from]
        source: carelink_core::DispatchError,
    },

    /// The HTTP server failed to bind or serve.
    #[error("server error: {source}")]
    Server {
        /// The underlying server error.
        #[from]
        source: carelink_server::ServerError,
    },
}
