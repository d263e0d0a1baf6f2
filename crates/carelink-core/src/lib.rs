//! Dispatch and session coordination for the CareLink service.
//!
//! This crate owns everything between the transport and the store: who is
//! connected, who may be offered a request, the request state machine, the
//! hot session cache and the event stream the transport relays to clients.
//! It performs no socket or HTTP handling of its own, apart from the
//! outbound distance and notification collaborators.
//!
//! # Architecture
//!
//! ```text
//! REST / WebSocket handlers
//!     |
//!     +-- DispatchCoordinator --+-- CandidateSelector --> DistanceProvider
//!     |                         |-- PendingIndex + ReofferTimers
//!     |                         +-- SessionStore -------> Store (carelink-db)
//!     |
//!     +-- EventBus  ---> relay ---> PresenceRegistry ---> connection
//!                                      \-- offline --> Notifier
//! ```
//!
//! # Modules
//!
//! - [`bus`] -- Topic-filtered broadcast of dispatch events ([`EventBus`])
//! - [`candidates`] -- Distance filtering, pricing and ranking ([`CandidateSelector`])
//! - [`config`] -- Configuration loading from `carelink-config.yaml` ([`DispatchConfig`])
//! - [`dispatch`] -- Request lifecycle and session transitions ([`DispatchCoordinator`])
//! - [`distance`] -- Haversine or routed distance lookups ([`DistanceProvider`])
//! - [`error`] -- Error type for every core operation ([`DispatchError`])
//! - [`locks`] -- Per-key async locks
//! - [`notify`] -- Webhook push for offline parties ([`Notifier`])
//! - [`pending`] -- Requests waiting for a provider, with their open offers
//! - [`presence`] -- Party to live connection mapping ([`PresenceRegistry`])
//! - [`sessions`] -- Write-through session cache ([`SessionStore`])
//! - [`timers`] -- Cancellable per-request offer windows

pub mod bus;
pub mod candidates;
pub mod config;
pub mod dispatch;
pub mod distance;
pub mod error;
pub mod locks;
pub mod notify;
pub mod pending;
pub mod presence;
pub mod sessions;
pub mod timers;

pub use bus::{DispatchEvent, EventBus, Subscription, Topic, TopicFilter};
pub use candidates::CandidateSelector;
pub use config::{ConfigError, DispatchConfig};
pub use dispatch::{DispatchCoordinator, LocationOutcome, RejectOutcome};
pub use distance::DistanceProvider;
pub use error::DispatchError;
pub use notify::{Notifier, OfflineNotice};
pub use presence::{ConnectionHandle, Delivery, PresenceRegistry};
pub use sessions::SessionStore;
