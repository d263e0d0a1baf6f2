//! Durable store for the CareLink dispatch service.
//!
//! Requests and sessions are authoritative here. The dispatch core keeps a
//! hot copy of live sessions in memory and writes through to this crate
//! before any change becomes visible to subscribers.
//!
//! # Architecture
//!
//! ```text
//! Dispatch core
//!     |
//!     +-- Store (enum) ----+-- MemoryStore        (DashMap tables)
//!                          |
//!                          +-- PostgresPool
//!                              |-- PartyStore          (providers, requesters)
//!                              |-- RequestStore        (conditional status writes)
//!                              +-- SessionRecordStore  (JSONB history + chat)
//! ```
//!
//! # Modules
//!
//! - [`store`] -- Backend-neutral handle used by the core
//! - [`memory`] -- In-process tables with injectable write failures
//! - [`postgres`] -- `PostgreSQL` connection pool and configuration
//! - [`party_store`] -- Provider and requester records
//! - [`request_store`] -- Request records and compare-and-set
//! - [`session_store`] -- Session records and append-only sub-records
//! - [`error`] -- Shared error types

pub mod error;
pub mod memory;
pub mod party_store;
pub mod postgres;
pub mod request_store;
pub mod session_store;
pub mod store;

// Re-export primary types for convenience.
pub use error::DbError;
pub use memory::MemoryStore;
pub use party_store::{PartyStore, ProviderRow, RequesterRow};
pub use postgres::{PostgresConfig, PostgresPool};
pub use request_store::{RequestRow, RequestStore};
pub use session_store::{SessionRecordStore, SessionRow};
pub use store::Store;
