//! HTTP and `WebSocket` surface for the CareLink dispatch service.
//!
//! This crate provides an Axum server that exposes:
//!
//! - **REST endpoints** for profiles, requests and sessions, authenticated
//!   with bearer JWTs
//! - **`WebSocket` endpoint** (`/ws`) speaking the tagged JSON protocol of
//!   [`carelink_types::ClientMessage`] and [`carelink_types::ServerMessage`]
//! - **Event relay** that routes dispatch events to the affected parties'
//!   live connections, falling back to offline push for offers and
//!   acceptances
//!
//! # Modules
//!
//! - [`auth`] -- Token issue/verify and the [`Caller`](auth::Caller) extractor
//! - [`error`] -- [`ApiError`] and its HTTP mapping
//! - [`handlers`] -- REST handlers
//! - [`relay`] -- Bus to connection routing
//! - [`router`] -- Route table
//! - [`server`] -- Bind and serve
//! - [`state`] -- Shared [`AppState`]
//! - [`ws`] -- Socket protocol

pub mod auth;
pub mod error;
pub mod handlers;
pub mod relay;
pub mod router;
pub mod server;
pub mod state;
pub mod ws;

// Re-export primary types for convenience.
pub use auth::TokenService;
pub use error::ApiError;
pub use relay::{spawn_relay, spawn_relay_and_resume};
pub use router::build_router;
pub use server::{ServerError, start_server};
pub use state::AppState;
