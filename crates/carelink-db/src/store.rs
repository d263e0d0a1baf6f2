//! Backend-neutral store handle.
//!
//! The dispatch core talks to [`Store`] only. Each method forwards to the
//! in-memory tables or to the borrowed `PostgreSQL` stores; the enum keeps
//! dispatch static and the handle cheap to clone.

use carelink_types::{
    ChatMessage, Coordinates, LocationPoint, Party, Payment, ProviderId, ProviderProfile,
    ProviderStatus, Request, RequestId, RequestStatus, RequesterId, RequesterProfile, Session,
    SessionId,
};
use chrono::{DateTime, Utc};

use crate::error::DbError;
use crate::memory::MemoryStore;
use crate::party_store::PartyStore;
use crate::postgres::PostgresPool;
use crate::request_store::RequestStore;
use crate::session_store::SessionRecordStore;

/// Durable store used by the dispatch core.
#[derive(Clone)]
pub enum Store {
    /// Process-local tables. Lost on restart.
    Memory(MemoryStore),
    /// `PostgreSQL` tables.
    Postgres(PostgresPool),
}

impl Store {
    /// A fresh, empty in-memory store.
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }

    /// Short backend name for logs.
    pub const fn backend(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Postgres(_) => "postgres",
        }
    }

    /// Whether the backend answers. Always true in memory.
    pub async fn is_reachable(&self) -> bool {
        match self {
            Self::Memory(_) => true,
            Self::Postgres(pg) => match pg.ping().await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "PostgreSQL ping failed");
                    false
                }
            },
        }
    }

    /// Release backend resources. A no-op in memory.
    pub async fn close(&self) {
        if let Self::Postgres(pg) = self {
            pg.close().await;
        }
    }

    // =========================================================================
    // Parties
    // =========================================================================

    /// Insert or replace a provider record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    pub async fn upsert_provider(&self, provider: &ProviderProfile) -> Result<(), DbError> {
        match self {
            Self::Memory(m) => m.upsert_provider(provider),
            Self::Postgres(pg) => PartyStore::new(pg.pool()).upsert_provider(provider).await,
        }
    }

    /// Fetch one provider.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    pub async fn get_provider(&self, id: ProviderId) -> Result<Option<ProviderProfile>, DbError> {
        match self {
            Self::Memory(m) => Ok(m.get_provider(id)),
            Self::Postgres(pg) => PartyStore::new(pg.pool()).get_provider(id).await,
        }
    }

    /// Every provider currently marked available.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    pub async fn list_available_providers(&self) -> Result<Vec<ProviderProfile>, DbError> {
        match self {
            Self::Memory(m) => Ok(m.list_available_providers()),
            Self::Postgres(pg) => PartyStore::new(pg.pool()).list_available_providers().await,
        }
    }

    /// Flip a provider's availability.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for an unknown provider.
    pub async fn set_provider_status(
        &self,
        id: ProviderId,
        status: ProviderStatus,
    ) -> Result<(), DbError> {
        match self {
            Self::Memory(m) => m.set_provider_status(id, status),
            Self::Postgres(pg) => {
                PartyStore::new(pg.pool())
                    .set_provider_status(id, status)
                    .await
            }
        }
    }

    /// Move a provider's last known position.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for an unknown provider.
    pub async fn set_provider_coordinates(
        &self,
        id: ProviderId,
        coords: Coordinates,
    ) -> Result<(), DbError> {
        match self {
            Self::Memory(m) => m.set_provider_coordinates(id, coords),
            Self::Postgres(pg) => {
                PartyStore::new(pg.pool())
                    .set_provider_coordinates(id, coords)
                    .await
            }
        }
    }

    /// Insert or replace a requester record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    pub async fn upsert_requester(&self, requester: &RequesterProfile) -> Result<(), DbError> {
        match self {
            Self::Memory(m) => m.upsert_requester(requester),
            Self::Postgres(pg) => PartyStore::new(pg.pool()).upsert_requester(requester).await,
        }
    }

    /// Fetch one requester.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    pub async fn get_requester(
        &self,
        id: RequesterId,
    ) -> Result<Option<RequesterProfile>, DbError> {
        match self {
            Self::Memory(m) => Ok(m.get_requester(id)),
            Self::Postgres(pg) => PartyStore::new(pg.pool()).get_requester(id).await,
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Persist a new request.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    pub async fn insert_request(&self, request: &Request) -> Result<(), DbError> {
        match self {
            Self::Memory(m) => m.insert_request(request),
            Self::Postgres(pg) => RequestStore::new(pg.pool()).insert(request).await,
        }
    }

    /// Fetch one request.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    pub async fn get_request(&self, id: RequestId) -> Result<Option<Request>, DbError> {
        match self {
            Self::Memory(m) => Ok(m.get_request(id)),
            Self::Postgres(pg) => RequestStore::new(pg.pool()).get(id).await,
        }
    }

    /// Replace the stored request only if its status is still `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Conflict`] with the stored status when another
    /// writer got there first.
    pub async fn compare_and_set_request(
        &self,
        request: &Request,
        expected: RequestStatus,
    ) -> Result<(), DbError> {
        match self {
            Self::Memory(m) => m.compare_and_set_request(request, expected),
            Self::Postgres(pg) => {
                RequestStore::new(pg.pool())
                    .compare_and_set(request, expected)
                    .await
            }
        }
    }

    /// The requester's pending request, if one is open.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    pub async fn find_open_request_for_requester(
        &self,
        requester: RequesterId,
    ) -> Result<Option<Request>, DbError> {
        match self {
            Self::Memory(m) => Ok(m.find_open_request_for_requester(requester)),
            Self::Postgres(pg) => {
                RequestStore::new(pg.pool())
                    .find_open_for_requester(requester)
                    .await
            }
        }
    }

    /// Every request still waiting for a provider.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    pub async fn list_pending_requests(&self) -> Result<Vec<Request>, DbError> {
        match self {
            Self::Memory(m) => Ok(m.list_pending_requests()),
            Self::Postgres(pg) => RequestStore::new(pg.pool()).list_pending().await,
        }
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Create or fully overwrite a session record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    pub async fn upsert_session(&self, session: &Session) -> Result<(), DbError> {
        match self {
            Self::Memory(m) => m.upsert_session(session),
            Self::Postgres(pg) => SessionRecordStore::new(pg.pool()).upsert(session).await,
        }
    }

    /// Fetch one session.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    pub async fn get_session(&self, id: SessionId) -> Result<Option<Session>, DbError> {
        match self {
            Self::Memory(m) => Ok(m.get_session(id)),
            Self::Postgres(pg) => SessionRecordStore::new(pg.pool()).get(id).await,
        }
    }

    /// Append one location point and move the current position.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Conflict`] if the session has ended, or another
    /// [`DbError`] if the write fails.
    pub async fn append_location(
        &self,
        id: SessionId,
        point: &LocationPoint,
        updated_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        match self {
            Self::Memory(m) => m.append_location(id, point, updated_at),
            Self::Postgres(pg) => {
                SessionRecordStore::new(pg.pool())
                    .append_location(id, point, updated_at)
                    .await
            }
        }
    }

    /// Append one chat line.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Conflict`] if the session has ended, or another
    /// [`DbError`] if the write fails.
    pub async fn append_chat(
        &self,
        id: SessionId,
        message: &ChatMessage,
        updated_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        match self {
            Self::Memory(m) => m.append_chat(id, message, updated_at),
            Self::Postgres(pg) => {
                SessionRecordStore::new(pg.pool())
                    .append_chat(id, message, updated_at)
                    .await
            }
        }
    }

    /// Persist a status change and its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    pub async fn save_session_status(&self, session: &Session) -> Result<(), DbError> {
        match self {
            Self::Memory(m) => m.save_session_status(session),
            Self::Postgres(pg) => SessionRecordStore::new(pg.pool()).save_status(session).await,
        }
    }

    /// Replace the payment sub-record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    pub async fn set_payment(
        &self,
        id: SessionId,
        payment: &Payment,
        updated_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        match self {
            Self::Memory(m) => m.set_payment(id, payment, updated_at),
            Self::Postgres(pg) => {
                SessionRecordStore::new(pg.pool())
                    .set_payment(id, payment, updated_at)
                    .await
            }
        }
    }

    /// The most recently accepted non-terminal session involving `party`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    pub async fn find_active_session_for_party(
        &self,
        party: Party,
    ) -> Result<Option<Session>, DbError> {
        match self {
            Self::Memory(m) => Ok(m.find_active_session_for_party(party)),
            Self::Postgres(pg) => {
                SessionRecordStore::new(pg.pool())
                    .find_active_for_party(party)
                    .await
            }
        }
    }

    /// Every session involving `party`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    pub async fn list_sessions_for_party(&self, party: Party) -> Result<Vec<Session>, DbError> {
        match self {
            Self::Memory(m) => Ok(m.list_sessions_for_party(party)),
            Self::Postgres(pg) => SessionRecordStore::new(pg.pool()).list_for_party(party).await,
        }
    }
}
