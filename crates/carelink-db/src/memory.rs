//! In-process store with the same semantics as the `PostgreSQL` tables.
//!
//! Used for local development and tests. Each table is a sharded
//! [`DashMap`], so the conditional status write in
//! [`MemoryStore::compare_and_set_request`] is atomic per request and
//! unrelated keys never contend.
//!
//! [`MemoryStore::set_write_failure`] makes every write fail with
//! [`DbError::Unavailable`], which lets callers rehearse an outage.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use carelink_types::{
    ChatMessage, Coordinates, LocationPoint, Party, Payment, ProviderId, ProviderProfile,
    ProviderStatus, Request, RequestId, RequestStatus, RequesterId, RequesterProfile, Session,
    SessionId,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::DbError;

#[derive(Default)]
struct Tables {
    providers: DashMap<ProviderId, ProviderProfile>,
    requesters: DashMap<RequesterId, RequesterProfile>,
    requests: DashMap<RequestId, Request>,
    sessions: DashMap<SessionId, Session>,
    fail_writes: AtomicBool,
}

/// Shared in-memory store. Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (`true`) or succeed (`false`).
    pub fn set_write_failure(&self, fail: bool) {
        self.tables.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), DbError> {
        if self.tables.fail_writes.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable(String::from("memory store rejecting writes")));
        }
        Ok(())
    }

    // =========================================================================
    // Parties
    // =========================================================================

    /// Insert or replace a provider record.
    pub fn upsert_provider(&self, provider: &ProviderProfile) -> Result<(), DbError> {
        self.check_writable()?;
        self.tables.providers.insert(provider.id, provider.clone());
        Ok(())
    }

    /// Fetch one provider.
    pub fn get_provider(&self, id: ProviderId) -> Option<ProviderProfile> {
        self.tables.providers.get(&id).map(|p| p.clone())
    }

    /// Every provider currently marked available, ordered by ID.
    pub fn list_available_providers(&self) -> Vec<ProviderProfile> {
        let mut providers: Vec<ProviderProfile> = self
            .tables
            .providers
            .iter()
            .filter(|p| p.status == ProviderStatus::Available)
            .map(|p| p.clone())
            .collect();
        providers.sort_by_key(|p| p.id);
        providers
    }

    /// Flip a provider's availability.
    pub fn set_provider_status(&self, id: ProviderId, status: ProviderStatus) -> Result<(), DbError> {
        self.check_writable()?;
        let mut provider = self
            .tables
            .providers
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("provider {id}")))?;
        provider.status = status;
        Ok(())
    }

    /// Move a provider's last known position.
    pub fn set_provider_coordinates(&self, id: ProviderId, coords: Coordinates) -> Result<(), DbError> {
        self.check_writable()?;
        let mut provider = self
            .tables
            .providers
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("provider {id}")))?;
        provider.coordinates = Some(coords);
        Ok(())
    }

    /// Insert or replace a requester record.
    pub fn upsert_requester(&self, requester: &RequesterProfile) -> Result<(), DbError> {
        self.check_writable()?;
        self.tables.requesters.insert(requester.id, requester.clone());
        Ok(())
    }

    /// Fetch one requester.
    pub fn get_requester(&self, id: RequesterId) -> Option<RequesterProfile> {
        self.tables.requesters.get(&id).map(|r| r.clone())
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Persist a new request. Fails if the ID is taken.
    pub fn insert_request(&self, request: &Request) -> Result<(), DbError> {
        self.check_writable()?;
        match self.tables.requests.entry(request.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DbError::Conflict {
                actual: String::from("exists"),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(request.clone());
                Ok(())
            }
        }
    }

    /// Fetch one request.
    pub fn get_request(&self, id: RequestId) -> Option<Request> {
        self.tables.requests.get(&id).map(|r| r.clone())
    }

    /// Replace the stored request only if its status is still `expected`.
    pub fn compare_and_set_request(
        &self,
        request: &Request,
        expected: RequestStatus,
    ) -> Result<(), DbError> {
        self.check_writable()?;
        let mut stored = self
            .tables
            .requests
            .get_mut(&request.id)
            .ok_or_else(|| DbError::NotFound(format!("request {}", request.id)))?;
        if stored.status != expected {
            return Err(DbError::Conflict {
                actual: stored.status.as_str().to_owned(),
            });
        }
        *stored = request.clone();
        Ok(())
    }

    /// The requester's pending request, if one is open.
    pub fn find_open_request_for_requester(&self, requester: RequesterId) -> Option<Request> {
        self.tables
            .requests
            .iter()
            .filter(|r| r.requester_id == requester && r.status == RequestStatus::Pending)
            .max_by_key(|r| r.created_at)
            .map(|r| r.clone())
    }

    /// Every request still waiting for a provider, oldest first.
    pub fn list_pending_requests(&self) -> Vec<Request> {
        let mut pending: Vec<Request> = self
            .tables
            .requests
            .iter()
            .filter(|r| r.status == RequestStatus::Pending)
            .map(|r| r.clone())
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Create or fully overwrite a session record.
    pub fn upsert_session(&self, session: &Session) -> Result<(), DbError> {
        self.check_writable()?;
        self.tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    /// Fetch one session.
    pub fn get_session(&self, id: SessionId) -> Option<Session> {
        self.tables.sessions.get(&id).map(|s| s.clone())
    }

    /// Append a point to the history and move the current position.
    /// Refused once the session has ended.
    pub fn append_location(
        &self,
        id: SessionId,
        point: &LocationPoint,
        updated_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.with_live_session(id, |session| {
            session.location_history.push(point.clone());
            session.current = Some(point.clone());
            session.updated_at = updated_at;
        })
    }

    /// Append a chat line. Refused once the session has ended.
    pub fn append_chat(
        &self,
        id: SessionId,
        message: &ChatMessage,
        updated_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.with_live_session(id, |session| {
            session.chat.push(message.clone());
            session.updated_at = updated_at;
        })
    }

    /// Persist a status change together with its metadata annotations.
    pub fn save_session_status(&self, update: &Session) -> Result<(), DbError> {
        self.with_session(update.id, |session| {
            session.status = update.status;
            session.metadata.clone_from(&update.metadata);
            session.updated_at = update.updated_at;
        })
    }

    /// Replace the payment sub-record.
    pub fn set_payment(
        &self,
        id: SessionId,
        payment: &Payment,
        updated_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.with_session(id, |session| {
            session.payment = payment.clone();
            session.updated_at = updated_at;
        })
    }

    /// The most recently accepted non-terminal session involving `party`.
    pub fn find_active_session_for_party(&self, party: Party) -> Option<Session> {
        self.tables
            .sessions
            .iter()
            .filter(|s| s.involves(party) && !s.status.is_terminal())
            .max_by_key(|s| s.accepted_at)
            .map(|s| s.clone())
    }

    /// Every session involving `party`, newest first.
    pub fn list_sessions_for_party(&self, party: Party) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .tables
            .sessions
            .iter()
            .filter(|s| s.involves(party))
            .map(|s| s.clone())
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    fn with_session(
        &self,
        id: SessionId,
        apply: impl FnOnce(&mut Session),
    ) -> Result<(), DbError> {
        self.check_writable()?;
        let mut session = self
            .tables
            .sessions
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("session {id}")))?;
        apply(&mut session);
        Ok(())
    }

    fn with_live_session(
        &self,
        id: SessionId,
        apply: impl FnOnce(&mut Session),
    ) -> Result<(), DbError> {
        self.check_writable()?;
        let mut session = self
            .tables
            .sessions
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("session {id}")))?;
        if session.status.is_terminal() {
            return Err(DbError::Conflict {
                actual: session.status.as_str().to_owned(),
            });
        }
        apply(&mut session);
        Ok(())
    }
}
