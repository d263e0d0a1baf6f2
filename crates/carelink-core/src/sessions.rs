//! Hot cache of live sessions, written through to the durable store.
//!
//! Each live session sits behind its own async mutex, so updates to one
//! session are atomic with respect to each other and never wait on another
//! session. A mutation is applied to the cached copy, written to the store,
//! and undone if the write fails; callers either see the change in both
//! places or get an error.
//!
//! The store is authoritative. A cache miss re-reads it, and terminal
//! sessions are served from the store without being cached.

use std::sync::Arc;

use carelink_db::{DbError, Store};
use carelink_types::{
    ChatMessage, Coordinates, LocationPoint, Party, PartyRole, PaymentUpdate, ProviderId,
    Session, SessionId, SessionStatus,
};
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use validator::Validate;

use crate::bus::{ChatPosted, DispatchEvent, EventBus, LocationUpdated, Proximity};
use crate::error::DispatchError;
use crate::pending::PendingIndex;

/// Longest accepted chat line, in characters.
const MAX_CHAT_CHARS: usize = 2000;

/// What a cache miss found in the store.
enum Loaded {
    /// Live, with its cache cell.
    Live(Arc<Mutex<Session>>, Session),
    /// Ended; served from the store without caching.
    Ended(Session),
}

/// A requested status change and who may make it.
#[derive(Debug, Clone, Copy)]
pub struct Transition<'a> {
    /// Target status.
    pub next: SessionStatus,
    /// Roles allowed to trigger it.
    pub allowed: &'a [PartyRole],
    /// Recorded under `cancel_reason` when cancelling.
    pub reason: Option<&'a str>,
}

struct Inner {
    entries: DashMap<SessionId, Arc<Mutex<Session>>>,
    by_party: DashMap<Party, SessionId>,
    store: Store,
    bus: EventBus,
    pending: PendingIndex,
    nearby_radius_km: f64,
}

/// Shared session cache. Clones share state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl SessionStore {
    /// Create an empty cache over `store`.
    pub fn new(store: Store, bus: EventBus, pending: PendingIndex, nearby_radius_km: f64) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                by_party: DashMap::new(),
                store,
                bus,
                pending,
                nearby_radius_km,
            }),
        }
    }

    /// Create or overwrite a session, durably first.
    ///
    /// Applying the same record twice leaves it unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Dependency`] if the store write fails; the
    /// cache is left as it was.
    pub async fn upsert(&self, session: Session) -> Result<Session, DispatchError> {
        let id = session.id;
        if let Some(cell) = self.cached(id) {
            let mut current = cell.lock().await;
            self.inner.store.upsert_session(&session).await?;
            current.clone_from(&session);
        } else {
            self.inner.store.upsert_session(&session).await?;
            self.inner
                .entries
                .insert(id, Arc::new(Mutex::new(session.clone())));
        }

        if session.status.is_terminal() {
            self.evict(id);
        } else {
            self.index(&session);
        }
        Ok(session)
    }

    /// Snapshot of one session, from the cache or the store.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Dependency`] if the store read fails.
    pub async fn get(&self, id: SessionId) -> Result<Option<Session>, DispatchError> {
        if let Some(cell) = self.cached(id) {
            return Ok(Some(cell.lock().await.clone()));
        }
        self.rehydrate(id).await
    }

    /// Re-read one session from the store and refresh the cache with it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Dependency`] if the store read fails.
    pub async fn rehydrate(&self, id: SessionId) -> Result<Option<Session>, DispatchError> {
        match self.load(id).await? {
            Some(Loaded::Live(_, session)) => {
                tracing::debug!(session_id = %id, "Session rehydrated from store");
                Ok(Some(session))
            }
            Some(Loaded::Ended(session)) => Ok(Some(session)),
            None => Ok(None),
        }
    }

    /// Most recent non-terminal session in which `party` takes part.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Dependency`] if the store read fails.
    pub async fn get_for_party(&self, party: Party) -> Result<Option<Session>, DispatchError> {
        let indexed = self.inner.by_party.get(&party).map(|e| *e.value());
        if let Some(cell) = indexed.and_then(|id| self.cached(id)) {
            let session = cell.lock().await;
            if !session.status.is_terminal() && session.involves(party) {
                return Ok(Some(session.clone()));
            }
        }

        let Some(read) = self.inner.store.find_active_session_for_party(party).await? else {
            return Ok(None);
        };
        match self.adopt(read).await? {
            Some(Loaded::Live(_, session)) if session.involves(party) => Ok(Some(session)),
            _ => Ok(None),
        }
    }

    /// Append a provider position to a live session.
    ///
    /// The point is stamped on arrival, never earlier than the previous
    /// point. Other pending requests near the point are told a provider is
    /// close by.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Validation`] for a malformed coordinate
    /// - [`DispatchError::Forbidden`] if `provider` is not the session's provider
    /// - [`DispatchError::StateConflict`] if the session has ended
    /// - [`DispatchError::Dependency`] if the store write fails (nothing is kept)
    pub async fn append_location(
        &self,
        id: SessionId,
        provider: ProviderId,
        coords: Coordinates,
        accuracy: Option<f64>,
    ) -> Result<LocationPoint, DispatchError> {
        if !coords.is_valid() {
            return Err(DispatchError::Validation(format!(
                "invalid coordinates ({}, {})",
                coords.latitude, coords.longitude
            )));
        }
        let cell = self.handle(id).await?;

        let (event, provider_name) = {
            let mut session = cell.lock().await;
            if session.provider_id != provider {
                return Err(DispatchError::Forbidden(String::from(
                    "only the assigned provider reports location",
                )));
            }
            if session.status.is_terminal() {
                return Err(DispatchError::conflict("session", session.status));
            }

            let now = Utc::now();
            let timestamp = session.last_point_at().map_or(now, |last| last.max(now));
            let point = LocationPoint::at(coords, accuracy, timestamp);
            let previous_current = session.current.replace(point.clone());
            let previous_updated = session.updated_at;
            session.location_history.push(point.clone());
            session.updated_at = timestamp;

            if let Err(e) = self
                .inner
                .store
                .append_location(id, &point, timestamp)
                .await
            {
                session.location_history.pop();
                session.current = previous_current;
                session.updated_at = previous_updated;
                tracing::warn!(session_id = %id, error = %e, "Location write failed, rolled back");
                return Err(self.append_failed(id, e));
            }

            (
                LocationUpdated {
                    session_id: id,
                    requester_id: session.requester_id,
                    provider_id: session.provider_id,
                    point,
                },
                session.provider_name.clone(),
            )
        };

        let point = event.point.clone();
        self.inner.bus.publish(DispatchEvent::LocationUpdated(event));
        self.announce_nearby(provider, &provider_name, coords, Some(id));
        Ok(point)
    }

    /// Append a chat line from one of the session's parties.
    ///
    /// `claimed` is the role the client says it speaks as; when present it
    /// must match the sender's actual role.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Validation`] for an empty or oversized message
    /// - [`DispatchError::Forbidden`] if `sender` is not a session party
    /// - [`DispatchError::StateConflict`] if the session has ended
    /// - [`DispatchError::Dependency`] if the store write fails (nothing is kept)
    pub async fn append_chat(
        &self,
        id: SessionId,
        sender: Party,
        claimed: Option<PartyRole>,
        text: &str,
    ) -> Result<ChatMessage, DispatchError> {
        let text = text.trim();
        if text.is_empty() || text.chars().count() > MAX_CHAT_CHARS {
            return Err(DispatchError::Validation(format!(
                "chat text must be 1-{MAX_CHAT_CHARS} characters"
            )));
        }
        let cell = self.handle(id).await?;

        let event = {
            let mut session = cell.lock().await;
            let Some(role) = session.role_of(sender) else {
                return Err(DispatchError::Forbidden(String::from(
                    "sender is not a party to this session",
                )));
            };
            if claimed.is_some_and(|c| c != role) {
                return Err(DispatchError::Forbidden(format!(
                    "sender speaks as {}",
                    role.as_str()
                )));
            }
            if session.status.is_terminal() {
                return Err(DispatchError::conflict("session", session.status));
            }

            let now = Utc::now();
            let message = ChatMessage {
                sender_role: role,
                sender,
                text: text.to_owned(),
                timestamp: now,
            };
            let previous_updated = session.updated_at;
            session.chat.push(message.clone());
            session.updated_at = now;

            if let Err(e) = self.inner.store.append_chat(id, &message, now).await {
                session.chat.pop();
                session.updated_at = previous_updated;
                tracing::warn!(session_id = %id, error = %e, "Chat write failed, rolled back");
                return Err(self.append_failed(id, e));
            }

            ChatPosted {
                session_id: id,
                requester_id: session.requester_id,
                provider_id: session.provider_id,
                message,
            }
        };

        let message = event.message.clone();
        self.inner.bus.publish(DispatchEvent::ChatPosted(event));
        Ok(message)
    }

    /// Move a session one step along its lifecycle.
    ///
    /// Terminal sessions are evicted from the cache once persisted. Returns
    /// the updated session and the role of `actor`.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Forbidden`] if `actor` may not make this move
    /// - [`DispatchError::StateConflict`] if the move is not allowed from the
    ///   current status (the error carries it)
    /// - [`DispatchError::Dependency`] if the store write fails (status restored)
    pub async fn set_status(
        &self,
        id: SessionId,
        actor: Party,
        transition: Transition<'_>,
    ) -> Result<(Session, PartyRole), DispatchError> {
        let cell = self.handle(id).await?;
        let mut session = cell.lock().await;

        let role = authorize(&session, actor, transition)?;
        let snapshot = session.clone();
        let now = Utc::now();
        session.status = transition.next;
        session.updated_at = now;
        session.metadata.insert(
            format!("{}_at", transition.next.as_str()),
            serde_json::json!(now),
        );
        if transition.next == SessionStatus::Cancelled {
            session
                .metadata
                .insert(String::from("cancelled_by"), serde_json::json!(role.as_str()));
            if let Some(reason) = transition.reason {
                session
                    .metadata
                    .insert(String::from("cancel_reason"), serde_json::json!(reason));
            }
        }

        if let Err(e) = self.inner.store.save_session_status(&session).await {
            *session = snapshot;
            tracing::warn!(session_id = %id, error = %e, "Status write failed, rolled back");
            return Err(e.into());
        }

        let updated = session.clone();
        drop(session);
        if updated.status.is_terminal() {
            self.evict(id);
        }
        tracing::info!(
            session_id = %id,
            status = %updated.status,
            actor = role.as_str(),
            "Session status changed"
        );
        Ok((updated, role))
    }

    /// Check a transition without applying it.
    ///
    /// # Errors
    ///
    /// Same as [`SessionStore::set_status`], minus store failures.
    pub async fn check_status(
        &self,
        id: SessionId,
        actor: Party,
        transition: Transition<'_>,
    ) -> Result<Session, DispatchError> {
        let cell = self.handle(id).await?;
        let session = cell.lock().await;
        authorize(&session, actor, transition)?;
        Ok(session.clone())
    }

    /// Merge payment fields into a session. Works on ended sessions too.
    ///
    /// `paid_at` is stamped when the paid flag flips on and cleared when it
    /// flips off.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Validation`] for malformed fields or a negative amount
    /// - [`DispatchError::Forbidden`] if `actor` is not a session party
    /// - [`DispatchError::Dependency`] if the store write fails (nothing is kept)
    pub async fn update_payment(
        &self,
        id: SessionId,
        actor: Party,
        update: &PaymentUpdate,
    ) -> Result<Session, DispatchError> {
        update.validate()?;
        if update.amount.is_some_and(|a| a.is_sign_negative()) {
            return Err(DispatchError::Validation(String::from(
                "payment amount must not be negative",
            )));
        }
        let cell = self.handle(id).await?;
        let mut session = cell.lock().await;
        if !session.involves(actor) {
            return Err(DispatchError::Forbidden(String::from(
                "not a party to this session",
            )));
        }

        let previous_payment = session.payment.clone();
        let previous_updated = session.updated_at;
        let now = Utc::now();
        let payment = &mut session.payment;
        if let Some(paid) = update.paid {
            if paid && !payment.paid {
                payment.paid_at = Some(now);
            } else if !paid {
                payment.paid_at = None;
            }
            payment.paid = paid;
        }
        if let Some(method) = &update.method {
            payment.method = Some(method.clone());
        }
        if let Some(reference) = &update.transaction_id {
            payment.transaction_id = Some(reference.clone());
        }
        if let Some(amount) = update.amount {
            payment.amount = Some(amount);
        }
        if let Some(metadata) = &update.metadata {
            payment.metadata = metadata.clone();
        }
        session.updated_at = now;

        if let Err(e) = self.inner.store.set_payment(id, &session.payment, now).await {
            session.payment = previous_payment;
            session.updated_at = previous_updated;
            tracing::warn!(session_id = %id, error = %e, "Payment write failed, rolled back");
            return Err(e.into());
        }
        tracing::info!(session_id = %id, paid = session.payment.paid, "Payment updated");
        Ok(session.clone())
    }

    /// Tell requesters of pending requests near `coords` that a provider
    /// is close by. Returns how many were told.
    pub fn announce_nearby(
        &self,
        provider_id: ProviderId,
        provider_name: &str,
        coords: Coordinates,
        except: Option<SessionId>,
    ) -> usize {
        let nearby = self
            .inner
            .pending
            .within(coords, self.inner.nearby_radius_km, except);
        for hit in &nearby {
            tracing::debug!(
                request_id = %hit.request_id,
                %provider_id,
                distance_km = hit.distance_km,
                "Provider nearby"
            );
            self.inner.bus.publish(DispatchEvent::ProviderNearby(Proximity {
                request_id: hit.request_id,
                requester_id: hit.requester_id,
                provider_id,
                provider_name: provider_name.to_owned(),
                coords,
                distance_km: hit.distance_km,
            }));
        }
        nearby.len()
    }

    /// Drop a session from the cache. The stored record is untouched.
    pub fn evict(&self, id: SessionId) {
        if self.inner.entries.remove(&id).is_some() {
            tracing::debug!(session_id = %id, "Session evicted from cache");
        }
        self.inner.by_party.retain(|_, session| *session != id);
    }

    /// Number of cached sessions.
    pub fn cached_count(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether `id` is in the cache.
    pub fn is_cached(&self, id: SessionId) -> bool {
        self.inner.entries.contains_key(&id)
    }

    fn cached(&self, id: SessionId) -> Option<Arc<Mutex<Session>>> {
        self.inner.entries.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// The cache cell for `id`, loading it from the store on a miss.
    ///
    /// Terminal sessions get a detached cell that is not cached.
    async fn handle(&self, id: SessionId) -> Result<Arc<Mutex<Session>>, DispatchError> {
        if let Some(cell) = self.cached(id) {
            return Ok(cell);
        }
        match self.load(id).await? {
            Some(Loaded::Live(cell, _)) => Ok(cell),
            Some(Loaded::Ended(session)) => Ok(Arc::new(Mutex::new(session))),
            None => Err(DispatchError::NotFound(format!("session {id}"))),
        }
    }

    async fn load(&self, id: SessionId) -> Result<Option<Loaded>, DispatchError> {
        match self.inner.store.get_session(id).await? {
            Some(read) => self.adopt(read).await,
            None => {
                self.evict(id);
                Ok(None)
            }
        }
    }

    /// Cache `read`, a record just taken from the store.
    ///
    /// The record is read again under the cell lock and the cell set from
    /// that, so a session that ended after `read` was taken is evicted
    /// instead of cached in its old state.
    async fn adopt(&self, read: Session) -> Result<Option<Loaded>, DispatchError> {
        let id = read.id;
        if read.status.is_terminal() {
            self.evict(id);
            return Ok(Some(Loaded::Ended(read)));
        }
        let cell = Arc::clone(
            self.inner
                .entries
                .entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(read)))
                .value(),
        );

        let mut cached = cell.lock().await;
        let current = match self.inner.store.get_session(id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                drop(cached);
                self.evict(id);
                return Ok(None);
            }
            Err(e) => {
                drop(cached);
                self.evict(id);
                return Err(e.into());
            }
        };
        cached.clone_from(&current);
        drop(cached);

        if current.status.is_terminal() {
            self.evict(id);
            tracing::debug!(session_id = %id, "Session ended while loading, not cached");
            return Ok(Some(Loaded::Ended(current)));
        }
        self.index(&current);
        Ok(Some(Loaded::Live(cell, current)))
    }

    /// Map a failed append. A store that refuses because the session has
    /// ended means the cached copy is stale.
    fn append_failed(&self, id: SessionId, err: DbError) -> DispatchError {
        match err {
            DbError::Conflict { actual } => {
                self.evict(id);
                DispatchError::conflict("session", actual)
            }
            other => other.into(),
        }
    }

    fn index(&self, session: &Session) {
        for party in session.parties() {
            self.inner.by_party.insert(party, session.id);
        }
    }
}

/// Whether `actor` may apply `transition` to `session`.
fn authorize(
    session: &Session,
    actor: Party,
    transition: Transition<'_>,
) -> Result<PartyRole, DispatchError> {
    let role = session
        .role_of(actor)
        .ok_or_else(|| DispatchError::Forbidden(String::from("not a party to this session")))?;
    if !transition.allowed.contains(&role) {
        return Err(DispatchError::Forbidden(format!(
            "{} may not move a session to {}",
            role.as_str(),
            transition.next
        )));
    }
    if !session.status.can_transition_to(transition.next) {
        return Err(DispatchError::conflict("session", session.status));
    }
    Ok(role)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use carelink_db::MemoryStore;
    use carelink_types::{Payment, RequestId, RequesterId};
    use rust_decimal::Decimal;

    use super::*;
    use crate::bus::{Topic, TopicFilter};
    use crate::pending::PendingEntry;

    struct Fixture {
        memory: MemoryStore,
        sessions: SessionStore,
        bus: EventBus,
        pending: PendingIndex,
    }

    fn fixture() -> Fixture {
        let memory = MemoryStore::new();
        let bus = EventBus::default();
        let pending = PendingIndex::new();
        let sessions = SessionStore::new(
            Store::Memory(memory.clone()),
            bus.clone(),
            pending.clone(),
            1.0,
        );
        Fixture {
            memory,
            sessions,
            bus,
            pending,
        }
    }

    fn seed() -> Session {
        let now = Utc::now();
        Session {
            id: RequestId::new(),
            requester_id: RequesterId::new(),
            requester_name: String::from("Asha"),
            provider_id: ProviderId::new(),
            provider_name: String::from("Neha"),
            provider_image: None,
            service_type: String::from("elder_care"),
            origin: Coordinates::new(12.97, 77.59),
            status: SessionStatus::Accepted,
            current: None,
            location_history: Vec::new(),
            chat: Vec::new(),
            payment: Payment::default(),
            amount: Decimal::new(10000, 2),
            accepted_at: now,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let f = fixture();
        let session = seed();
        let first = f.sessions.upsert(session.clone()).await.unwrap();
        let second = f.sessions.upsert(session.clone()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.sessions.get(session.id).await.unwrap().unwrap(), session);
        assert_eq!(f.memory.get_session(session.id).unwrap(), session);
    }

    #[tokio::test]
    async fn location_history_is_non_decreasing() {
        let f = fixture();
        let session = f.sessions.upsert(seed()).await.unwrap();
        for i in 0..20 {
            let coords = Coordinates::new(12.90 + f64::from(i) * 0.001, 77.50);
            f.sessions
                .append_location(session.id, session.provider_id, coords, None)
                .await
                .unwrap();
        }
        let stored = f.memory.get_session(session.id).unwrap();
        assert_eq!(stored.location_history.len(), 20);
        assert!(
            stored
                .location_history
                .windows(2)
                .all(|w| w[0].timestamp <= w[1].timestamp)
        );
        assert_eq!(stored.current, stored.location_history.last().cloned());
    }

    #[tokio::test]
    async fn failed_write_rolls_back_cache() {
        let f = fixture();
        let session = f.sessions.upsert(seed()).await.unwrap();
        f.memory.set_write_failure(true);

        let err = f
            .sessions
            .append_location(session.id, session.provider_id, Coordinates::new(12.9, 77.5), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Dependency(_)));
        let err = f
            .sessions
            .append_chat(session.id, Party::Requester(session.requester_id), None, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Dependency(_)));

        let cached = f.sessions.get(session.id).await.unwrap().unwrap();
        assert!(cached.location_history.is_empty());
        assert!(cached.current.is_none());
        assert!(cached.chat.is_empty());
        assert_eq!(cached, session);
    }

    #[tokio::test]
    async fn invalid_coordinates_are_rejected() {
        let f = fixture();
        let session = f.sessions.upsert(seed()).await.unwrap();
        let err = f
            .sessions
            .append_location(
                session.id,
                session.provider_id,
                Coordinates::new(f64::NAN, 1.0),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[tokio::test]
    async fn chat_requires_a_session_party() {
        let f = fixture();
        let session = f.sessions.upsert(seed()).await.unwrap();
        let stranger = Party::Requester(RequesterId::new());
        let err = f
            .sessions
            .append_chat(session.id, stranger, None, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));

        let provider = Party::Provider(session.provider_id);
        let err = f
            .sessions
            .append_chat(session.id, provider, Some(PartyRole::Requester), "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));

        let msg = f
            .sessions
            .append_chat(session.id, provider, Some(PartyRole::Provider), "  on my way ")
            .await
            .unwrap();
        assert_eq!(msg.text, "on my way");
        assert_eq!(msg.sender_role, PartyRole::Provider);
    }

    #[tokio::test]
    async fn wrong_state_reports_actual_status() {
        let f = fixture();
        let session = f.sessions.upsert(seed()).await.unwrap();
        let provider = Party::Provider(session.provider_id);
        let err = f
            .sessions
            .set_status(
                session.id,
                provider,
                Transition {
                    next: SessionStatus::Completed,
                    allowed: &[PartyRole::Provider],
                    reason: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.current_status(), Some("accepted"));
    }

    #[tokio::test]
    async fn terminal_status_evicts_but_keeps_record() {
        let f = fixture();
        let session = f.sessions.upsert(seed()).await.unwrap();
        let requester = Party::Requester(session.requester_id);
        let (cancelled, role) = f
            .sessions
            .set_status(
                session.id,
                requester,
                Transition {
                    next: SessionStatus::Cancelled,
                    allowed: &[PartyRole::Requester, PartyRole::Provider],
                    reason: Some("changed plans"),
                },
            )
            .await
            .unwrap();
        assert_eq!(role, PartyRole::Requester);
        assert_eq!(cancelled.metadata["cancelled_by"], "requester");
        assert!(!f.sessions.is_cached(session.id));
        assert!(f.sessions.get_for_party(requester).await.unwrap().is_none());

        let stored = f.sessions.get(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Cancelled);
        assert!(!f.sessions.is_cached(session.id));
    }

    #[tokio::test]
    async fn cache_miss_rehydrates_from_store() {
        let f = fixture();
        let session = seed();
        f.memory.upsert_session(&session).unwrap();
        assert!(!f.sessions.is_cached(session.id));

        let provider = Party::Provider(session.provider_id);
        let found = f.sessions.get_for_party(provider).await.unwrap().unwrap();
        assert_eq!(found.id, session.id);
        assert!(f.sessions.is_cached(session.id));
    }

    #[tokio::test]
    async fn payment_paid_at_follows_flag() {
        let f = fixture();
        let session = f.sessions.upsert(seed()).await.unwrap();
        let requester = Party::Requester(session.requester_id);
        let paid = f
            .sessions
            .update_payment(
                session.id,
                requester,
                &PaymentUpdate {
                    paid: Some(true),
                    method: Some(String::from("upi")),
                    ..PaymentUpdate::default()
                },
            )
            .await
            .unwrap();
        assert!(paid.payment.paid);
        assert!(paid.payment.paid_at.is_some());
        assert_eq!(paid.payment.method.as_deref(), Some("upi"));

        let negative = PaymentUpdate {
            amount: Some(Decimal::new(-1, 0)),
            ..PaymentUpdate::default()
        };
        assert!(matches!(
            f.sessions.update_payment(session.id, requester, &negative).await,
            Err(DispatchError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn passing_provider_is_announced_to_other_pending_requests() {
        let f = fixture();
        let session = f.sessions.upsert(seed()).await.unwrap();
        let other = RequestId::new();
        let other_requester = RequesterId::new();
        f.pending.insert(
            other,
            PendingEntry {
                requester_id: other_requester,
                requester_name: String::from("Ravi"),
                origin: Coordinates::new(12.9705, 77.5905),
                service_type: String::from("physio"),
                offered: Vec::new(),
                excluded: BTreeSet::new(),
                round: 0,
            },
        );
        let mut sub = f.bus.subscribe(TopicFilter::Only(vec![Topic::ProviderNearby]));

        f.sessions
            .append_location(
                session.id,
                session.provider_id,
                Coordinates::new(12.97, 77.59),
                Some(5.0),
            )
            .await
            .unwrap();

        match sub.recv().await.unwrap() {
            DispatchEvent::ProviderNearby(p) => {
                assert_eq!(p.request_id, other);
                assert_eq!(p.requester_id, other_requester);
                assert_eq!(p.provider_name, "Neha");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_ended_after_read_is_not_cached() {
        let f = fixture();
        let live = f.sessions.upsert(seed()).await.unwrap();
        f.sessions.evict(live.id);
        let read = f.memory.get_session(live.id).unwrap();

        let mut ended = read.clone();
        ended.status = SessionStatus::Completed;
        f.memory.save_session_status(&ended).unwrap();

        let Some(Loaded::Ended(session)) = f.sessions.adopt(read).await.unwrap() else {
            panic!("ended session was cached as live");
        };
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(!f.sessions.is_cached(live.id));
        let provider = Party::Provider(live.provider_id);
        assert!(f.sessions.get_for_party(provider).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn append_to_session_ended_in_store_is_refused() {
        let f = fixture();
        let live = f.sessions.upsert(seed()).await.unwrap();
        let mut ended = live.clone();
        ended.status = SessionStatus::Cancelled;
        f.memory.save_session_status(&ended).unwrap();

        let err = f
            .sessions
            .append_location(live.id, live.provider_id, Coordinates::new(12.971, 77.59), None)
            .await
            .unwrap_err();
        assert_eq!(err.current_status(), Some("cancelled"));
        assert!(!f.sessions.is_cached(live.id));
        assert!(f.memory.get_session(live.id).unwrap().location_history.is_empty());

        let err = f
            .sessions
            .append_chat(live.id, Party::Requester(live.requester_id), None, "hello")
            .await
            .unwrap_err();
        assert_eq!(err.current_status(), Some("cancelled"));
    }
}
