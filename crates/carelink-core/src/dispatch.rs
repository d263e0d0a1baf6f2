//! Request lifecycle: creation, offers, acceptance, rejection and the
//! session transitions that follow.
//!
//! Every operation on one request runs under that request's lock, so two
//! providers accepting at once are serialized and exactly one wins. The
//! store's conditional status write backs this up across processes.
//!
//! Offer windows are per-request timers. A window that lapses with the
//! request still pending gives up on it and tells the requester nobody is
//! available. Accepting or cancelling disarms the window.

use std::collections::BTreeSet;
use std::sync::Arc;

use carelink_db::Store;
use carelink_types::{
    Coordinates, LocationPoint, LocationReport, NearbyProviders, NewRequest, Party, PartyRole,
    Payment, PaymentUpdate, ProviderId, ProviderProfile, ProviderRegistration, ProviderStatus,
    Request, RequestId, RequestStatus, RequesterId, RequesterProfile, RequesterRegistration,
    Session, SessionId, SessionStatus,
};
use chrono::Utc;
use serde::Serialize;
use validator::Validate;

use crate::bus::{
    Acceptance, Cancellation, DispatchEvent, EventBus, MatchNotice, OfferBatch, StatusChange,
};
use crate::candidates::{CandidateSelector, estimate_range};
use crate::config::MatchingConfig;
use crate::distance::DistanceProvider;
use crate::error::DispatchError;
use crate::locks::KeyedLocks;
use crate::pending::{PendingEntry, PendingIndex};
use crate::sessions::{SessionStore, Transition};
use crate::timers::ReofferTimers;

/// What a provider's rejection led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RejectOutcome {
    /// The offer was declined; other offers are still open.
    Declined,
    /// A fresh round of offers went out.
    Reoffered {
        /// How many providers were offered.
        candidates: usize,
    },
    /// Nobody else qualified; the request was given up.
    NoProviderAvailable,
}

/// Where a provider location report went.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum LocationOutcome {
    /// Appended to the provider's live session.
    Session {
        /// Session identity.
        session_id: SessionId,
        /// The stored point.
        point: LocationPoint,
    },
    /// No live session; the provider's idle position was updated.
    Idle {
        /// Pending requesters told the provider is close by.
        nearby: usize,
    },
}

struct Inner {
    store: Store,
    selector: CandidateSelector,
    sessions: SessionStore,
    bus: EventBus,
    pending: PendingIndex,
    request_locks: KeyedLocks<RequestId>,
    requester_locks: KeyedLocks<RequesterId>,
    timers: ReofferTimers,
    matching: MatchingConfig,
}

/// Owns the request and session lifecycles. Clones share state.
#[derive(Clone)]
pub struct DispatchCoordinator {
    inner: Arc<Inner>,
}

impl DispatchCoordinator {
    /// Wire a coordinator over `store`, publishing to `bus`.
    pub fn new(
        store: Store,
        distance: DistanceProvider,
        bus: EventBus,
        matching: MatchingConfig,
    ) -> Self {
        let pending = PendingIndex::new();
        let sessions = SessionStore::new(
            store.clone(),
            bus.clone(),
            pending.clone(),
            matching.nearby_radius_km,
        );
        Self {
            inner: Arc::new(Inner {
                selector: CandidateSelector::new(distance, &matching),
                store,
                sessions,
                bus,
                pending,
                request_locks: KeyedLocks::new(),
                requester_locks: KeyedLocks::new(),
                timers: ReofferTimers::new(),
                matching,
            }),
        }
    }

    /// The session cache.
    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    /// The event bus the coordinator publishes to.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// The durable store.
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Requests currently waiting for a provider.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether an offer window is running for `id`.
    pub fn is_window_open(&self, id: RequestId) -> bool {
        self.inner.timers.is_armed(id)
    }

    // =========================================================================
    // Parties
    // =========================================================================

    /// Create or update a provider's profile. New providers start offline.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Validation`] for a malformed body, or
    /// [`DispatchError::Dependency`] if the store fails.
    pub async fn register_provider(
        &self,
        id: ProviderId,
        body: ProviderRegistration,
    ) -> Result<ProviderProfile, DispatchError> {
        body.validate()?;
        let profile = match self.inner.store.get_provider(id).await? {
            Some(existing) => ProviderProfile {
                name: body.name,
                image: body.image,
                ..existing
            },
            None => ProviderProfile {
                id,
                name: body.name,
                image: body.image,
                status: ProviderStatus::Offline,
                coordinates: None,
            },
        };
        self.inner.store.upsert_provider(&profile).await?;
        tracing::info!(provider_id = %id, "Provider profile saved");
        Ok(profile)
    }

    /// Create or update a requester's profile.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Validation`] for a malformed body, or
    /// [`DispatchError::Dependency`] if the store fails.
    pub async fn register_requester(
        &self,
        id: RequesterId,
        body: RequesterRegistration,
    ) -> Result<RequesterProfile, DispatchError> {
        body.validate()?;
        let profile = RequesterProfile {
            id,
            name: body.name,
            phone: body.phone,
        };
        self.inner.store.upsert_requester(&profile).await?;
        tracing::info!(requester_id = %id, "Requester profile saved");
        Ok(profile)
    }

    /// Fetch a provider profile.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NotFound`] for an unknown provider.
    pub async fn provider(&self, id: ProviderId) -> Result<ProviderProfile, DispatchError> {
        self.inner
            .store
            .get_provider(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("provider {id}")))
    }

    /// Fetch a requester profile.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NotFound`] for an unknown requester.
    pub async fn requester(&self, id: RequesterId) -> Result<RequesterProfile, DispatchError> {
        self.inner
            .store
            .get_requester(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("requester {id}")))
    }

    /// Go on or off shift.
    ///
    /// `engaged` is managed by dispatch and cannot be set directly, and an
    /// engaged provider cannot leave their session by going offline.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Validation`] when asked for `engaged`
    /// - [`DispatchError::NotFound`] for an unknown provider
    /// - [`DispatchError::StateConflict`] while engaged
    pub async fn set_availability(
        &self,
        id: ProviderId,
        status: ProviderStatus,
    ) -> Result<ProviderProfile, DispatchError> {
        if status == ProviderStatus::Engaged {
            return Err(DispatchError::Validation(String::from(
                "engaged is set by dispatch",
            )));
        }
        let mut profile = self.provider(id).await?;
        if profile.status == ProviderStatus::Engaged {
            return Err(DispatchError::conflict("provider", profile.status));
        }
        self.inner.store.set_provider_status(id, status).await?;
        profile.status = status;
        tracing::info!(provider_id = %id, %status, "Provider availability changed");
        Ok(profile)
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Providers that would be offered a request at `origin`, with the
    /// overall price range.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Validation`] for an invalid origin, or
    /// [`DispatchError::Dependency`] if the store fails.
    pub async fn nearby_providers(
        &self,
        origin: Coordinates,
        service_type: Option<&str>,
    ) -> Result<NearbyProviders, DispatchError> {
        check_coordinates(origin)?;
        let providers = self.inner.store.list_available_providers().await?;
        let candidates = self
            .inner
            .selector
            .select(
                origin,
                service_type.unwrap_or_default(),
                &providers,
                &BTreeSet::new(),
            )
            .await;
        let range = estimate_range(&candidates, self.inner.matching.estimate_spread);
        Ok(NearbyProviders {
            estimate_min: range.map(|(low, _)| low),
            estimate_max: range.map(|(_, high)| high),
            candidates,
        })
    }

    /// Open a request and offer it to every qualifying provider.
    ///
    /// When nobody qualifies the request is given up straight away and
    /// comes back cancelled.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Validation`] for a malformed body
    /// - [`DispatchError::NotFound`] for an unknown requester
    /// - [`DispatchError::StateConflict`] if the requester already has a
    ///   live session or an open request
    /// - [`DispatchError::Dependency`] if the store fails
    pub async fn create_request(
        &self,
        requester: RequesterId,
        body: NewRequest,
    ) -> Result<Request, DispatchError> {
        body.validate()?;
        check_coordinates(body.origin)?;

        let guard = self.inner.requester_locks.lock(&requester).await;
        let profile = self.requester(requester).await?;
        if let Some(active) = self
            .inner
            .store
            .find_active_session_for_party(Party::Requester(requester))
            .await?
        {
            return Err(DispatchError::conflict("session", active.status));
        }
        if let Some(open) = self
            .inner
            .store
            .find_open_request_for_requester(requester)
            .await?
        {
            return Err(DispatchError::conflict("request", open.status));
        }

        let request = Request {
            id: RequestId::new(),
            requester_id: requester,
            requester_name: profile.name,
            origin: body.origin,
            service_type: body.service_type,
            status: RequestStatus::Pending,
            provider_id: None,
            accepted_at: None,
            amount: None,
            created_at: Utc::now(),
        };
        self.inner.store.insert_request(&request).await?;
        let request_guard = self.inner.request_locks.lock(&request.id).await;
        drop(guard);
        tracing::info!(
            request_id = %request.id,
            requester_id = %requester,
            service_type = %request.service_type,
            "Request created"
        );

        let id = request.id;
        self.track(&request, BTreeSet::new());
        let window = self.inner.matching.offer_window();
        let outcome = match self.offer_round(&request, window).await {
            Ok(0) => self.give_up(request).await,
            Ok(_) => Ok(request),
            Err(e) => {
                tracing::warn!(request_id = %id, error = %e, "Offer round failed");
                self.give_up(request).await.and(Err(e))
            }
        };
        drop(request_guard);
        self.inner.requester_locks.release(&requester);
        self.release_if_done(id, &outcome);
        outcome
    }

    /// Accept a pending request on behalf of `provider`.
    ///
    /// Moves the request to accepted, engages the provider and opens the
    /// session, in that order; a failure at any step undoes the earlier
    /// ones. Other offers for the request are withdrawn.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NotFound`] for an unknown request or provider
    /// - [`DispatchError::StateConflict`] if the request is no longer
    ///   pending (someone else won) or the provider is not available
    /// - [`DispatchError::Forbidden`] if the request was never offered to
    ///   this provider or they already declined it
    /// - [`DispatchError::Dependency`] if the store fails
    pub async fn accept(
        &self,
        id: RequestId,
        provider_id: ProviderId,
    ) -> Result<Session, DispatchError> {
        let guard = self.inner.request_locks.lock(&id).await;
        let request = self.request(id).await?;
        if request.status != RequestStatus::Pending {
            return Err(DispatchError::conflict("request", request.status));
        }

        let entry = self.inner.pending.get(id);
        if let Some(entry) = &entry {
            if entry.excluded.contains(&provider_id) {
                return Err(DispatchError::Forbidden(String::from(
                    "provider already declined this request",
                )));
            }
            if entry.offer_for(provider_id).is_none() {
                return Err(DispatchError::Forbidden(String::from(
                    "request was not offered to this provider",
                )));
            }
        }

        let provider = self.provider(provider_id).await?;
        if provider.status != ProviderStatus::Available {
            return Err(DispatchError::conflict("provider", provider.status));
        }
        let amount = match entry.as_ref().and_then(|e| e.offer_for(provider_id)) {
            Some(offer) => offer.price_estimate,
            None => self.quote(&request, &provider),
        };

        let now = Utc::now();
        let accepted = Request {
            status: RequestStatus::Accepted,
            provider_id: Some(provider_id),
            accepted_at: Some(now),
            amount: Some(amount),
            ..request.clone()
        };
        self.inner
            .store
            .compare_and_set_request(&accepted, RequestStatus::Pending)
            .await?;

        if let Err(e) = self
            .inner
            .store
            .set_provider_status(provider_id, ProviderStatus::Engaged)
            .await
        {
            self.restore_request(&request, RequestStatus::Accepted).await;
            return Err(e.into());
        }

        let first_point = provider.coordinates.map(|c| LocationPoint::at(c, None, now));
        let session = Session {
            id,
            requester_id: request.requester_id,
            requester_name: request.requester_name.clone(),
            provider_id,
            provider_name: provider.name.clone(),
            provider_image: provider.image.clone(),
            service_type: request.service_type.clone(),
            origin: request.origin,
            status: SessionStatus::Accepted,
            current: first_point.clone(),
            location_history: first_point.into_iter().collect(),
            chat: Vec::new(),
            payment: Payment::default(),
            amount,
            accepted_at: now,
            metadata: [(String::from("accepted_at"), serde_json::json!(now))].into(),
            created_at: now,
            updated_at: now,
        };
        let session = match self.inner.sessions.upsert(session).await {
            Ok(session) => session,
            Err(e) => {
                self.release_provider(provider_id).await;
                self.restore_request(&request, RequestStatus::Accepted).await;
                return Err(e);
            }
        };

        self.inner.timers.disarm(id);
        let withdrawn = self
            .inner
            .pending
            .remove(id)
            .map(|e| {
                e.offered_ids()
                    .into_iter()
                    .filter(|p| *p != provider_id)
                    .collect()
            })
            .unwrap_or_default();
        drop(guard);

        tracing::info!(request_id = %id, %provider_id, %amount, "Request accepted");
        self.inner.bus.publish(DispatchEvent::Accepted(Acceptance {
            request_id: id,
            requester_id: request.requester_id,
            provider_id,
            provider_name: provider.name,
            provider_image: provider.image,
            provider_coords: provider.coordinates,
            amount,
            withdrawn,
        }));
        Ok(session)
    }

    /// Turn down a request.
    ///
    /// On a pending request this declines one offer; once every offered
    /// provider has declined, a fresh round goes out to whoever is left.
    /// On a request this provider already accepted, the acceptance is
    /// revoked: the session is cancelled, the provider freed, and the
    /// request re-offered to everyone else under the short re-offer window.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NotFound`] for an unknown request
    /// - [`DispatchError::Forbidden`] if the request was never offered to
    ///   this provider
    /// - [`DispatchError::StateConflict`] if the request was taken by
    ///   someone else, was cancelled, or its session has moved past accepted
    /// - [`DispatchError::Dependency`] if the store fails
    pub async fn reject(
        &self,
        id: RequestId,
        provider_id: ProviderId,
    ) -> Result<RejectOutcome, DispatchError> {
        let guard = self.inner.request_locks.lock(&id).await;
        let request = self.request(id).await?;
        let outcome = match request.status {
            RequestStatus::Accepted if request.provider_id == Some(provider_id) => {
                self.revoke(request, provider_id).await
            }
            RequestStatus::Pending => self.decline(request, provider_id).await,
            status => Err(DispatchError::conflict("request", status)),
        };
        drop(guard);
        if matches!(outcome, Ok(RejectOutcome::NoProviderAvailable)) {
            self.inner.request_locks.release(&id);
        }
        outcome
    }

    /// Withdraw a request before or after it was accepted.
    ///
    /// A pending request is simply cancelled and its offers withdrawn. An
    /// accepted one cancels its session as well.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NotFound`] for an unknown request
    /// - [`DispatchError::Forbidden`] if `requester` did not open it
    /// - [`DispatchError::StateConflict`] if it is already cancelled or its
    ///   session can no longer be cancelled
    /// - [`DispatchError::Dependency`] if the store fails
    pub async fn cancel_request(
        &self,
        id: RequestId,
        requester: RequesterId,
    ) -> Result<Request, DispatchError> {
        let guard = self.inner.request_locks.lock(&id).await;
        let request = self.request(id).await?;
        if request.requester_id != requester {
            return Err(DispatchError::Forbidden(String::from(
                "only the requester may cancel this request",
            )));
        }

        let cancelled = match request.status {
            RequestStatus::Pending => {
                let cancelled = Request {
                    status: RequestStatus::Cancelled,
                    ..request
                };
                self.inner
                    .store
                    .compare_and_set_request(&cancelled, RequestStatus::Pending)
                    .await?;
                self.inner.timers.disarm(id);
                let withdrawn = self
                    .inner
                    .pending
                    .remove(id)
                    .map(|e| e.offered_ids())
                    .unwrap_or_default();
                tracing::info!(request_id = %id, "Pending request cancelled");
                self.inner.bus.publish(DispatchEvent::Cancelled(Cancellation {
                    request_id: id,
                    requester_id: requester,
                    provider_id: None,
                    withdrawn,
                    actor: PartyRole::Requester,
                }));
                cancelled
            }
            RequestStatus::Accepted => {
                self.cancel_session(id, Party::Requester(requester)).await?;
                self.request(id).await?
            }
            RequestStatus::Cancelled => {
                return Err(DispatchError::conflict("request", request.status));
            }
        };
        drop(guard);
        self.inner.request_locks.release(&id);
        Ok(cancelled)
    }

    /// Fetch a request visible to `party`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NotFound`] for an unknown request, or
    /// [`DispatchError::Forbidden`] if `party` neither opened nor accepted it.
    pub async fn get_request(&self, id: RequestId, party: Party) -> Result<Request, DispatchError> {
        let request = self.request(id).await?;
        let visible = match party {
            Party::Requester(r) => request.requester_id == r,
            Party::Provider(p) => {
                request.provider_id == Some(p)
                    || self
                        .inner
                        .pending
                        .get(id)
                        .is_some_and(|e| e.offer_for(p).is_some())
            }
        };
        if !visible {
            return Err(DispatchError::Forbidden(String::from(
                "request belongs to another party",
            )));
        }
        Ok(request)
    }

    /// Re-offer every request left pending by a previous run.
    ///
    /// Returns how many requests are waiting again.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Dependency`] if the pending list cannot be read.
    pub async fn resume_pending(&self) -> Result<usize, DispatchError> {
        let requests = self.inner.store.list_pending_requests().await?;
        let mut resumed: usize = 0;
        for request in requests {
            let id = request.id;
            let guard = self.inner.request_locks.lock(&id).await;
            self.track(&request, BTreeSet::new());
            match self
                .offer_round(&request, self.inner.matching.offer_window())
                .await
            {
                Ok(0) => {
                    if let Err(e) = self.give_up(request).await {
                        tracing::warn!(request_id = %id, error = %e, "Could not give up stale request");
                    }
                }
                Ok(_) => resumed = resumed.saturating_add(1),
                Err(e) => {
                    self.inner.pending.remove(id);
                    tracing::warn!(request_id = %id, error = %e, "Could not resume request");
                }
            }
            drop(guard);
        }
        tracing::info!(resumed, "Pending requests resumed");
        Ok(resumed)
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Provider sets off towards the requester.
    ///
    /// # Errors
    ///
    /// See [`SessionStore::set_status`].
    pub async fn start_progress(
        &self,
        id: SessionId,
        actor: Party,
    ) -> Result<Session, DispatchError> {
        self.advance(id, actor, SessionStatus::InProgress, &[PartyRole::Provider])
            .await
    }

    /// Provider reached the requester.
    ///
    /// # Errors
    ///
    /// See [`SessionStore::set_status`].
    pub async fn mark_arrived(&self, id: SessionId, actor: Party) -> Result<Session, DispatchError> {
        self.advance(
            id,
            actor,
            SessionStatus::ProviderArrived,
            &[PartyRole::Provider],
        )
        .await
    }

    /// Care delivered. Either party may complete; the provider is freed.
    ///
    /// # Errors
    ///
    /// See [`SessionStore::set_status`].
    pub async fn complete(&self, id: SessionId, actor: Party) -> Result<Session, DispatchError> {
        self.advance(
            id,
            actor,
            SessionStatus::Completed,
            &[PartyRole::Provider, PartyRole::Requester],
        )
        .await
    }

    /// Call off a live session. Either party may cancel before arrival.
    ///
    /// # Errors
    ///
    /// See [`SessionStore::set_status`].
    pub async fn cancel(&self, id: SessionId, actor: Party) -> Result<Session, DispatchError> {
        let guard = self.inner.request_locks.lock(&id).await;
        let session = self.cancel_session(id, actor).await;
        drop(guard);
        if session.is_ok() {
            self.inner.request_locks.release(&id);
        }
        session
    }

    /// Record payment details on a session.
    ///
    /// # Errors
    ///
    /// See [`SessionStore::update_payment`].
    pub async fn update_payment(
        &self,
        id: SessionId,
        actor: Party,
        update: &PaymentUpdate,
    ) -> Result<Session, DispatchError> {
        self.inner.sessions.update_payment(id, actor, update).await
    }

    /// Post a chat line to a session.
    ///
    /// # Errors
    ///
    /// See [`SessionStore::append_chat`].
    pub async fn post_chat(
        &self,
        id: SessionId,
        sender: Party,
        claimed: Option<PartyRole>,
        text: &str,
    ) -> Result<carelink_types::ChatMessage, DispatchError> {
        self.inner
            .sessions
            .append_chat(id, sender, claimed, text)
            .await
    }

    /// Take a provider's position report.
    ///
    /// With a live session the point joins its history. Without one the
    /// provider's idle position is updated so they can be matched, and
    /// nearby pending requesters are told.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Validation`] for a malformed report
    /// - [`DispatchError::Forbidden`] for a session that is not the provider's
    /// - [`DispatchError::StateConflict`] if the named session has ended
    /// - [`DispatchError::Dependency`] if the store fails
    pub async fn update_location(
        &self,
        provider: ProviderId,
        report: &LocationReport,
    ) -> Result<LocationOutcome, DispatchError> {
        report.validate()?;
        check_coordinates(report.coords)?;

        let session_id = match report.session_id {
            Some(id) => Some(id),
            None => self
                .inner
                .sessions
                .get_for_party(Party::Provider(provider))
                .await?
                .map(|s| s.id),
        };

        if let Some(session_id) = session_id {
            let point = self
                .inner
                .sessions
                .append_location(session_id, provider, report.coords, report.accuracy)
                .await?;
            return Ok(LocationOutcome::Session { session_id, point });
        }

        let profile = self.provider(provider).await?;
        self.inner
            .store
            .set_provider_coordinates(provider, report.coords)
            .await?;
        let nearby = self
            .inner
            .sessions
            .announce_nearby(provider, &profile.name, report.coords, None);
        Ok(LocationOutcome::Idle { nearby })
    }

    /// The live session `party` takes part in, if any.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Dependency`] if the store fails.
    pub async fn active_session_for(&self, party: Party) -> Result<Option<Session>, DispatchError> {
        self.inner.sessions.get_for_party(party).await
    }

    /// Every session `party` has taken part in, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Dependency`] if the store fails.
    pub async fn session_history_for(&self, party: Party) -> Result<Vec<Session>, DispatchError> {
        Ok(self.inner.store.list_sessions_for_party(party).await?)
    }

    /// Fetch a session `party` takes part in.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NotFound`] for an unknown session, or
    /// [`DispatchError::Forbidden`] if `party` is not part of it.
    pub async fn get_session(&self, id: SessionId, party: Party) -> Result<Session, DispatchError> {
        let session = self
            .inner
            .sessions
            .get(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("session {id}")))?;
        if !session.involves(party) {
            return Err(DispatchError::Forbidden(String::from(
                "not a party to this session",
            )));
        }
        Ok(session)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn request(&self, id: RequestId) -> Result<Request, DispatchError> {
        self.inner
            .store
            .get_request(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("request {id}")))
    }

    /// Put a pending request in the index with no offers yet.
    fn track(&self, request: &Request, excluded: BTreeSet<ProviderId>) {
        self.inner.pending.insert(
            request.id,
            PendingEntry {
                requester_id: request.requester_id,
                requester_name: request.requester_name.clone(),
                origin: request.origin,
                service_type: request.service_type.clone(),
                offered: Vec::new(),
                excluded,
                round: 0,
            },
        );
    }

    /// Offer a tracked request to every qualifying provider not yet
    /// excluded, and open a window of `window`. Returns how many were
    /// offered; zero leaves the timer and bus untouched.
    async fn offer_round(
        &self,
        request: &Request,
        window: std::time::Duration,
    ) -> Result<usize, DispatchError> {
        let excluded = self
            .inner
            .pending
            .get(request.id)
            .map(|e| e.excluded)
            .unwrap_or_default();
        let providers = self.inner.store.list_available_providers().await?;
        let offers = self
            .inner
            .selector
            .select(request.origin, &request.service_type, &providers, &excluded)
            .await;
        if offers.is_empty() {
            return Ok(0);
        }

        let count = offers.len();
        let Some(round) = self.inner.pending.set_offered(request.id, offers.clone()) else {
            return Ok(0);
        };
        self.arm_window(request.id, round, window);
        tracing::info!(request_id = %request.id, offered = count, "Offers sent");
        self.inner.bus.publish(DispatchEvent::OfferCreated(OfferBatch {
            request_id: request.id,
            requester_id: request.requester_id,
            requester_name: request.requester_name.clone(),
            origin: request.origin,
            service_type: request.service_type.clone(),
            offers,
        }));
        Ok(count)
    }

    fn arm_window(&self, id: RequestId, round: u64, window: std::time::Duration) {
        let coordinator = self.clone();
        self.inner.timers.arm(id, window, async move {
            coordinator.expire(id, round).await;
        });
    }

    /// The window of offer `round` lapsed. Gives up if the request is still
    /// pending and no later round has replaced it.
    async fn expire(&self, id: RequestId, round: u64) {
        let guard = self.inner.request_locks.lock(&id).await;
        if self.inner.pending.is_current_round(id, round) {
            self.give_up_lapsed(id).await;
        } else {
            tracing::debug!(request_id = %id, round, "Window lapsed for a superseded round");
        }
        drop(guard);
        self.inner.request_locks.release(&id);
    }

    /// Caller holds the request lock.
    async fn give_up_lapsed(&self, id: RequestId) {
        match self.inner.store.get_request(id).await {
            Ok(Some(request)) if request.status == RequestStatus::Pending => {
                if let Err(e) = self.give_up(request).await {
                    tracing::warn!(request_id = %id, error = %e, "Could not give up request");
                }
            }
            Ok(_) => {
                tracing::debug!(request_id = %id, "Window lapsed after request settled");
            }
            Err(e) => {
                tracing::warn!(request_id = %id, error = %e, "Could not read expired request");
            }
        }
    }

    /// Cancel a pending request nobody took and tell the requester.
    /// Caller holds the request lock.
    async fn give_up(&self, request: Request) -> Result<Request, DispatchError> {
        let id = request.id;
        let cancelled = Request {
            status: RequestStatus::Cancelled,
            ..request
        };
        self.inner
            .store
            .compare_and_set_request(&cancelled, RequestStatus::Pending)
            .await?;
        self.inner.timers.disarm(id);
        let withdrawn = self
            .inner
            .pending
            .remove(id)
            .map(|e| e.offered_ids())
            .unwrap_or_default();
        tracing::info!(request_id = %id, "No provider available");
        self.inner
            .bus
            .publish(DispatchEvent::NoProviderAvailable(MatchNotice {
                request_id: id,
                requester_id: cancelled.requester_id,
                withdrawn,
            }));
        Ok(cancelled)
    }

    /// One offered provider declines a pending request.
    async fn decline(
        &self,
        request: Request,
        provider_id: ProviderId,
    ) -> Result<RejectOutcome, DispatchError> {
        let id = request.id;
        let Some(entry) = self.inner.pending.get(id) else {
            return Ok(RejectOutcome::Declined);
        };
        if entry.excluded.contains(&provider_id) {
            return Ok(RejectOutcome::Declined);
        }
        if entry.offer_for(provider_id).is_none() {
            return Err(DispatchError::Forbidden(String::from(
                "request was not offered to this provider",
            )));
        }

        let remaining = self
            .inner
            .pending
            .decline(id, provider_id)
            .map_or(0, |e| e.offered.len());
        tracing::info!(request_id = %id, %provider_id, remaining, "Offer declined");
        if remaining > 0 {
            return Ok(RejectOutcome::Declined);
        }

        self.retry(request).await
    }

    /// The provider who accepted backs out before setting off.
    async fn revoke(
        &self,
        request: Request,
        provider_id: ProviderId,
    ) -> Result<RejectOutcome, DispatchError> {
        let id = request.id;
        let transition = Transition {
            next: SessionStatus::Cancelled,
            allowed: &[PartyRole::Provider],
            reason: Some("provider_rejected"),
        };
        let actor = Party::Provider(provider_id);
        let session = self
            .inner
            .sessions
            .check_status(id, actor, transition)
            .await?;
        if session.status != SessionStatus::Accepted {
            return Err(DispatchError::conflict("session", session.status));
        }

        let reverted = Request {
            status: RequestStatus::Pending,
            provider_id: None,
            accepted_at: None,
            amount: None,
            ..request.clone()
        };
        self.inner
            .store
            .compare_and_set_request(&reverted, RequestStatus::Accepted)
            .await?;
        if let Err(e) = self.inner.sessions.set_status(id, actor, transition).await {
            self.restore_request(&request, RequestStatus::Pending).await;
            return Err(e);
        }
        self.release_provider(provider_id).await;

        self.track(&reverted, BTreeSet::from([provider_id]));
        tracing::info!(request_id = %id, %provider_id, "Acceptance revoked, re-offering");
        self.inner
            .bus
            .publish(DispatchEvent::OfferRejectedRetry(MatchNotice {
                request_id: id,
                requester_id: reverted.requester_id,
                withdrawn: Vec::new(),
            }));

        self.retry(reverted).await
    }

    /// Run another offer round under the re-offer window, giving up if
    /// nobody is left.
    async fn retry(&self, request: Request) -> Result<RejectOutcome, DispatchError> {
        let id = request.id;
        match self
            .offer_round(&request, self.inner.matching.reoffer_window())
            .await
        {
            Ok(0) => {
                self.give_up(request).await?;
                Ok(RejectOutcome::NoProviderAvailable)
            }
            Ok(candidates) => Ok(RejectOutcome::Reoffered { candidates }),
            Err(e) => {
                tracing::warn!(request_id = %id, error = %e, "Re-offer failed");
                self.give_up(request).await?;
                Ok(RejectOutcome::NoProviderAvailable)
            }
        }
    }

    /// Apply a non-cancelling session transition and announce it.
    async fn advance(
        &self,
        id: SessionId,
        actor: Party,
        next: SessionStatus,
        allowed: &[PartyRole],
    ) -> Result<Session, DispatchError> {
        let guard = self.inner.request_locks.lock(&id).await;
        let (session, role) = self
            .inner
            .sessions
            .set_status(
                id,
                actor,
                Transition {
                    next,
                    allowed,
                    reason: None,
                },
            )
            .await?;
        if next.is_terminal() {
            self.release_provider(session.provider_id).await;
        }
        drop(guard);

        let change = StatusChange {
            session_id: id,
            requester_id: session.requester_id,
            provider_id: session.provider_id,
            status: next,
            actor: role,
        };
        let event = match next {
            SessionStatus::InProgress => Some(DispatchEvent::InProgress(change)),
            SessionStatus::ProviderArrived => Some(DispatchEvent::Arrived(change)),
            SessionStatus::Completed => Some(DispatchEvent::Completed(change)),
            SessionStatus::Accepted | SessionStatus::Cancelled => None,
        };
        if let Some(event) = event {
            self.inner.bus.publish(event);
        }
        if next.is_terminal() {
            self.inner.request_locks.release(&id);
        }
        Ok(session)
    }

    /// Cancel a live session and its request. Caller holds the request lock.
    async fn cancel_session(&self, id: SessionId, actor: Party) -> Result<Session, DispatchError> {
        let transition = Transition {
            next: SessionStatus::Cancelled,
            allowed: &[PartyRole::Provider, PartyRole::Requester],
            reason: None,
        };
        self.inner
            .sessions
            .check_status(id, actor, transition)
            .await?;

        let request = self
            .inner
            .store
            .get_request(id)
            .await?
            .filter(|r| r.status == RequestStatus::Accepted);
        if let Some(request) = &request {
            let cancelled = Request {
                status: RequestStatus::Cancelled,
                ..request.clone()
            };
            self.inner
                .store
                .compare_and_set_request(&cancelled, RequestStatus::Accepted)
                .await?;
        }

        let (session, role) = match self.inner.sessions.set_status(id, actor, transition).await {
            Ok(done) => done,
            Err(e) => {
                if let Some(request) = &request {
                    self.restore_request(request, RequestStatus::Cancelled).await;
                }
                return Err(e);
            }
        };
        self.release_provider(session.provider_id).await;

        self.inner.bus.publish(DispatchEvent::Cancelled(Cancellation {
            request_id: id,
            requester_id: session.requester_id,
            provider_id: Some(session.provider_id),
            withdrawn: Vec::new(),
            actor: role,
        }));
        Ok(session)
    }

    /// Price for a provider accepting without a recorded offer line.
    fn quote(&self, request: &Request, provider: &ProviderProfile) -> rust_decimal::Decimal {
        let km = provider
            .coordinates
            .map_or(0.0, |c| request.origin.haversine_km(&c));
        self.inner
            .selector
            .price_for((km * 100.0).round() / 100.0)
            .unwrap_or(self.inner.matching.base_charge)
    }

    /// Put a request back as it was, after a later step failed.
    async fn restore_request(&self, original: &Request, from: RequestStatus) {
        if let Err(e) = self
            .inner
            .store
            .compare_and_set_request(original, from)
            .await
        {
            tracing::error!(
                request_id = %original.id,
                error = %e,
                "Could not restore request after failed transition"
            );
        }
    }

    /// Make a provider available again after their session ended.
    async fn release_provider(&self, provider_id: ProviderId) {
        if let Err(e) = self
            .inner
            .store
            .set_provider_status(provider_id, ProviderStatus::Available)
            .await
        {
            tracing::error!(%provider_id, error = %e, "Could not release provider");
        }
    }

    /// Drop the request's lock entry once it can no longer change.
    fn release_if_done(&self, id: RequestId, outcome: &Result<Request, DispatchError>) {
        if outcome
            .as_ref()
            .map_or(true, |r| r.status == RequestStatus::Cancelled)
        {
            self.inner.request_locks.release(&id);
        }
    }
}

fn check_coordinates(coords: Coordinates) -> Result<(), DispatchError> {
    if coords.is_valid() {
        Ok(())
    } else {
        Err(DispatchError::Validation(format!(
            "invalid coordinates ({}, {})",
            coords.latitude, coords.longitude
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use std::time::Duration;

    use carelink_db::MemoryStore;

    use super::*;
    use crate::bus::{Subscription, Topic, TopicFilter};

    /// Kilometres per degree of latitude on the haversine sphere.
    const KM_PER_DEGREE: f64 = 6371.0 * std::f64::consts::PI / 180.0;

    fn origin() -> Coordinates {
        Coordinates::new(12.97, 77.59)
    }

    fn north(km: f64) -> Coordinates {
        Coordinates::new(12.97 + km / KM_PER_DEGREE, 77.59)
    }

    struct Fixture {
        memory: MemoryStore,
        dispatch: DispatchCoordinator,
        requester: RequesterId,
    }

    impl Fixture {
        async fn new() -> Self {
            let memory = MemoryStore::new();
            let dispatch = DispatchCoordinator::new(
                Store::Memory(memory.clone()),
                DistanceProvider::Haversine,
                EventBus::default(),
                MatchingConfig::default(),
            );
            let requester = RequesterId::new();
            dispatch
                .register_requester(
                    requester,
                    RequesterRegistration {
                        name: String::from("Asha"),
                        phone: None,
                    },
                )
                .await
                .unwrap();
            Self {
                memory,
                dispatch,
                requester,
            }
        }

        async fn provider(&self, name: &str, km: f64) -> ProviderId {
            let id = ProviderId::new();
            self.dispatch
                .register_provider(
                    id,
                    ProviderRegistration {
                        name: name.to_owned(),
                        image: None,
                    },
                )
                .await
                .unwrap();
            self.memory.set_provider_coordinates(id, north(km)).unwrap();
            self.dispatch
                .set_availability(id, ProviderStatus::Available)
                .await
                .unwrap();
            id
        }

        async fn request(&self) -> Request {
            self.dispatch
                .create_request(
                    self.requester,
                    NewRequest {
                        origin: origin(),
                        service_type: String::from("elder_care"),
                    },
                )
                .await
                .unwrap()
        }

        fn watch(&self, topics: Vec<Topic>) -> Subscription {
            self.dispatch.bus().subscribe(TopicFilter::Only(topics))
        }
    }

    async fn next_event(sub: &mut Subscription) -> DispatchEvent {
        tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn create_offers_nearest_first() {
        let f = Fixture::new().await;
        f.provider("far", 45.0).await;
        let ten = f.provider("ten", 10.0).await;
        let five = f.provider("five", 5.0).await;
        let mut sub = f.watch(vec![Topic::OfferCreated]);

        let request = f.request().await;
        assert_eq!(request.status, RequestStatus::Pending);
        assert!(f.dispatch.is_window_open(request.id));

        match next_event(&mut sub).await {
            DispatchEvent::OfferCreated(batch) => {
                let ids: Vec<_> = batch.offers.iter().map(|o| o.provider_id).collect();
                assert_eq!(ids, vec![five, ten]);
                assert_eq!(batch.requester_name, "Asha");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_candidates_gives_up_at_once() {
        let f = Fixture::new().await;
        let mut sub = f.watch(vec![Topic::NoProviderAvailable, Topic::OfferCreated]);
        let request = f.request().await;
        assert_eq!(request.status, RequestStatus::Cancelled);
        assert!(matches!(
            next_event(&mut sub).await,
            DispatchEvent::NoProviderAvailable(_)
        ));
        assert_eq!(f.dispatch.pending_count(), 0);
    }

    #[tokio::test]
    async fn one_open_request_per_requester() {
        let f = Fixture::new().await;
        f.provider("near", 1.0).await;
        f.request().await;
        let err = f
            .dispatch
            .create_request(
                f.requester,
                NewRequest {
                    origin: origin(),
                    service_type: String::from("elder_care"),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.current_status(), Some("pending"));
    }

    #[tokio::test]
    async fn concurrent_accepts_have_one_winner() {
        let f = Fixture::new().await;
        let a = f.provider("a", 2.0).await;
        let b = f.provider("b", 3.0).await;
        let request = f.request().await;

        let (ra, rb) = tokio::join!(
            f.dispatch.accept(request.id, a),
            f.dispatch.accept(request.id, b)
        );
        let (winner, loser) = match (ra, rb) {
            (Ok(s), Err(e)) => ((s, a), (e, b)),
            (Err(e), Ok(s)) => ((s, b), (e, a)),
            other => panic!("expected exactly one winner, got {other:?}"),
        };
        assert_eq!(winner.0.provider_id, winner.1);
        assert_eq!(loser.0.current_status(), Some("accepted"));

        let stored = f.memory.get_request(request.id).unwrap();
        assert_eq!(stored.status, RequestStatus::Accepted);
        assert_eq!(stored.provider_id, Some(winner.1));
        assert_eq!(
            f.memory.get_provider(winner.1).unwrap().status,
            ProviderStatus::Engaged
        );
        assert_eq!(
            f.memory.get_provider(loser.1).unwrap().status,
            ProviderStatus::Available
        );
        assert!(!f.dispatch.is_window_open(request.id));
    }

    #[tokio::test]
    async fn acceptance_withdraws_other_offers() {
        let f = Fixture::new().await;
        let a = f.provider("a", 2.0).await;
        let b = f.provider("b", 3.0).await;
        let request = f.request().await;
        let mut sub = f.watch(vec![Topic::Accepted]);

        let session = f.dispatch.accept(request.id, a).await.unwrap();
        assert_eq!(session.amount, f.memory.get_request(request.id).unwrap().amount.unwrap());
        assert_eq!(session.location_history.len(), 1);

        match next_event(&mut sub).await {
            DispatchEvent::Accepted(acceptance) => {
                assert_eq!(acceptance.provider_id, a);
                assert_eq!(acceptance.withdrawn, vec![b]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn accept_rolls_back_when_store_fails() {
        let f = Fixture::new().await;
        let a = f.provider("a", 2.0).await;
        let request = f.request().await;

        f.memory.set_write_failure(true);
        let err = f.dispatch.accept(request.id, a).await.unwrap_err();
        assert!(matches!(err, DispatchError::Dependency(_)));
        f.memory.set_write_failure(false);

        let stored = f.memory.get_request(request.id).unwrap();
        assert_eq!(stored.status, RequestStatus::Pending);
        assert!(f.memory.get_session(request.id).is_none());
        assert!(f.dispatch.is_window_open(request.id));

        let session = f.dispatch.accept(request.id, a).await.unwrap();
        assert_eq!(session.provider_id, a);
    }

    #[tokio::test]
    async fn unoffered_provider_cannot_accept() {
        let f = Fixture::new().await;
        f.provider("near", 2.0).await;
        let request = f.request().await;
        let late = f.provider("late", 1.0).await;
        let err = f.dispatch.accept(request.id, late).await.unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn revoked_acceptance_reoffers_then_gives_up_once() {
        let f = Fixture::new().await;
        let a = f.provider("a", 2.0).await;
        let b = f.provider("b", 3.0).await;
        let request = f.request().await;
        f.dispatch.accept(request.id, a).await.unwrap();

        let mut sub = f.watch(vec![
            Topic::OfferRejectedRetry,
            Topic::OfferCreated,
            Topic::NoProviderAvailable,
        ]);
        let outcome = f.dispatch.reject(request.id, a).await.unwrap();
        assert_eq!(outcome, RejectOutcome::Reoffered { candidates: 1 });
        assert_eq!(
            f.memory.get_provider(a).unwrap().status,
            ProviderStatus::Available
        );
        let cancelled = f.memory.get_session(request.id).unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);

        assert!(matches!(
            next_event(&mut sub).await,
            DispatchEvent::OfferRejectedRetry(_)
        ));
        match next_event(&mut sub).await {
            DispatchEvent::OfferCreated(batch) => {
                let ids: Vec<_> = batch.offers.iter().map(|o| o.provider_id).collect();
                assert_eq!(ids, vec![b]);
            }
            other => panic!("unexpected {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert!(matches!(
            next_event(&mut sub).await,
            DispatchEvent::NoProviderAvailable(_)
        ));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(
            tokio::time::timeout(Duration::from_millis(10), sub.recv())
                .await
                .is_err()
        );
        assert_eq!(
            f.memory.get_request(request.id).unwrap().status,
            RequestStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn revoke_with_nobody_left_gives_up() {
        let f = Fixture::new().await;
        let a = f.provider("a", 2.0).await;
        let request = f.request().await;
        f.dispatch.accept(request.id, a).await.unwrap();

        let outcome = f.dispatch.reject(request.id, a).await.unwrap();
        assert_eq!(outcome, RejectOutcome::NoProviderAvailable);
        assert_eq!(
            f.memory.get_request(request.id).unwrap().status,
            RequestStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn everyone_declining_gives_up() {
        let f = Fixture::new().await;
        let a = f.provider("a", 2.0).await;
        let b = f.provider("b", 3.0).await;
        let request = f.request().await;

        assert_eq!(
            f.dispatch.reject(request.id, a).await.unwrap(),
            RejectOutcome::Declined
        );
        assert_eq!(
            f.dispatch.reject(request.id, b).await.unwrap(),
            RejectOutcome::NoProviderAvailable
        );
        let err = f.dispatch.accept(request.id, a).await.unwrap_err();
        assert_eq!(err.current_status(), Some("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_suppresses_pending_window() {
        let f = Fixture::new().await;
        f.provider("a", 2.0).await;
        let request = f.request().await;
        let mut sub = f.watch(vec![Topic::Cancelled, Topic::NoProviderAvailable]);

        let cancelled = f
            .dispatch
            .cancel_request(request.id, f.requester)
            .await
            .unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);
        assert!(matches!(
            next_event(&mut sub).await,
            DispatchEvent::Cancelled(_)
        ));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(
            tokio::time::timeout(Duration::from_millis(10), sub.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_window_gives_up() {
        let f = Fixture::new().await;
        f.provider("a", 2.0).await;
        let request = f.request().await;
        let mut sub = f.watch(vec![Topic::NoProviderAvailable]);

        tokio::time::sleep(Duration::from_millis(30_100)).await;
        assert!(matches!(
            next_event(&mut sub).await,
            DispatchEvent::NoProviderAvailable(_)
        ));
        assert_eq!(
            f.memory.get_request(request.id).unwrap().status,
            RequestStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn full_session_lifecycle() {
        let f = Fixture::new().await;
        let a = f.provider("a", 2.0).await;
        let request = f.request().await;
        let provider = Party::Provider(a);
        let requester = Party::Requester(f.requester);
        f.dispatch.accept(request.id, a).await.unwrap();

        let err = f.dispatch.complete(request.id, provider).await.unwrap_err();
        assert_eq!(err.current_status(), Some("accepted"));
        let err = f
            .dispatch
            .start_progress(request.id, requester)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));

        f.dispatch.start_progress(request.id, provider).await.unwrap();
        let outcome = f
            .dispatch
            .update_location(
                a,
                &LocationReport {
                    session_id: None,
                    coords: north(1.0),
                    accuracy: Some(5.0),
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, LocationOutcome::Session { .. }));
        f.dispatch.mark_arrived(request.id, provider).await.unwrap();
        let err = f.dispatch.cancel(request.id, requester).await.unwrap_err();
        assert_eq!(err.current_status(), Some("provider_arrived"));
        let done = f.dispatch.complete(request.id, requester).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);

        assert_eq!(
            f.memory.get_provider(a).unwrap().status,
            ProviderStatus::Available
        );
        assert!(f.dispatch.active_session_for(requester).await.unwrap().is_none());
        let history = f.dispatch.session_history_for(provider).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].location_history.len(), 2);
    }

    #[tokio::test]
    async fn requester_cancels_accepted_request() {
        let f = Fixture::new().await;
        let a = f.provider("a", 2.0).await;
        let request = f.request().await;
        f.dispatch.accept(request.id, a).await.unwrap();

        let cancelled = f
            .dispatch
            .cancel_request(request.id, f.requester)
            .await
            .unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);
        let session = f.memory.get_session(request.id).unwrap();
        assert_eq!(session.status, SessionStatus::Cancelled);
        assert_eq!(session.metadata["cancelled_by"], "requester");
        assert_eq!(
            f.memory.get_provider(a).unwrap().status,
            ProviderStatus::Available
        );
    }

    #[tokio::test]
    async fn engaged_provider_cannot_go_offline() {
        let f = Fixture::new().await;
        let a = f.provider("a", 2.0).await;
        let request = f.request().await;
        f.dispatch.accept(request.id, a).await.unwrap();
        let err = f
            .dispatch
            .set_availability(a, ProviderStatus::Offline)
            .await
            .unwrap_err();
        assert_eq!(err.current_status(), Some("engaged"));
    }

    #[tokio::test]
    async fn idle_location_updates_profile() {
        let f = Fixture::new().await;
        let a = f.provider("a", 50.0).await;
        let outcome = f
            .dispatch
            .update_location(
                a,
                &LocationReport {
                    session_id: None,
                    coords: north(1.0),
                    accuracy: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, LocationOutcome::Idle { nearby: 0 });
        let nearby = f.dispatch.nearby_providers(origin(), None).await.unwrap();
        assert_eq!(nearby.candidates.len(), 1);
        assert_eq!(nearby.estimate_min, Some(rust_decimal::Decimal::new(5400, 2)));
    }

    fn stored_pending(requester: RequesterId) -> Request {
        Request {
            id: RequestId::new(),
            requester_id: requester,
            requester_name: String::from("Asha"),
            origin: origin(),
            service_type: String::from("elder_care"),
            status: RequestStatus::Pending,
            provider_id: None,
            accepted_at: None,
            amount: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn resume_reoffers_stored_pending_requests() {
        let f = Fixture::new().await;
        let near = f.provider("near", 2.0).await;
        let stored = stored_pending(f.requester);
        f.memory.insert_request(&stored).unwrap();
        let mut sub = f.watch(vec![Topic::OfferCreated]);

        assert_eq!(f.dispatch.resume_pending().await.unwrap(), 1);
        assert!(f.dispatch.is_window_open(stored.id));
        match next_event(&mut sub).await {
            DispatchEvent::OfferCreated(batch) => {
                assert_eq!(batch.request_id, stored.id);
                assert_eq!(batch.offers[0].provider_id, near);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_without_providers_cancels_stale_request() {
        let f = Fixture::new().await;
        let stored = stored_pending(f.requester);
        f.memory.insert_request(&stored).unwrap();

        assert_eq!(f.dispatch.resume_pending().await.unwrap(), 0);
        assert_eq!(
            f.memory.get_request(stored.id).unwrap().status,
            RequestStatus::Cancelled
        );
        assert_eq!(f.dispatch.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_window_spares_round_opened_meanwhile() {
        let f = Fixture::new().await;
        let a = f.provider("a", 2.0).await;
        let request = f.request().await;
        let mut sub = f.watch(vec![Topic::NoProviderAvailable]);

        // A decline is mid-flight when the first window lapses.
        let guard = f.dispatch.inner.request_locks.lock(&request.id).await;
        tokio::time::sleep(Duration::from_millis(30_100)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let c = f.provider("c", 4.0).await;
        let stored = f.memory.get_request(request.id).unwrap();
        let outcome = f.dispatch.decline(stored, a).await.unwrap();
        assert_eq!(outcome, RejectOutcome::Reoffered { candidates: 1 });
        drop(guard);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            f.memory.get_request(request.id).unwrap().status,
            RequestStatus::Pending
        );
        assert!(f.dispatch.is_window_open(request.id));
        assert!(
            tokio::time::timeout(Duration::from_millis(10), sub.recv())
                .await
                .is_err()
        );
        let session = f.dispatch.accept(request.id, c).await.unwrap();
        assert_eq!(session.provider_id, c);
    }
}
