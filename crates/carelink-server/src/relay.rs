//! Event relay from the dispatch bus to live connections.
//!
//! One task subscribes to every topic and turns each [`DispatchEvent`] into
//! the socket frames its parties should see. Offers and acceptances that
//! find nobody connected go to the offline [`Notifier`] instead; every other
//! miss is dropped, since the party will read current state on reconnect.
//!
//! [`Notifier`]: carelink_core::Notifier

use std::sync::Arc;

use carelink_core::bus::{Acceptance, OfferBatch, StatusChange};
use carelink_core::notify::NoticeKind;
use carelink_core::{
    Delivery, DispatchError, DispatchEvent, OfflineNotice, Subscription, TopicFilter,
};
use carelink_types::{
    ChatRelay, NewOffer, OfferAccepted, OfferWithdrawn, Party, PartyRole, ProviderId,
    ProviderLocation, ProviderNearby, RequestId, RequestNotice, ServerMessage, SessionNotice,
    SessionStatus, WithdrawReason,
};
use tokio::task::JoinHandle;

use crate::state::AppState;

/// Start relaying bus events to connections on a background task.
pub fn spawn_relay(state: Arc<AppState>) -> JoinHandle<()> {
    let subscription = state.dispatch.bus().subscribe(TopicFilter::All);
    tokio::spawn(run_relay(state, subscription))
}

/// Start the relay, then re-offer requests a previous run left pending.
///
/// The relay subscribes first, so resumed offers reach live connections
/// and the offline notifier. Returns the relay task and how many requests
/// are waiting again.
///
/// # Errors
///
/// Returns [`DispatchError`] if the pending list cannot be read. The relay
/// keeps running.
pub async fn spawn_relay_and_resume(
    state: Arc<AppState>,
) -> Result<(JoinHandle<()>, usize), DispatchError> {
    let relay = spawn_relay(Arc::clone(&state));
    let resumed = state.dispatch.resume_pending().await?;
    Ok((relay, resumed))
}

/// Relay until the bus closes.
pub async fn run_relay(state: Arc<AppState>, mut subscription: Subscription) {
    tracing::info!("Event relay started");
    while let Some(event) = subscription.recv().await {
        relay_event(&state, &event);
    }
    tracing::info!("Event bus closed, relay stopping");
}

/// Deliver one event to the parties it concerns.
pub fn relay_event(state: &AppState, event: &DispatchEvent) {
    match event {
        DispatchEvent::OfferCreated(batch) => relay_offers(state, batch),
        DispatchEvent::Accepted(acceptance) => relay_acceptance(state, acceptance),
        DispatchEvent::InProgress(change) => {
            relay_status(state, change, "Provider is on the way");
        }
        DispatchEvent::Arrived(change) => {
            relay_status(state, change, "Provider has arrived");
        }
        DispatchEvent::Completed(change) => {
            relay_status(state, change, "Session completed");
        }
        DispatchEvent::Cancelled(c) => {
            if let Some(provider_id) = c.provider_id {
                let message = format!("Session cancelled by {}", c.actor.as_str());
                let notice = ServerMessage::SessionCancelled(SessionNotice {
                    session_id: c.request_id,
                    status: SessionStatus::Cancelled,
                    message,
                });
                send(state, Party::Requester(c.requester_id), notice.clone());
                send(state, Party::Provider(provider_id), notice);
            }
            withdraw(state, c.request_id, &c.withdrawn, WithdrawReason::Cancelled);
        }
        DispatchEvent::ChatPosted(c) => {
            let relay = ServerMessage::NewChatMessage(ChatRelay {
                session_id: c.session_id,
                sender_role: c.message.sender_role,
                text: c.message.text.clone(),
                timestamp: c.message.timestamp,
            });
            send(state, Party::Requester(c.requester_id), relay.clone());
            send(state, Party::Provider(c.provider_id), relay);
        }
        DispatchEvent::LocationUpdated(l) => {
            let update = ServerMessage::NurseLocationUpdate(ProviderLocation {
                session_id: l.session_id,
                provider_id: l.provider_id,
                coords: l.point.coordinates(),
                timestamp: l.point.timestamp,
            });
            send(state, Party::Requester(l.requester_id), update);
        }
        DispatchEvent::OfferRejectedRetry(n) => {
            let notice = ServerMessage::OfferRejectedRetry(RequestNotice {
                request_id: n.request_id,
                message: String::from("Provider declined, finding another"),
            });
            send(state, Party::Requester(n.requester_id), notice);
        }
        DispatchEvent::NoProviderAvailable(n) => {
            let notice = ServerMessage::NoProviderAvailable(RequestNotice {
                request_id: n.request_id,
                message: String::from("No provider available"),
            });
            send(state, Party::Requester(n.requester_id), notice);
            withdraw(state, n.request_id, &n.withdrawn, WithdrawReason::Cancelled);
        }
        DispatchEvent::ProviderNearby(p) => {
            let notice = ServerMessage::ProviderNearby(ProviderNearby {
                request_id: p.request_id,
                provider_id: p.provider_id,
                provider_name: p.provider_name.clone(),
                coords: p.coords,
                distance_km: p.distance_km,
            });
            send(state, Party::Requester(p.requester_id), notice);
        }
    }
}

fn relay_offers(state: &AppState, batch: &OfferBatch) {
    for offer in &batch.offers {
        let frame = ServerMessage::NewOffer(NewOffer {
            request_id: batch.request_id,
            origin_coords: batch.origin,
            requester_name: batch.requester_name.clone(),
            service_type: batch.service_type.clone(),
            distance: offer.distance_km,
            price_estimate: offer.price_estimate,
        });
        if send(state, Party::Provider(offer.provider_id), frame) == Delivery::Offline {
            state.notifier.dispatch(
                OfflineNotice {
                    id: offer.provider_id.into_inner(),
                    role: PartyRole::Provider,
                    kind: NoticeKind::NewOffer,
                    request_id: batch.request_id,
                    user_id: batch.requester_id.into_inner(),
                    user_name: batch.requester_name.clone(),
                    latitude: None,
                    longitude: None,
                    amount: Some(offer.price_estimate),
                    distance: Some(offer.distance_km),
                }
                .at(Some(batch.origin)),
            );
        }
    }
}

fn relay_acceptance(state: &AppState, a: &Acceptance) {
    let frame = ServerMessage::OfferAccepted(OfferAccepted {
        request_id: a.request_id,
        provider_id: a.provider_id,
        provider_name: a.provider_name.clone(),
        provider_image: a.provider_image.clone(),
        provider_coords: a.provider_coords,
        price_estimate: a.amount,
    });
    if send(state, Party::Requester(a.requester_id), frame) == Delivery::Offline {
        state.notifier.dispatch(
            OfflineNotice {
                id: a.requester_id.into_inner(),
                role: PartyRole::Requester,
                kind: NoticeKind::OfferAccepted,
                request_id: a.request_id,
                user_id: a.provider_id.into_inner(),
                user_name: a.provider_name.clone(),
                latitude: None,
                longitude: None,
                amount: Some(a.amount),
                distance: None,
            }
            .at(a.provider_coords),
        );
    }
    withdraw(state, a.request_id, &a.withdrawn, WithdrawReason::Taken);
}

fn relay_status(state: &AppState, change: &StatusChange, message: &str) {
    let notice = SessionNotice {
        session_id: change.session_id,
        status: change.status,
        message: message.to_owned(),
    };
    let frame = match change.status {
        SessionStatus::InProgress => ServerMessage::SessionInProgress(notice),
        SessionStatus::ProviderArrived => ServerMessage::SessionArrived(notice),
        SessionStatus::Completed => ServerMessage::SessionCompleted(notice),
        SessionStatus::Cancelled => ServerMessage::SessionCancelled(notice),
        SessionStatus::Accepted => return,
    };
    send(state, Party::Requester(change.requester_id), frame.clone());
    send(state, Party::Provider(change.provider_id), frame);
}

fn withdraw(state: &AppState, request_id: RequestId, providers: &[ProviderId], reason: WithdrawReason) {
    for provider in providers {
        send(
            state,
            Party::Provider(*provider),
            ServerMessage::OfferWithdrawn(OfferWithdrawn { request_id, reason }),
        );
    }
}

fn send(state: &AppState, party: Party, message: ServerMessage) -> Delivery {
    let delivery = state.presence.deliver(party, message);
    if delivery == Delivery::Offline {
        tracing::debug!(%party, "Party offline, frame dropped");
    }
    delivery
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use carelink_core::bus::{ChatPosted, MatchNotice};
    use carelink_core::config::MatchingConfig;
    use carelink_core::{ConnectionHandle, DispatchCoordinator, DistanceProvider, EventBus, Notifier};
    use carelink_types::{
        ChatMessage, Coordinates, ProviderRegistration, ProviderStatus, Request, RequestStatus,
        RequesterId,
    };
    use rust_decimal::Decimal;

    use super::*;
    use crate::auth::TokenService;

    fn state() -> AppState {
        AppState::new(
            DispatchCoordinator::new(
                carelink_db::Store::memory(),
                DistanceProvider::Haversine,
                EventBus::default(),
                MatchingConfig::default(),
            ),
            TokenService::new("secret", "carelink"),
            Notifier::Disabled,
        )
    }

    #[test]
    fn acceptance_notifies_requester_and_withdraws_others() {
        let state = state();
        let requester = RequesterId::new();
        let winner = ProviderId::new();
        let other = ProviderId::new();
        let (req_handle, mut req_rx) = ConnectionHandle::channel();
        let (other_handle, mut other_rx) = ConnectionHandle::channel();
        state.presence.register(Party::Requester(requester), req_handle);
        state.presence.register(Party::Provider(other), other_handle);

        let request_id = RequestId::new();
        relay_event(
            &state,
            &DispatchEvent::Accepted(Acceptance {
                request_id,
                requester_id: requester,
                provider_id: winner,
                provider_name: String::from("Neha"),
                provider_image: None,
                provider_coords: Some(Coordinates::new(12.97, 77.59)),
                amount: Decimal::new(100, 0),
                withdrawn: vec![other],
            }),
        );

        match req_rx.try_recv().unwrap() {
            ServerMessage::OfferAccepted(a) => {
                assert_eq!(a.provider_id, winner);
                assert_eq!(a.price_estimate, Decimal::new(100, 0));
            }
            other => panic!("unexpected {other:?}"),
        }
        match other_rx.try_recv().unwrap() {
            ServerMessage::OfferWithdrawn(w) => {
                assert_eq!(w.request_id, request_id);
                assert_eq!(w.reason, WithdrawReason::Taken);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn chat_reaches_both_parties() {
        let state = state();
        let requester = RequesterId::new();
        let provider = ProviderId::new();
        let (req_handle, mut req_rx) = ConnectionHandle::channel();
        let (prov_handle, mut prov_rx) = ConnectionHandle::channel();
        state.presence.register(Party::Requester(requester), req_handle);
        state.presence.register(Party::Provider(provider), prov_handle);

        relay_event(
            &state,
            &DispatchEvent::ChatPosted(ChatPosted {
                session_id: RequestId::new(),
                requester_id: requester,
                provider_id: provider,
                message: ChatMessage {
                    sender_role: PartyRole::Requester,
                    sender: Party::Requester(requester),
                    text: String::from("gate code 4411"),
                    timestamp: chrono::Utc::now(),
                },
            }),
        );
        assert!(matches!(req_rx.try_recv().unwrap(), ServerMessage::NewChatMessage(_)));
        assert!(matches!(prov_rx.try_recv().unwrap(), ServerMessage::NewChatMessage(_)));
    }

    #[test]
    fn reconnected_party_receives_on_new_connection() {
        let state = state();
        let requester = RequesterId::new();
        let party = Party::Requester(requester);
        let (first, mut first_rx) = ConnectionHandle::channel();
        let first_id = first.id();
        state.presence.register(party, first);
        state.presence.deregister(first_id);
        let (second, mut second_rx) = ConnectionHandle::channel();
        state.presence.register(party, second);

        relay_event(
            &state,
            &DispatchEvent::NoProviderAvailable(MatchNotice {
                request_id: RequestId::new(),
                requester_id: requester,
                withdrawn: Vec::new(),
            }),
        );
        assert!(first_rx.try_recv().is_err());
        assert!(matches!(
            second_rx.try_recv().unwrap(),
            ServerMessage::NoProviderAvailable(_)
        ));
    }

    #[tokio::test]
    async fn resumed_offers_reach_connected_providers() {
        let memory = carelink_db::MemoryStore::new();
        let state = Arc::new(AppState::new(
            DispatchCoordinator::new(
                carelink_db::Store::Memory(memory.clone()),
                DistanceProvider::Haversine,
                EventBus::default(),
                MatchingConfig::default(),
            ),
            TokenService::new("secret", "carelink"),
            Notifier::Disabled,
        ));
        let provider = ProviderId::new();
        state
            .dispatch
            .register_provider(
                provider,
                ProviderRegistration {
                    name: String::from("Neha"),
                    image: None,
                },
            )
            .await
            .unwrap();
        memory
            .set_provider_coordinates(provider, Coordinates::new(12.98, 77.59))
            .unwrap();
        state
            .dispatch
            .set_availability(provider, ProviderStatus::Available)
            .await
            .unwrap();
        let (handle, mut rx) = ConnectionHandle::channel();
        state.presence.register(Party::Provider(provider), handle);

        let request = Request {
            id: RequestId::new(),
            requester_id: RequesterId::new(),
            requester_name: String::from("Asha"),
            origin: Coordinates::new(12.97, 77.59),
            service_type: String::from("elder_care"),
            status: RequestStatus::Pending,
            provider_id: None,
            accepted_at: None,
            amount: None,
            created_at: chrono::Utc::now(),
        };
        memory.insert_request(&request).unwrap();

        let (relay, resumed) = spawn_relay_and_resume(Arc::clone(&state)).await.unwrap();
        assert_eq!(resumed, 1);
        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match frame {
            ServerMessage::NewOffer(offer) => {
                assert_eq!(offer.request_id, request.id);
                assert_eq!(offer.requester_name, "Asha");
            }
            other => panic!("unexpected {other:?}"),
        }
        relay.abort();
    }
}
