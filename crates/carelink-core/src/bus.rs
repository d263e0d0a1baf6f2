//! In-process event bus.
//!
//! State-changing operations publish a typed [`DispatchEvent`]; the socket
//! relay subscribes and turns events into frames for the affected parties.
//! Publishing never blocks and having no subscribers is not an error.
//!
//! Backed by [`tokio::sync::broadcast`]. A subscriber that falls behind
//! skips the missed events and keeps going.

use carelink_types::{
    Candidate, ChatMessage, Coordinates, LocationPoint, PartyRole, ProviderId, RequestId,
    RequesterId, SessionId, SessionStatus,
};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Default channel capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Topic of an event, derived from its variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Offers went out for a request.
    OfferCreated,
    /// A provider accepted a request.
    Accepted,
    /// The provider reported arrival.
    Arrived,
    /// The provider is on the way.
    InProgress,
    /// A session completed.
    Completed,
    /// A request or session was cancelled.
    Cancelled,
    /// A chat line was posted.
    ChatPosted,
    /// A provider position was recorded for a session.
    LocationUpdated,
    /// The assigned provider backed out and matching restarted.
    OfferRejectedRetry,
    /// Matching gave up.
    NoProviderAvailable,
    /// A provider is close to a pending request.
    ProviderNearby,
}

/// Offers for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferBatch {
    /// Request being offered.
    pub request_id: RequestId,
    /// Who asked.
    pub requester_id: RequesterId,
    /// Requester display name.
    pub requester_name: String,
    /// Where care is needed.
    pub origin: Coordinates,
    /// Kind of care.
    pub service_type: String,
    /// One line per candidate with its own distance and price.
    pub offers: Vec<Candidate>,
}

/// A request was accepted and its session opened.
#[derive(Debug, Clone, PartialEq)]
pub struct Acceptance {
    /// Request (and session) identity.
    pub request_id: RequestId,
    /// Who asked.
    pub requester_id: RequesterId,
    /// Who accepted.
    pub provider_id: ProviderId,
    /// Provider display name.
    pub provider_name: String,
    /// Provider avatar URL.
    pub provider_image: Option<String>,
    /// Provider position at acceptance.
    pub provider_coords: Option<Coordinates>,
    /// Agreed amount.
    pub amount: Decimal,
    /// Other providers whose offers are now void.
    pub withdrawn: Vec<ProviderId>,
}

/// A single-step session status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Session identity.
    pub session_id: SessionId,
    /// Requester party.
    pub requester_id: RequesterId,
    /// Provider party.
    pub provider_id: ProviderId,
    /// New status.
    pub status: SessionStatus,
    /// Which side triggered it.
    pub actor: PartyRole,
}

/// A request or session was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    /// Request (and session, if one existed) identity.
    pub request_id: RequestId,
    /// Requester party.
    pub requester_id: RequesterId,
    /// Assigned provider, if the request had been accepted.
    pub provider_id: Option<ProviderId>,
    /// Providers holding an offer that is now void.
    pub withdrawn: Vec<ProviderId>,
    /// Which side cancelled.
    pub actor: PartyRole,
}

/// A chat line was appended to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPosted {
    /// Session identity.
    pub session_id: SessionId,
    /// Requester party.
    pub requester_id: RequesterId,
    /// Provider party.
    pub provider_id: ProviderId,
    /// The appended line.
    pub message: ChatMessage,
}

/// A provider position was appended to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationUpdated {
    /// Session identity.
    pub session_id: SessionId,
    /// Requester party.
    pub requester_id: RequesterId,
    /// Provider party.
    pub provider_id: ProviderId,
    /// The appended point.
    pub point: LocationPoint,
}

/// Matching progress reported to the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchNotice {
    /// Request identity.
    pub request_id: RequestId,
    /// Requester party.
    pub requester_id: RequesterId,
    /// Providers holding an offer that is now void.
    pub withdrawn: Vec<ProviderId>,
}

/// A provider passed close to a pending request's origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Proximity {
    /// Pending request.
    pub request_id: RequestId,
    /// Its requester.
    pub requester_id: RequesterId,
    /// Nearby provider.
    pub provider_id: ProviderId,
    /// Provider display name.
    pub provider_name: String,
    /// Provider position.
    pub coords: Coordinates,
    /// Straight-line distance to the origin in kilometres.
    pub distance_km: f64,
}

/// Every event the core publishes.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// See [`Topic::OfferCreated`].
    OfferCreated(OfferBatch),
    /// See [`Topic::Accepted`].
    Accepted(Acceptance),
    /// See [`Topic::Arrived`].
    Arrived(StatusChange),
    /// See [`Topic::InProgress`].
    InProgress(StatusChange),
    /// See [`Topic::Completed`].
    Completed(StatusChange),
    /// See [`Topic::Cancelled`].
    Cancelled(Cancellation),
    /// See [`Topic::ChatPosted`].
    ChatPosted(ChatPosted),
    /// See [`Topic::LocationUpdated`].
    LocationUpdated(LocationUpdated),
    /// See [`Topic::OfferRejectedRetry`].
    OfferRejectedRetry(MatchNotice),
    /// See [`Topic::NoProviderAvailable`].
    NoProviderAvailable(MatchNotice),
    /// See [`Topic::ProviderNearby`].
    ProviderNearby(Proximity),
}

impl DispatchEvent {
    /// The topic this event is published under.
    pub const fn topic(&self) -> Topic {
        match self {
            Self::OfferCreated(_) => Topic::OfferCreated,
            Self::Accepted(_) => Topic::Accepted,
            Self::Arrived(_) => Topic::Arrived,
            Self::InProgress(_) => Topic::InProgress,
            Self::Completed(_) => Topic::Completed,
            Self::Cancelled(_) => Topic::Cancelled,
            Self::ChatPosted(_) => Topic::ChatPosted,
            Self::LocationUpdated(_) => Topic::LocationUpdated,
            Self::OfferRejectedRetry(_) => Topic::OfferRejectedRetry,
            Self::NoProviderAvailable(_) => Topic::NoProviderAvailable,
            Self::ProviderNearby(_) => Topic::ProviderNearby,
        }
    }

    /// The request or session this event concerns.
    pub const fn request_id(&self) -> RequestId {
        match self {
            Self::OfferCreated(e) => e.request_id,
            Self::Accepted(e) => e.request_id,
            Self::Arrived(e) | Self::InProgress(e) | Self::Completed(e) => e.session_id,
            Self::Cancelled(e) => e.request_id,
            Self::ChatPosted(e) => e.session_id,
            Self::LocationUpdated(e) => e.session_id,
            Self::OfferRejectedRetry(e) | Self::NoProviderAvailable(e) => e.request_id,
            Self::ProviderNearby(e) => e.request_id,
        }
    }
}

/// Which topics a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    /// Every topic.
    All,
    /// Only the listed topics.
    Only(Vec<Topic>),
}

impl TopicFilter {
    /// Whether `topic` passes the filter.
    pub fn matches(&self, topic: Topic) -> bool {
        match self {
            Self::All => true,
            Self::Only(topics) => topics.contains(&topic),
        }
    }
}

/// Shared publisher handle. Clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DispatchEvent>,
}

impl EventBus {
    /// Create a bus holding up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Returns how many subscribers will see it.
    pub fn publish(&self, event: DispatchEvent) -> usize {
        let topic = event.topic();
        let request_id = event.request_id();
        let receivers = self.tx.send(event).unwrap_or(0);
        tracing::debug!(?topic, %request_id, receivers, "Event published");
        receivers
    }

    /// Subscribe to the topics in `filter`.
    pub fn subscribe(&self, filter: TopicFilter) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter,
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Receiving side of a filtered subscription.
pub struct Subscription {
    rx: broadcast::Receiver<DispatchEvent>,
    filter: TopicFilter,
}

impl Subscription {
    /// Next matching event, or `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<DispatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(event.topic()) => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged, skipping");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn no_provider(request_id: RequestId) -> DispatchEvent {
        DispatchEvent::NoProviderAvailable(MatchNotice {
            request_id,
            requester_id: RequesterId::new(),
            withdrawn: Vec::new(),
        })
    }

    fn chat(session_id: SessionId) -> DispatchEvent {
        let requester_id = RequesterId::new();
        DispatchEvent::ChatPosted(ChatPosted {
            session_id,
            requester_id,
            provider_id: ProviderId::new(),
            message: ChatMessage {
                sender_role: PartyRole::Requester,
                sender: carelink_types::Party::Requester(requester_id),
                text: String::from("hello"),
                timestamp: chrono::Utc::now(),
            },
        })
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(no_provider(RequestId::new())), 0);
    }

    #[tokio::test]
    async fn filtered_subscription_skips_other_topics() {
        let bus = EventBus::default();
        let mut only_chat = bus.subscribe(TopicFilter::Only(vec![Topic::ChatPosted]));
        let mut everything = bus.subscribe(TopicFilter::All);

        let id = RequestId::new();
        assert_eq!(bus.publish(no_provider(id)), 2);
        bus.publish(chat(id));

        assert_eq!(only_chat.recv().await.unwrap().topic(), Topic::ChatPosted);
        assert_eq!(
            everything.recv().await.unwrap().topic(),
            Topic::NoProviderAvailable
        );
        assert_eq!(everything.recv().await.unwrap().topic(), Topic::ChatPosted);
    }

    #[tokio::test]
    async fn lagged_subscriber_keeps_receiving() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(TopicFilter::All);
        let ids: Vec<RequestId> = (0..5).map(|_| RequestId::new()).collect();
        for id in &ids {
            bus.publish(no_provider(*id));
        }
        // Only the newest two survive in the ring.
        assert_eq!(sub.recv().await.unwrap().request_id(), ids[3]);
        assert_eq!(sub.recv().await.unwrap().request_id(), ids[4]);
    }

    #[tokio::test]
    async fn closed_bus_ends_subscription() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(TopicFilter::All);
        drop(bus);
        assert!(sub.recv().await.is_none());
    }
}
