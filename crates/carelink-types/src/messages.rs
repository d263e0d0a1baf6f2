//! Socket wire protocol.
//!
//! Every frame is a JSON object tagged by `"type"`. [`ClientMessage`] is what
//! requester and provider apps send; [`ServerMessage`] is what the service
//! pushes back. Payloads are plain structs so clients get one TypeScript
//! interface per message.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;
use validator::Validate;

use crate::enums::{PartyRole, SessionStatus};
use crate::ids::{Party, ProviderId, RequestId, SessionId};
use crate::structs::Coordinates;

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// A frame sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub enum ClientMessage {
    /// Establish the identity behind this connection.
    Authenticate(Credential),
    /// Bind the authenticated provider identity to this connection.
    RegisterProvider(Credential),
    /// Bind the authenticated requester identity to this connection.
    RegisterRequester(Credential),
    /// A provider position report.
    LocationUpdate(LocationReport),
    /// A chat line for a session.
    ChatMessage(ChatPost),
    /// Provider reports arrival.
    SessionArrived(SessionRef),
    /// Provider reports being on the way.
    SessionInProgress(SessionRef),
    /// Either party completes the session.
    SessionCompleted(SessionRef),
    /// Either party cancels the session.
    SessionCancelled(SessionRef),
}

/// A bearer credential (JWT).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Credential {
    /// The encoded token.
    pub credential: String,
}

/// A position report from a provider device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct LocationReport {
    /// Session the report belongs to. `None` while the provider is idle.
    pub session_id: Option<SessionId>,
    /// Reported position.
    #[validate(nested)]
    pub coords: Coordinates,
    /// Accuracy radius in metres.
    pub accuracy: Option<f64>,
}

/// A chat line posted by a session party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ChatPost {
    /// Target session.
    pub session_id: SessionId,
    /// Role the sender claims; checked against the session.
    pub sender_role: PartyRole,
    /// Message body.
    #[validate(length(min = 1, max = 2000))]
    pub text: String,
}

/// A bare reference to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct SessionRef {
    /// Target session.
    pub session_id: SessionId,
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// A frame pushed by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub enum ServerMessage {
    /// Authentication succeeded.
    Authenticated(Authenticated),
    /// Authentication or registration failed.
    AuthError(Notice),
    /// The connection is now bound into presence.
    Registered(Registered),
    /// A new request offered to this provider.
    NewOffer(NewOffer),
    /// A provider accepted this requester's request.
    OfferAccepted(OfferAccepted),
    /// The assigned provider backed out; a new search is running.
    OfferRejectedRetry(RequestNotice),
    /// The search gave up.
    NoProviderAvailable(RequestNotice),
    /// An offer this provider received is no longer open.
    OfferWithdrawn(OfferWithdrawn),
    /// A provider position for the requester's session.
    NurseLocationUpdate(ProviderLocation),
    /// A chat line from the other party.
    NewChatMessage(ChatRelay),
    /// The provider reported arrival.
    SessionArrived(SessionNotice),
    /// The provider is on the way.
    SessionInProgress(SessionNotice),
    /// The session completed.
    SessionCompleted(SessionNotice),
    /// The session was cancelled.
    SessionCancelled(SessionNotice),
    /// An idle or passing provider is close to a pending request.
    ProviderNearby(ProviderNearby),
    /// A client frame was rejected.
    Error(ErrorNotice),
}

/// Payload of [`ServerMessage::Authenticated`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Authenticated {
    /// Identity carried by the credential.
    pub identity: Uuid,
}

/// Payload of [`ServerMessage::Registered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Registered {
    /// The party now reachable on this connection.
    pub party: Party,
}

/// A human-readable notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Notice {
    /// Message text.
    pub message: String,
}

/// Payload of [`ServerMessage::NewOffer`]. Each provider sees only its own
/// distance and price line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct NewOffer {
    /// Offered request.
    pub request_id: RequestId,
    /// Where care is needed.
    pub origin_coords: Coordinates,
    /// Requester display name.
    pub requester_name: String,
    /// Kind of care requested.
    pub service_type: String,
    /// Distance from this provider in kilometres.
    pub distance: f64,
    /// Price this provider would quote.
    #[ts(as = "String")]
    pub price_estimate: Decimal,
}

/// Payload of [`ServerMessage::OfferAccepted`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct OfferAccepted {
    /// Accepted request (and session) identifier.
    pub request_id: RequestId,
    /// Accepting provider.
    pub provider_id: ProviderId,
    /// Provider display name.
    pub provider_name: String,
    /// Provider avatar URL.
    pub provider_image: Option<String>,
    /// Provider position at acceptance.
    pub provider_coords: Option<Coordinates>,
    /// Agreed price.
    #[ts(as = "String")]
    pub price_estimate: Decimal,
}

/// A notice about one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct RequestNotice {
    /// Request concerned.
    pub request_id: RequestId,
    /// Message text.
    pub message: String,
}

/// Why an offer closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum WithdrawReason {
    /// Another provider accepted first.
    Taken,
    /// The requester cancelled or the search gave up.
    Cancelled,
}

/// Payload of [`ServerMessage::OfferWithdrawn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct OfferWithdrawn {
    /// Request whose offer closed.
    pub request_id: RequestId,
    /// Why it closed.
    pub reason: WithdrawReason,
}

/// Payload of [`ServerMessage::NurseLocationUpdate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ProviderLocation {
    /// Session concerned.
    pub session_id: SessionId,
    /// Reporting provider.
    pub provider_id: ProviderId,
    /// Reported position.
    pub coords: Coordinates,
    /// Server arrival time of the point.
    pub timestamp: DateTime<Utc>,
}

/// Payload of [`ServerMessage::NewChatMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ChatRelay {
    /// Session concerned.
    pub session_id: SessionId,
    /// Which side sent the line.
    pub sender_role: PartyRole,
    /// Message body.
    pub text: String,
    /// Server arrival time.
    pub timestamp: DateTime<Utc>,
}

/// Payload of the session status notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct SessionNotice {
    /// Session concerned.
    pub session_id: SessionId,
    /// Status after the transition.
    pub status: SessionStatus,
    /// Message text.
    pub message: String,
}

/// Payload of [`ServerMessage::ProviderNearby`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ProviderNearby {
    /// Pending request the provider is close to.
    pub request_id: RequestId,
    /// The nearby provider.
    pub provider_id: ProviderId,
    /// Provider display name.
    pub provider_name: String,
    /// Provider position.
    pub coords: Coordinates,
    /// Straight-line distance to the request origin in kilometres.
    pub distance_km: f64,
}

/// Payload of [`ServerMessage::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ErrorNotice {
    /// Machine-readable category (`validation`, `state_conflict`, ...).
    pub code: String,
    /// Message text.
    pub message: String,
    /// Actual status when the frame lost a state race.
    pub current_status: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_are_tagged_by_type() {
        let raw = r#"{"type":"chatMessage","sessionId":"00000000-0000-0000-0000-000000000000","senderRole":"requester","text":"on my way?"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        let ClientMessage::ChatMessage(post) = msg else {
            panic!("wrong variant");
        };
        assert_eq!(post.sender_role, PartyRole::Requester);
        assert_eq!(post.text, "on my way?");
    }

    #[test]
    fn idle_location_report_has_no_session() {
        let raw = r#"{"type":"locationUpdate","coords":{"latitude":12.9,"longitude":77.6}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        let ClientMessage::LocationUpdate(report) = msg else {
            panic!("wrong variant");
        };
        assert!(report.session_id.is_none());
        assert!(report.accuracy.is_none());
    }

    #[test]
    fn server_frames_use_protocol_names() {
        let msg = ServerMessage::NoProviderAvailable(RequestNotice {
            request_id: RequestId::from(Uuid::nil()),
            message: String::from("none"),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "noProviderAvailable");
        assert_eq!(json["requestId"], "00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn empty_chat_text_fails_validation() {
        let post = ChatPost {
            session_id: SessionId::new(),
            sender_role: PartyRole::Provider,
            text: String::new(),
        };
        assert!(post.validate().is_err());
    }
}
