//! Core records of the dispatch service.
//!
//! These mirror the persisted layout field-for-field: a [`Request`] is the
//! unmatched ask, a [`Session`] is the live booking it becomes, and a
//! [`Candidate`] is the per-request projection of a provider used only while
//! offers are out.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use validator::Validate;

use crate::enums::{PartyRole, ProviderStatus, RequestStatus, SessionStatus};
use crate::ids::{Party, ProviderId, RequestId, RequesterId, SessionId};

/// Mean Earth radius used for great-circle distances.
const EARTH_RADIUS_KM: f64 = 6371.0;

// ---------------------------------------------------------------------------
// Geography
// ---------------------------------------------------------------------------

/// A WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Coordinates {
    /// Latitude in decimal degrees.
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,
    /// Longitude in decimal degrees.
    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,
}

impl Coordinates {
    /// Create a coordinate pair.
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Both components are finite numbers inside the WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite() && self.validate().is_ok()
    }

    /// Great-circle distance to `other` in kilometres.
    pub fn haversine_km(&self, other: &Self) -> f64 {
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.latitude.to_radians().cos()
                * other.latitude.to_radians().cos()
                * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

/// One point of a provider's live track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct LocationPoint {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Reported accuracy radius in metres, if the device sent one.
    pub accuracy: Option<f64>,
    /// Server arrival time.
    pub timestamp: DateTime<Utc>,
}

impl LocationPoint {
    /// Build a point from coordinates stamped at `timestamp`.
    pub const fn at(coords: Coordinates, accuracy: Option<f64>, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude: coords.latitude,
            longitude: coords.longitude,
            accuracy,
            timestamp,
        }
    }

    /// The coordinate part of this point.
    pub const fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

// ---------------------------------------------------------------------------
// Parties
// ---------------------------------------------------------------------------

/// A provider as known to the dispatch core.
///
/// Profile management lives elsewhere; this is the slice dispatch needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ProviderProfile {
    /// Provider identity.
    pub id: ProviderId,
    /// Display name shown to requesters.
    pub name: String,
    /// Avatar URL.
    pub image: Option<String>,
    /// Current availability.
    pub status: ProviderStatus,
    /// Last known position. `None` until the provider reports one.
    pub coordinates: Option<Coordinates>,
}

/// A requester as known to the dispatch core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct RequesterProfile {
    /// Requester identity.
    pub id: RequesterId,
    /// Display name shown to providers.
    pub name: String,
    /// Contact number, if on file.
    pub phone: Option<String>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// An ask for in-home care, before a provider commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Request {
    /// Request identity (also the identity of the resulting session).
    pub id: RequestId,
    /// Who asked.
    pub requester_id: RequesterId,
    /// Requester display name, copied at creation.
    pub requester_name: String,
    /// Where care is needed.
    pub origin: Coordinates,
    /// Kind of care requested.
    pub service_type: String,
    /// Current lifecycle status.
    pub status: RequestStatus,
    /// Provider that accepted, if any.
    pub provider_id: Option<ProviderId>,
    /// When the accepting provider committed.
    pub accepted_at: Option<DateTime<Utc>>,
    /// Amount quoted to the requester at acceptance.
    #[ts(as = "Option<String>")]
    pub amount: Option<Decimal>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A provider considered for one request.
///
/// Recomputed per request and never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Candidate {
    /// Provider identity.
    pub provider_id: ProviderId,
    /// Provider display name.
    pub provider_name: String,
    /// Provider position used for the distance.
    pub coordinates: Coordinates,
    /// Distance from the request origin in kilometres (2 dp).
    pub distance_km: f64,
    /// Price this provider would quote (2 dp).
    #[ts(as = "String")]
    pub price_estimate: Decimal,
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// A chat line exchanged inside a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ChatMessage {
    /// Which side sent it.
    pub sender_role: PartyRole,
    /// The sending party.
    pub sender: Party,
    /// Message body.
    pub text: String,
    /// Server arrival time.
    pub timestamp: DateTime<Utc>,
}

/// Payment linkage for a session.
///
/// Intent creation and webhook processing happen in the payment service;
/// this record only mirrors the outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(default, rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Payment {
    /// Whether the session has been paid.
    pub paid: bool,
    /// Payment method (`upi`, `card`, `wallet`, ...).
    pub method: Option<String>,
    /// Reference issued by the payment processor.
    pub transaction_id: Option<String>,
    /// Amount charged.
    #[ts(as = "Option<String>")]
    pub amount: Option<Decimal>,
    /// When the payment was marked paid.
    pub paid_at: Option<DateTime<Utc>>,
    /// Processor-specific extras.
    pub metadata: serde_json::Value,
}

/// The live, matched instance of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Session {
    /// Same identifier as the originating request.
    pub id: SessionId,
    /// Requester party.
    pub requester_id: RequesterId,
    /// Requester display name.
    pub requester_name: String,
    /// Provider party.
    pub provider_id: ProviderId,
    /// Provider display name.
    pub provider_name: String,
    /// Provider avatar URL.
    pub provider_image: Option<String>,
    /// Kind of care requested.
    pub service_type: String,
    /// Where care is needed.
    pub origin: Coordinates,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Latest provider position.
    pub current: Option<LocationPoint>,
    /// Every provider position in arrival order. Append-only.
    pub location_history: Vec<LocationPoint>,
    /// Every chat line in arrival order. Append-only.
    pub chat: Vec<ChatMessage>,
    /// Payment linkage.
    pub payment: Payment,
    /// Amount agreed at acceptance.
    #[ts(as = "String")]
    pub amount: Decimal,
    /// When the provider accepted.
    pub accepted_at: DateTime<Utc>,
    /// Free-form annotations (transition times, cancelling party, ...).
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// The role `party` plays in this session, if any.
    pub fn role_of(&self, party: Party) -> Option<PartyRole> {
        match party {
            Party::Requester(id) if id == self.requester_id => Some(PartyRole::Requester),
            Party::Provider(id) if id == self.provider_id => Some(PartyRole::Provider),
            _ => None,
        }
    }

    /// Whether `party` is one of the two session parties.
    pub fn involves(&self, party: Party) -> bool {
        self.role_of(party).is_some()
    }

    /// The party playing `role`.
    pub const fn party(&self, role: PartyRole) -> Party {
        match role {
            PartyRole::Requester => Party::Requester(self.requester_id),
            PartyRole::Provider => Party::Provider(self.provider_id),
        }
    }

    /// Both parties, requester first.
    pub const fn parties(&self) -> [Party; 2] {
        [
            Party::Requester(self.requester_id),
            Party::Provider(self.provider_id),
        ]
    }

    /// Timestamp of the newest history point, if any.
    pub fn last_point_at(&self) -> Option<DateTime<Utc>> {
        self.location_history.last().map(|p| p.timestamp)
    }
}
