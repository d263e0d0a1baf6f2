//! Enumeration types for the dispatch service.
//!
//! Status enums carry their own transition rules so every component
//! agrees on which states are terminal.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ---------------------------------------------------------------------------
// Request lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of a care request before (and at) the moment a provider commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum RequestStatus {
    /// Offers are out; no provider has committed.
    Pending,
    /// A provider accepted; a session exists under the same identifier.
    Accepted,
    /// Withdrawn by the requester or given up after no provider accepted.
    Cancelled,
}

impl RequestStatus {
    /// Stable lowercase name used in storage and error bodies.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the storage name back into a status.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl core::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of an accepted booking.
///
/// ```text
/// accepted -> in_progress -> provider_arrived -> completed
///     \            \
///      +------------+--> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum SessionStatus {
    /// Provider committed; not yet travelling.
    Accepted,
    /// Provider is on the way.
    InProgress,
    /// Provider is at the requester's location.
    ProviderArrived,
    /// Care delivered. Terminal.
    Completed,
    /// Called off by either party. Terminal.
    Cancelled,
}

impl SessionStatus {
    /// Whether no further transition is possible.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether `next` is a legal single step from this status.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Accepted, Self::InProgress)
                | (Self::InProgress, Self::ProviderArrived)
                | (Self::ProviderArrived, Self::Completed)
                | (Self::Accepted | Self::InProgress, Self::Cancelled)
        )
    }

    /// Stable lowercase name used in storage and error bodies.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::InProgress => "in_progress",
            Self::ProviderArrived => "provider_arrived",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the storage name back into a status.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "accepted" => Some(Self::Accepted),
            "in_progress" => Some(Self::InProgress),
            "provider_arrived" => Some(Self::ProviderArrived),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl core::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Providers and parties
// ---------------------------------------------------------------------------

/// Whether a provider can be offered new requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ProviderStatus {
    /// On shift and free to take a request.
    Available,
    /// Assigned to a live session.
    Engaged,
    /// Off shift.
    Offline,
}

impl ProviderStatus {
    /// Stable lowercase name used in storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Engaged => "engaged",
            Self::Offline => "offline",
        }
    }

    /// Parse the storage name back into a status.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "available" => Some(Self::Available),
            "engaged" => Some(Self::Engaged),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

impl core::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a session a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum PartyRole {
    /// The person who asked for care.
    Requester,
    /// The care provider.
    Provider,
}

impl PartyRole {
    /// Stable lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requester => "requester",
            Self::Provider => "provider",
        }
    }

    /// The opposite side of the session.
    pub const fn counterpart(self) -> Self {
        match self {
            Self::Requester => Self::Provider,
            Self::Provider => Self::Requester,
        }
    }
}
