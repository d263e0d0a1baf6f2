//! Type-safe identifier wrappers around [`Uuid`].
//!
//! Every entity in the dispatch service has a strongly-typed ID so a
//! provider can never be passed where a requester is expected. New IDs use
//! UUID v7 (time-ordered) so request and session keys index well.
//!
//! A session shares the identifier of the request it was accepted from, so
//! there is no separate session ID type; see [`SessionId`].

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
        #[ts(export, export_to = "bindings/")]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Unique identifier for a care request (and the session it becomes).
    RequestId
}

define_id! {
    /// Unique identifier for a care provider.
    ProviderId
}

define_id! {
    /// Unique identifier for a requester (the person asking for care).
    RequesterId
}

define_id! {
    /// Unique identifier for one live socket connection.
    ConnectionId
}

/// Sessions are keyed by the identifier of the request they were accepted
/// from (1:1).
pub type SessionId = RequestId;

/// A party identity as seen by presence tracking and session lookup.
///
/// The same person can hold a requester and a provider identity; they are
/// tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(tag = "role", content = "id", rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub enum Party {
    /// A requester identity.
    Requester(RequesterId),
    /// A provider identity.
    Provider(ProviderId),
}

impl Party {
    /// Return the raw UUID behind this party.
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::Requester(id) => id.0,
            Self::Provider(id) => id.0,
        }
    }
}

impl core::fmt::Display for Party {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Requester(id) => write!(f, "requester:{id}"),
            Self::Provider(id) => write!(f, "provider:{id}"),
        }
    }
}

impl From<RequesterId> for Party {
    fn from(id: RequesterId) -> Self {
        Self::Requester(id)
    }
}

impl From<ProviderId> for Party {
    fn from(id: ProviderId) -> Self {
        Self::Provider(id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let request = RequestId::new();
        let provider = ProviderId::new();
        assert_ne!(request.into_inner(), Uuid::nil());
        assert_ne!(provider.into_inner(), Uuid::nil());
    }

    #[test]
    fn ids_are_time_ordered() {
        let first = RequestId::new();
        let second = RequestId::new();
        assert!(first < second);
    }

    #[test]
    fn party_display_carries_role() {
        let id = ProviderId::from(Uuid::nil());
        assert_eq!(
            Party::from(id).to_string(),
            "provider:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn party_serializes_tagged() {
        let party = Party::Requester(RequesterId::from(Uuid::nil()));
        let json = serde_json::to_value(party).unwrap();
        assert_eq!(json["role"], "requester");
        assert_eq!(json["id"], "00000000-0000-0000-0000-000000000000");
    }
}
