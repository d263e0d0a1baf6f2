//! Shared type definitions for the CareLink dispatch service.
//!
//! This crate is the single source of truth for the records exchanged
//! between the dispatch core, the persistence layer, and the client apps.
//! Client-facing types flow to `TypeScript` via `ts-rs`.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers and the [`Party`] identity
//! - [`enums`] -- Request, session and provider lifecycles
//! - [`structs`] -- Requests, sessions, candidates, parties
//! - [`messages`] -- Socket wire protocol
//! - [`api`] -- REST request and response bodies

pub mod api;
pub mod enums;
pub mod ids;
pub mod messages;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use api::{
    AvailabilityUpdate, ChatText, NearbyProviders, NearbyQuery, NewRequest, PaymentUpdate,
    ProviderRegistration, RequesterRegistration,
};
pub use enums::{PartyRole, ProviderStatus, RequestStatus, SessionStatus};
pub use ids::{ConnectionId, Party, ProviderId, RequestId, RequesterId, SessionId};
pub use messages::{
    Authenticated, ChatPost, ChatRelay, ClientMessage, Credential, ErrorNotice, LocationReport,
    NewOffer, Notice, OfferAccepted, OfferWithdrawn, ProviderLocation, ProviderNearby, Registered,
    RequestNotice, ServerMessage, SessionNotice, SessionRef, WithdrawReason,
};
pub use structs::{
    Candidate, ChatMessage, Coordinates, LocationPoint, Payment, ProviderProfile, Request,
    RequesterProfile, Session,
};

#[cfg(test)]
mod tests {
    //! `TypeScript` binding generation.

    #[test]
    fn export_bindings() {
        // ts-rs writes the bindings to `bindings/` relative to the crate
        // root when `export_all` is called.
        use ts_rs::TS;

        // IDs
        let _ = crate::ids::RequestId::export_all();
        let _ = crate::ids::ProviderId::export_all();
        let _ = crate::ids::RequesterId::export_all();
        let _ = crate::ids::ConnectionId::export_all();
        let _ = crate::ids::Party::export_all();

        // Enums
        let _ = crate::enums::RequestStatus::export_all();
        let _ = crate::enums::SessionStatus::export_all();
        let _ = crate::enums::ProviderStatus::export_all();
        let _ = crate::enums::PartyRole::export_all();

        // Structs
        let _ = crate::structs::Coordinates::export_all();
        let _ = crate::structs::LocationPoint::export_all();
        let _ = crate::structs::ProviderProfile::export_all();
        let _ = crate::structs::RequesterProfile::export_all();
        let _ = crate::structs::Request::export_all();
        let _ = crate::structs::Candidate::export_all();
        let _ = crate::structs::ChatMessage::export_all();
        let _ = crate::structs::Payment::export_all();
        let _ = crate::structs::Session::export_all();

        // REST bodies
        let _ = crate::api::NewRequest::export_all();
        let _ = crate::api::NearbyProviders::export_all();
        let _ = crate::api::PaymentUpdate::export_all();
        let _ = crate::api::ProviderRegistration::export_all();
        let _ = crate::api::RequesterRegistration::export_all();
        let _ = crate::api::AvailabilityUpdate::export_all();
        let _ = crate::api::ChatText::export_all();

        // Wire protocol
        let _ = crate::messages::ClientMessage::export_all();
        let _ = crate::messages::ServerMessage::export_all();
    }
}
