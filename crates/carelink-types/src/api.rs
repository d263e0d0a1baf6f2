//! Request/response bodies of the REST surface.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use validator::Validate;

use crate::enums::ProviderStatus;
use crate::structs::{Candidate, Coordinates};

/// Body of `POST /api/requests`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct NewRequest {
    /// Where care is needed.
    #[validate(nested)]
    pub origin: Coordinates,
    /// Kind of care requested.
    #[validate(length(min = 1, max = 64))]
    pub service_type: String,
}

/// Query of `GET /api/providers/nearby`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct NearbyQuery {
    /// Origin latitude.
    pub latitude: f64,
    /// Origin longitude.
    pub longitude: f64,
    /// Kind of care the requester is browsing for.
    #[serde(default)]
    pub service_type: Option<String>,
}

impl NearbyQuery {
    /// The origin as a coordinate pair.
    pub const fn origin(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

/// Answer to a nearby-providers query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct NearbyProviders {
    /// Eligible providers, nearest first.
    pub candidates: Vec<Candidate>,
    /// Low end of the price range shown before booking.
    #[ts(as = "Option<String>")]
    pub estimate_min: Option<Decimal>,
    /// High end of the price range shown before booking.
    #[ts(as = "Option<String>")]
    pub estimate_max: Option<Decimal>,
}

/// Body of `POST /api/sessions/{id}/payment`. Absent fields are left as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate, TS)]
#[serde(default, rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct PaymentUpdate {
    /// Paid flag.
    pub paid: Option<bool>,
    /// Payment method.
    #[validate(length(min = 1, max = 32))]
    pub method: Option<String>,
    /// Processor reference.
    #[validate(length(min = 1, max = 128))]
    pub transaction_id: Option<String>,
    /// Amount charged.
    #[ts(as = "Option<String>")]
    pub amount: Option<Decimal>,
    /// Processor-specific extras. Replaces the stored value.
    pub metadata: Option<serde_json::Value>,
}

/// Body of `PUT /api/providers/me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ProviderRegistration {
    /// Display name.
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    /// Avatar URL.
    #[serde(default)]
    pub image: Option<String>,
}

/// Body of `PUT /api/requesters/me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct RequesterRegistration {
    /// Display name.
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    /// Contact number.
    #[serde(default)]
    pub phone: Option<String>,
}

/// Body of `PUT /api/providers/me/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct AvailabilityUpdate {
    /// `available` or `offline`. `engaged` is managed by dispatch.
    pub status: ProviderStatus,
}

/// Body of `POST /api/sessions/{id}/chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ChatText {
    /// Message body.
    #[validate(length(min = 1, max = 2000))]
    pub text: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_request_rejects_bad_origin_and_empty_service() {
        let bad = NewRequest {
            origin: Coordinates::new(95.0, 77.59),
            service_type: String::new(),
        };
        let errors = bad.validate().unwrap_err();
        let fields = errors.errors();
        assert!(fields.contains_key("origin"));
        assert!(fields.contains_key("service_type"));
    }

    #[test]
    fn payment_update_accepts_partial_body() {
        let update: PaymentUpdate =
            serde_json::from_str(r#"{"paid":true,"transactionId":"pi_123"}"#).unwrap();
        assert_eq!(update.paid, Some(true));
        assert_eq!(update.transaction_id.as_deref(), Some("pi_123"));
        assert!(update.method.is_none());
        assert!(update.validate().is_ok());
    }

    #[test]
    fn nearby_query_origin() {
        let q: NearbyQuery =
            serde_json::from_str(r#"{"latitude":12.97,"longitude":77.59}"#).unwrap();
        assert_eq!(q.origin(), Coordinates::new(12.97, 77.59));
        assert!(q.service_type.is_none());
    }
}
