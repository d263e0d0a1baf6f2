//! Offline notification collaborator.
//!
//! When a party that must hear about an offer or an acceptance has no live
//! connection, the notice is handed to an external push service through a
//! webhook. Delivery is fire-and-forget: the core never retries, and a
//! failure is logged and otherwise ignored.

use std::time::Duration;

use carelink_types::{Coordinates, PartyRole, RequestId};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::config::NotificationConfig;

/// Errors from one webhook call.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The HTTP call failed.
    #[error("notification request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The push service answered with a non-success status.
    #[error("notification service returned {0}")]
    Status(u16),
}

/// What the offline party is being told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// A new request was offered to a provider.
    NewOffer,
    /// A provider accepted the requester's request.
    OfferAccepted,
}

/// Body posted to the push webhook.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineNotice {
    /// Recipient identity.
    pub id: Uuid,
    /// Recipient role.
    pub role: PartyRole,
    /// Notice kind.
    #[serde(rename = "type")]
    pub kind: NoticeKind,
    /// Request the notice is about.
    pub request_id: RequestId,
    /// Identity of the other party.
    pub user_id: Uuid,
    /// Display name of the other party.
    pub user_name: String,
    /// Latitude of the relevant position (origin for offers).
    pub latitude: Option<f64>,
    /// Longitude of the relevant position.
    pub longitude: Option<f64>,
    /// Quoted amount.
    pub amount: Option<Decimal>,
    /// Distance in kilometres.
    pub distance: Option<f64>,
}

impl OfflineNotice {
    /// Attach a position to the notice.
    #[must_use]
    pub fn at(mut self, coords: Option<Coordinates>) -> Self {
        if let Some(c) = coords {
            self.latitude = Some(c.latitude);
            self.longitude = Some(c.longitude);
        }
        self
    }
}

/// Offline delivery channel.
#[derive(Debug, Clone)]
pub enum Notifier {
    /// Offline parties are not notified.
    Disabled,
    /// Notices are posted to a webhook.
    Webhook(WebhookNotifier),
}

impl Notifier {
    /// Build the notifier named by the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Http`] if the HTTP client cannot be built.
    pub fn from_config(config: &NotificationConfig) -> Result<Self, NotifyError> {
        match &config.webhook_url {
            Some(url) if !url.is_empty() => Ok(Self::Webhook(WebhookNotifier::new(
                url,
                Duration::from_millis(config.timeout_ms),
            )?)),
            _ => Ok(Self::Disabled),
        }
    }

    /// Deliver one notice and wait for the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] if the webhook call fails.
    pub async fn notify(&self, notice: &OfflineNotice) -> Result<(), NotifyError> {
        match self {
            Self::Disabled => Ok(()),
            Self::Webhook(hook) => hook.post(notice).await,
        }
    }

    /// Deliver one notice in the background, logging any failure.
    pub fn dispatch(&self, notice: OfflineNotice) {
        if matches!(self, Self::Disabled) {
            tracing::debug!(request_id = %notice.request_id, "Offline notifications disabled");
            return;
        }
        let notifier = self.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&notice).await {
                tracing::warn!(
                    request_id = %notice.request_id,
                    recipient = %notice.id,
                    error = %e,
                    "Offline notification failed"
                );
            }
        });
    }
}

/// Posts notices as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// Create a notifier for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Http`] if the HTTP client cannot be built.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_owned(),
        })
    }

    async fn post(&self, notice: &OfflineNotice) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(notice).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        tracing::debug!(request_id = %notice.request_id, recipient = %notice.id, "Offline notice sent");
        Ok(())
    }
}
