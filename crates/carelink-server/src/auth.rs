//! Bearer token authentication.
//!
//! Tokens are HS256 JWTs whose `sub` is the party's UUID and whose `role`
//! says which side of the service it acts on. REST handlers take a
//! [`Caller`] extractor; the socket surface verifies the `credential` field
//! of its `authenticate` and `register*` frames with the same
//! [`TokenService`].

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use carelink_core::DispatchError;
use carelink_core::config::AuthConfig;
use carelink_types::{Party, PartyRole, ProviderId, RequesterId};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Lifetime of an issued token.
const TOKEN_DURATION_SECS: i64 = 86_400;

/// JWT claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Party identity.
    pub sub: Uuid,
    /// Which side the identity acts on.
    pub role: PartyRole,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Issued at, seconds since the epoch.
    pub iat: i64,
    /// Issuer.
    pub iss: String,
}

impl Claims {
    /// The party these claims identify.
    pub fn party(&self) -> Party {
        match self.role {
            PartyRole::Requester => Party::Requester(RequesterId::from(self.sub)),
            PartyRole::Provider => Party::Provider(ProviderId::from(self.sub)),
        }
    }
}

/// Authentication failures.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No `Authorization` header.
    #[error("missing bearer token")]
    Missing,

    /// The header is not `Bearer <token>`.
    #[error("malformed authorization header")]
    Malformed,

    /// The token failed signature, expiry or issuer checks.
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

/// Issues and verifies tokens.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
}

impl TokenService {
    /// Create a service signing with `secret`.
    pub fn new(secret: &str, issuer: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.to_owned(),
        }
    }

    /// Create a service from the `auth` config section.
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(&config.jwt_secret, &config.issuer)
    }

    /// Issue a token for `party`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Invalid`] if encoding fails.
    pub fn issue(&self, party: Party) -> Result<String, AuthError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: party.uuid(),
            role: match party {
                Party::Requester(_) => PartyRole::Requester,
                Party::Provider(_) => PartyRole::Provider,
            },
            exp: now.saturating_add(TOKEN_DURATION_SECS),
            iat: now,
            iss: self.issuer.clone(),
        };
        Ok(encode(&Header::default(), &claims, &self.encoding_key)?)
    }

    /// Verify a token and return its claims.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Invalid`] for a bad signature, an expired token
    /// or a foreign issuer.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.issuer]);
        Ok(decode::<Claims>(token, &self.decoding_key, &validation)?.claims)
    }
}

/// The authenticated party behind a REST call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub Party);

impl Caller {
    /// The caller as a provider.
    ///
    /// # Errors
    ///
    /// Returns a forbidden error for requester tokens.
    pub fn provider(self) -> Result<ProviderId, ApiError> {
        match self.0 {
            Party::Provider(id) => Ok(id),
            Party::Requester(_) => Err(DispatchError::Forbidden(String::from(
                "provider token required",
            ))
            .into()),
        }
    }

    /// The caller as a requester.
    ///
    /// # Errors
    ///
    /// Returns a forbidden error for provider tokens.
    pub fn requester(self) -> Result<RequesterId, ApiError> {
        match self.0 {
            Party::Requester(id) => Ok(id),
            Party::Provider(_) => Err(DispatchError::Forbidden(String::from(
                "requester token required",
            ))
            .into()),
        }
    }
}

impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or(AuthError::Missing)?;
        let token = header
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AuthError::Malformed)?;
        let claims = state.tokens.verify(token.trim())?;
        Ok(Self(claims.party()))
    }
}
