//! Session records on `PostgreSQL`.
//!
//! Location history and chat are JSONB arrays. Appends are a single
//! `UPDATE ... SET col = col || $n` so the stored order is arrival order.

use std::collections::BTreeMap;

use carelink_types::{
    ChatMessage, Coordinates, LocationPoint, Party, Payment, ProviderId, RequesterId, Session,
    SessionId, SessionStatus,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::DbError;

/// Columns selected for every session query.
const SESSION_COLUMNS: &str = "id, requester_id, requester_name, provider_id, provider_name, \
     provider_image, service_type, origin_latitude, origin_longitude, status, current_location, \
     location_history, chat, payment, amount, accepted_at, metadata, created_at, updated_at";

/// Operations on the `sessions` table.
pub struct SessionRecordStore<'a> {
    pool: &'a PgPool,
}

impl<'a> SessionRecordStore<'a> {
    /// Create a session store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Create or fully overwrite a session record.
    ///
    /// Applying the same record twice leaves the row unchanged apart from
    /// `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if a JSON column cannot be encoded
    /// or [`DbError::Postgres`] if the write fails.
    pub async fn upsert(&self, session: &Session) -> Result<(), DbError> {
        let current = session
            .current
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let history = serde_json::to_value(&session.location_history)?;
        let chat = serde_json::to_value(&session.chat)?;
        let payment = serde_json::to_value(&session.payment)?;
        let metadata = serde_json::to_value(&session.metadata)?;

        sqlx::query(
            r"INSERT INTO sessions (id, requester_id, requester_name, provider_id, provider_name,
                                    provider_image, service_type, origin_latitude, origin_longitude,
                                    status, current_location, location_history, chat, payment,
                                    amount, accepted_at, metadata, created_at, updated_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
              ON CONFLICT (id) DO UPDATE SET
                requester_id = EXCLUDED.requester_id,
                requester_name = EXCLUDED.requester_name,
                provider_id = EXCLUDED.provider_id,
                provider_name = EXCLUDED.provider_name,
                provider_image = EXCLUDED.provider_image,
                service_type = EXCLUDED.service_type,
                origin_latitude = EXCLUDED.origin_latitude,
                origin_longitude = EXCLUDED.origin_longitude,
                status = EXCLUDED.status,
                current_location = EXCLUDED.current_location,
                location_history = EXCLUDED.location_history,
                chat = EXCLUDED.chat,
                payment = EXCLUDED.payment,
                amount = EXCLUDED.amount,
                accepted_at = EXCLUDED.accepted_at,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(session.id.into_inner())
        .bind(session.requester_id.into_inner())
        .bind(&session.requester_name)
        .bind(session.provider_id.into_inner())
        .bind(&session.provider_name)
        .bind(&session.provider_image)
        .bind(&session.service_type)
        .bind(session.origin.latitude)
        .bind(session.origin.longitude)
        .bind(session.status.as_str())
        .bind(current)
        .bind(history)
        .bind(chat)
        .bind(payment)
        .bind(session.amount)
        .bind(session.accepted_at)
        .bind(metadata)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(self.pool)
        .await?;
        tracing::debug!(session_id = %session.id, status = %session.status, "Upserted session");
        Ok(())
    }

    /// Fetch one session.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails or
    /// [`DbError::Corrupt`] if a column cannot be decoded.
    pub async fn get(&self, id: SessionId) -> Result<Option<Session>, DbError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"
        ))
        .bind(id.into_inner())
        .fetch_optional(self.pool)
        .await?;
        row.map(Session::try_from).transpose()
    }

    /// Append a point to the history and move the current position.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if the session does not exist, or
    /// [`DbError::Conflict`] if it has ended.
    pub async fn append_location(
        &self,
        id: SessionId,
        point: &LocationPoint,
        updated_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let value = serde_json::to_value(point)?;
        let result = sqlx::query(
            r"UPDATE sessions
              SET current_location = $2,
                  location_history = location_history || jsonb_build_array($2::jsonb),
                  updated_at = $3
              WHERE id = $1 AND status NOT IN ('completed', 'cancelled')",
        )
        .bind(id.into_inner())
        .bind(value)
        .bind(updated_at)
        .execute(self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.refused_append(id).await);
        }
        Ok(())
    }

    /// Append a chat line.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if the session does not exist, or
    /// [`DbError::Conflict`] if it has ended.
    pub async fn append_chat(
        &self,
        id: SessionId,
        message: &ChatMessage,
        updated_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let value = serde_json::to_value(message)?;
        let result = sqlx::query(
            r"UPDATE sessions
              SET chat = chat || jsonb_build_array($2::jsonb),
                  updated_at = $3
              WHERE id = $1 AND status NOT IN ('completed', 'cancelled')",
        )
        .bind(id.into_inner())
        .bind(value)
        .bind(updated_at)
        .execute(self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.refused_append(id).await);
        }
        Ok(())
    }

    /// Why an append matched no live row.
    async fn refused_append(&self, id: SessionId) -> DbError {
        let status = sqlx::query_scalar::<_, String>("SELECT status FROM sessions WHERE id = $1")
            .bind(id.into_inner())
            .fetch_optional(self.pool)
            .await;
        match status {
            Ok(Some(actual)) => DbError::Conflict { actual },
            Ok(None) => DbError::NotFound(format!("session {id}")),
            Err(e) => e.into(),
        }
    }

    /// Persist a status change together with its metadata annotations.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if the session does not exist.
    pub async fn save_status(&self, session: &Session) -> Result<(), DbError> {
        let metadata = serde_json::to_value(&session.metadata)?;
        let result = sqlx::query(
            r"UPDATE sessions SET status = $2, metadata = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(session.id.into_inner())
        .bind(session.status.as_str())
        .bind(metadata)
        .bind(session.updated_at)
        .execute(self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("session {}", session.id)));
        }
        Ok(())
    }

    /// Replace the payment sub-record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if the session does not exist.
    pub async fn set_payment(
        &self,
        id: SessionId,
        payment: &Payment,
        updated_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let value = serde_json::to_value(payment)?;
        let result =
            sqlx::query(r"UPDATE sessions SET payment = $2, updated_at = $3 WHERE id = $1")
                .bind(id.into_inner())
                .bind(value)
                .bind(updated_at)
                .execute(self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    /// The most recently accepted non-terminal session involving `party`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn find_active_for_party(&self, party: Party) -> Result<Option<Session>, DbError> {
        let column = party_column(party);
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE {column} = $1 AND status NOT IN ('completed', 'cancelled')
             ORDER BY accepted_at DESC LIMIT 1"
        ))
        .bind(party.uuid())
        .fetch_optional(self.pool)
        .await?;
        row.map(Session::try_from).transpose()
    }

    /// Every session involving `party`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn list_for_party(&self, party: Party) -> Result<Vec<Session>, DbError> {
        let column = party_column(party);
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE {column} = $1
             ORDER BY created_at DESC"
        ))
        .bind(party.uuid())
        .fetch_all(self.pool)
        .await?;
        rows.into_iter().map(Session::try_from).collect()
    }
}

/// Column holding the given party's identity.
const fn party_column(party: Party) -> &'static str {
    match party {
        Party::Requester(_) => "requester_id",
        Party::Provider(_) => "provider_id",
    }
}

/// A row from the `sessions` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    /// Session (and request) ID.
    pub id: Uuid,
    /// Requester ID.
    pub requester_id: Uuid,
    /// Requester display name.
    pub requester_name: String,
    /// Provider ID.
    pub provider_id: Uuid,
    /// Provider display name.
    pub provider_name: String,
    /// Provider avatar URL.
    pub provider_image: Option<String>,
    /// Kind of care requested.
    pub service_type: String,
    /// Origin latitude.
    pub origin_latitude: f64,
    /// Origin longitude.
    pub origin_longitude: f64,
    /// Status as stored.
    pub status: String,
    /// Latest point as JSON.
    pub current_location: Option<serde_json::Value>,
    /// History as a JSON array.
    pub location_history: serde_json::Value,
    /// Chat as a JSON array.
    pub chat: serde_json::Value,
    /// Payment as JSON.
    pub payment: serde_json::Value,
    /// Agreed amount.
    pub amount: Decimal,
    /// Acceptance time.
    pub accepted_at: DateTime<Utc>,
    /// Free-form annotations as JSON.
    pub metadata: serde_json::Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for Session {
    type Error = DbError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let status = SessionStatus::parse(&row.status)
            .ok_or_else(|| DbError::Corrupt(format!("session status {}", row.status)))?;
        let current = row.current_location.map(serde_json::from_value).transpose()?;
        let location_history: Vec<LocationPoint> = serde_json::from_value(row.location_history)?;
        let chat: Vec<ChatMessage> = serde_json::from_value(row.chat)?;
        let payment: Payment = serde_json::from_value(row.payment)?;
        let metadata: BTreeMap<String, serde_json::Value> = serde_json::from_value(row.metadata)?;
        Ok(Self {
            id: SessionId::from(row.id),
            requester_id: RequesterId::from(row.requester_id),
            requester_name: row.requester_name,
            provider_id: ProviderId::from(row.provider_id),
            provider_name: row.provider_name,
            provider_image: row.provider_image,
            service_type: row.service_type,
            origin: Coordinates::new(row.origin_latitude, row.origin_longitude),
            status,
            current,
            location_history,
            chat,
            payment,
            amount: row.amount,
            accepted_at: row.accepted_at,
            metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
