//! Request records on `PostgreSQL`.
//!
//! Status changes go through [`RequestStore::compare_and_set`], a single
//! conditional `UPDATE`, so two concurrent accepts cannot both win even
//! across connections.

use carelink_types::{Coordinates, ProviderId, Request, RequestId, RequestStatus, RequesterId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::DbError;

/// Columns selected for every request query.
const REQUEST_COLUMNS: &str = "id, requester_id, requester_name, latitude, longitude, \
     service_type, status, provider_id, accepted_at, amount, created_at";

/// Operations on the `requests` table.
pub struct RequestStore<'a> {
    pool: &'a PgPool,
}

impl<'a> RequestStore<'a> {
    /// Create a request store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Persist a new request.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the insert fails (including a
    /// duplicate ID).
    pub async fn insert(&self, request: &Request) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO requests (id, requester_id, requester_name, latitude, longitude,
                                    service_type, status, provider_id, accepted_at, amount, created_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(request.id.into_inner())
        .bind(request.requester_id.into_inner())
        .bind(&request.requester_name)
        .bind(request.origin.latitude)
        .bind(request.origin.longitude)
        .bind(&request.service_type)
        .bind(request.status.as_str())
        .bind(request.provider_id.map(ProviderId::into_inner))
        .bind(request.accepted_at)
        .bind(request.amount)
        .bind(request.created_at)
        .execute(self.pool)
        .await?;
        tracing::debug!(request_id = %request.id, "Inserted request");
        Ok(())
    }

    /// Fetch one request.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn get(&self, id: RequestId) -> Result<Option<Request>, DbError> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE id = $1"
        ))
        .bind(id.into_inner())
        .fetch_optional(self.pool)
        .await?;
        row.map(Request::try_from).transpose()
    }

    /// Overwrite the mutable fields of `request` only if the stored status
    /// is still `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Conflict`] carrying the stored status when the
    /// condition fails, or [`DbError::NotFound`] if the request is unknown.
    pub async fn compare_and_set(
        &self,
        request: &Request,
        expected: RequestStatus,
    ) -> Result<(), DbError> {
        let result = sqlx::query(
            r"UPDATE requests
              SET status = $2, provider_id = $3, accepted_at = $4, amount = $5
              WHERE id = $1 AND status = $6",
        )
        .bind(request.id.into_inner())
        .bind(request.status.as_str())
        .bind(request.provider_id.map(ProviderId::into_inner))
        .bind(request.accepted_at)
        .bind(request.amount)
        .bind(expected.as_str())
        .execute(self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let actual: Option<String> =
            sqlx::query_scalar(r"SELECT status FROM requests WHERE id = $1")
                .bind(request.id.into_inner())
                .fetch_optional(self.pool)
                .await?;
        match actual {
            Some(actual) => Err(DbError::Conflict { actual }),
            None => Err(DbError::NotFound(format!("request {}", request.id))),
        }
    }

    /// The requester's pending request, if one is open.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn find_open_for_requester(
        &self,
        requester: RequesterId,
    ) -> Result<Option<Request>, DbError> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests
             WHERE requester_id = $1 AND status = 'pending'
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(requester.into_inner())
        .fetch_optional(self.pool)
        .await?;
        row.map(Request::try_from).transpose()
    }

    /// Every request still waiting for a provider, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn list_pending(&self) -> Result<Vec<Request>, DbError> {
        let rows = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE status = 'pending' ORDER BY created_at"
        ))
        .fetch_all(self.pool)
        .await?;
        rows.into_iter().map(Request::try_from).collect()
    }
}

/// A row from the `requests` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RequestRow {
    /// Request ID.
    pub id: Uuid,
    /// Requester ID.
    pub requester_id: Uuid,
    /// Requester display name.
    pub requester_name: String,
    /// Origin latitude.
    pub latitude: f64,
    /// Origin longitude.
    pub longitude: f64,
    /// Kind of care requested.
    pub service_type: String,
    /// Status as stored.
    pub status: String,
    /// Accepting provider.
    pub provider_id: Option<Uuid>,
    /// Acceptance time.
    pub accepted_at: Option<DateTime<Utc>>,
    /// Quoted amount.
    pub amount: Option<Decimal>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl TryFrom<RequestRow> for Request {
    type Error = DbError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        let status = RequestStatus::parse(&row.status)
            .ok_or_else(|| DbError::Corrupt(format!("request status {}", row.status)))?;
        Ok(Self {
            id: RequestId::from(row.id),
            requester_id: RequesterId::from(row.requester_id),
            requester_name: row.requester_name,
            origin: Coordinates::new(row.latitude, row.longitude),
            service_type: row.service_type,
            status,
            provider_id: row.provider_id.map(ProviderId::from),
            accepted_at: row.accepted_at,
            amount: row.amount,
            created_at: row.created_at,
        })
    }
}
