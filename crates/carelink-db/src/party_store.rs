//! Provider and requester records on `PostgreSQL`.
//!
//! Profile management is owned by another service; dispatch only reads
//! names and flips provider availability and position.

use carelink_types::{Coordinates, ProviderId, ProviderProfile, ProviderStatus, RequesterId, RequesterProfile};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::DbError;

/// Operations on the `providers` and `requesters` tables.
pub struct PartyStore<'a> {
    pool: &'a PgPool,
}

impl<'a> PartyStore<'a> {
    /// Create a party store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Insert or replace a provider record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the write fails.
    pub async fn upsert_provider(&self, provider: &ProviderProfile) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO providers (id, name, image, status, latitude, longitude, updated_at)
              VALUES ($1, $2, $3, $4, $5, $6, now())
              ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                image = EXCLUDED.image,
                status = EXCLUDED.status,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                updated_at = now()",
        )
        .bind(provider.id.into_inner())
        .bind(&provider.name)
        .bind(&provider.image)
        .bind(provider.status.as_str())
        .bind(provider.coordinates.map(|c| c.latitude))
        .bind(provider.coordinates.map(|c| c.longitude))
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one provider.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails or
    /// [`DbError::Corrupt`] if the stored status is unknown.
    pub async fn get_provider(&self, id: ProviderId) -> Result<Option<ProviderProfile>, DbError> {
        let row = sqlx::query_as::<_, ProviderRow>(
            r"SELECT id, name, image, status, latitude, longitude
              FROM providers WHERE id = $1",
        )
        .bind(id.into_inner())
        .fetch_optional(self.pool)
        .await?;
        row.map(ProviderProfile::try_from).transpose()
    }

    /// Every provider currently marked available.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn list_available_providers(&self) -> Result<Vec<ProviderProfile>, DbError> {
        let rows = sqlx::query_as::<_, ProviderRow>(
            r"SELECT id, name, image, status, latitude, longitude
              FROM providers WHERE status = 'available'
              ORDER BY id",
        )
        .fetch_all(self.pool)
        .await?;
        rows.into_iter().map(ProviderProfile::try_from).collect()
    }

    /// Flip a provider's availability.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if the provider does not exist.
    pub async fn set_provider_status(
        &self,
        id: ProviderId,
        status: ProviderStatus,
    ) -> Result<(), DbError> {
        let result = sqlx::query(
            r"UPDATE providers SET status = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id.into_inner())
        .bind(status.as_str())
        .execute(self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("provider {id}")));
        }
        Ok(())
    }

    /// Move a provider's last known position.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if the provider does not exist.
    pub async fn set_provider_coordinates(
        &self,
        id: ProviderId,
        coords: Coordinates,
    ) -> Result<(), DbError> {
        let result = sqlx::query(
            r"UPDATE providers SET latitude = $2, longitude = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id.into_inner())
        .bind(coords.latitude)
        .bind(coords.longitude)
        .execute(self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("provider {id}")));
        }
        Ok(())
    }

    /// Insert or replace a requester record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the write fails.
    pub async fn upsert_requester(&self, requester: &RequesterProfile) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO requesters (id, name, phone) VALUES ($1, $2, $3)
              ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, phone = EXCLUDED.phone",
        )
        .bind(requester.id.into_inner())
        .bind(&requester.name)
        .bind(&requester.phone)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one requester.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn get_requester(&self, id: RequesterId) -> Result<Option<RequesterProfile>, DbError> {
        let row = sqlx::query_as::<_, RequesterRow>(
            r"SELECT id, name, phone FROM requesters WHERE id = $1",
        )
        .bind(id.into_inner())
        .fetch_optional(self.pool)
        .await?;
        Ok(row.map(|r| RequesterProfile {
            id: RequesterId::from(r.id),
            name: r.name,
            phone: r.phone,
        }))
    }
}

/// A row from the `providers` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProviderRow {
    /// Provider ID.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Avatar URL.
    pub image: Option<String>,
    /// Availability as stored.
    pub status: String,
    /// Last latitude.
    pub latitude: Option<f64>,
    /// Last longitude.
    pub longitude: Option<f64>,
}

impl TryFrom<ProviderRow> for ProviderProfile {
    type Error = DbError;

    fn try_from(row: ProviderRow) -> Result<Self, Self::Error> {
        let status = ProviderStatus::parse(&row.status)
            .ok_or_else(|| DbError::Corrupt(format!("provider status {}", row.status)))?;
        let coordinates = match (row.latitude, row.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates::new(latitude, longitude)),
            _ => None,
        };
        Ok(Self {
            id: ProviderId::from(row.id),
            name: row.name,
            image: row.image,
            status,
            coordinates,
        })
    }
}

/// A row from the `requesters` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RequesterRow {
    /// Requester ID.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Contact number.
    pub phone: Option<String>,
}
