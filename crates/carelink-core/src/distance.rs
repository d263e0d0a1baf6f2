//! Distance collaborator.
//!
//! Enum dispatch over the available backends, the same way async backends
//! are selected elsewhere in the workspace: straight-line haversine
//! computed locally, or road distance from the Mapbox directions API.

use std::time::Duration;

use carelink_types::Coordinates;

use crate::config::{DistanceBackend, DistanceConfig};

/// Errors from a single distance computation.
#[derive(Debug, thiserror::Error)]
pub enum DistanceError {
    /// One of the endpoints is not a valid coordinate pair.
    #[error("invalid coordinates: {0:?}")]
    InvalidCoordinates(Coordinates),

    /// The HTTP call failed.
    #[error("distance request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The routing API answered with a non-success status.
    #[error("routing API returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for the log.
        body: String,
    },

    /// The routing API found no route between the endpoints.
    #[error("no route between endpoints")]
    NoRoute,
}

/// Computes the distance between two points in kilometres.
#[derive(Debug, Clone)]
pub enum DistanceProvider {
    /// Great-circle distance.
    Haversine,
    /// Mapbox driving distance.
    Mapbox(MapboxClient),
}

impl DistanceProvider {
    /// Build the provider named by the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DistanceError::Http`] if the HTTP client cannot be built.
    pub fn from_config(config: &DistanceConfig) -> Result<Self, DistanceError> {
        match config.backend {
            DistanceBackend::Haversine => Ok(Self::Haversine),
            DistanceBackend::Mapbox => Ok(Self::Mapbox(MapboxClient::new(config)?)),
        }
    }

    /// Distance from `from` to `to` in kilometres.
    ///
    /// # Errors
    ///
    /// Returns [`DistanceError`] if either point is invalid or the backend
    /// fails.
    pub async fn distance_km(
        &self,
        from: Coordinates,
        to: Coordinates,
    ) -> Result<f64, DistanceError> {
        for point in [from, to] {
            if !point.is_valid() {
                return Err(DistanceError::InvalidCoordinates(point));
            }
        }
        match self {
            Self::Haversine => Ok(from.haversine_km(&to)),
            Self::Mapbox(client) => client.driving_km(from, to).await,
        }
    }

    /// Human-readable name for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Haversine => "haversine",
            Self::Mapbox(_) => "mapbox",
        }
    }
}

/// Client for the Mapbox directions API.
///
/// Requests `{base_url}/{lon},{lat};{lon},{lat}` and reads
/// `routes[0].distance` (metres).
#[derive(Debug, Clone)]
pub struct MapboxClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl MapboxClient {
    /// Create a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DistanceError::Http`] if the HTTP client cannot be built.
    pub fn new(config: &DistanceConfig) -> Result<Self, DistanceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: config.mapbox_url.trim_end_matches('/').to_owned(),
            access_token: config.access_token.clone(),
        })
    }

    async fn driving_km(&self, from: Coordinates, to: Coordinates) -> Result<f64, DistanceError> {
        let url = format!(
            "{}/{},{};{},{}",
            self.base_url, from.longitude, from.latitude, to.longitude, to.latitude
        );
        let response = self
            .client
            .get(&url)
            .query(&[
                ("access_token", self.access_token.as_str()),
                ("overview", "false"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_owned());
            return Err(DistanceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let json: serde_json::Value = response.json().await?;
        extract_route_km(&json)
    }
}

/// Pull `routes[0].distance` out of a directions response, in kilometres.
fn extract_route_km(json: &serde_json::Value) -> Result<f64, DistanceError> {
    json.get("routes")
        .and_then(|r| r.get(0))
        .and_then(|r| r.get("distance"))
        .and_then(serde_json::Value::as_f64)
        .map(|metres| metres / 1000.0)
        .ok_or(DistanceError::NoRoute)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn haversine_rejects_invalid_points() {
        let ok = Coordinates::new(12.97, 77.59);
        let bad = Coordinates::new(f64::NAN, 77.59);
        let err = DistanceProvider::Haversine
            .distance_km(ok, bad)
            .await
            .unwrap_err();
        assert!(matches!(err, DistanceError::InvalidCoordinates(_)));
    }

    #[tokio::test]
    async fn haversine_is_symmetric() {
        let a = Coordinates::new(12.97, 77.59);
        let b = Coordinates::new(13.02, 77.64);
        let p = DistanceProvider::Haversine;
        let ab = p.distance_km(a, b).await.unwrap();
        let ba = p.distance_km(b, a).await.unwrap();
        assert!((ab - ba).abs() < 1e-9);
    }

    #[test]
    fn route_distance_is_converted_to_km() {
        let json = serde_json::json!({"routes": [{"distance": 12_345.0, "duration": 900.0}]});
        let km = extract_route_km(&json).unwrap();
        assert!((km - 12.345).abs() < 1e-9);
    }

    #[test]
    fn empty_routes_is_no_route() {
        let json = serde_json::json!({"routes": [], "code": "NoRoute"});
        assert!(matches!(
            extract_route_km(&json),
            Err(DistanceError::NoRoute)
        ));
    }
}
