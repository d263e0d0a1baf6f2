//! Candidate selection: who can be offered a request, and at what price.
//!
//! Distances for all eligible providers are computed concurrently. A
//! failure for one provider drops only that provider. Survivors within the
//! distance threshold are priced as `base + rate * km` and returned nearest
//! first; ties keep the input order.

use std::collections::BTreeSet;

use carelink_types::{Candidate, Coordinates, ProviderId, ProviderProfile, ProviderStatus};
use futures::future::join_all;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::config::MatchingConfig;
use crate::distance::DistanceProvider;

/// Ranks providers for a request origin.
#[derive(Debug, Clone)]
pub struct CandidateSelector {
    distance: DistanceProvider,
    max_distance_km: f64,
    base_charge: Decimal,
    per_km_rate: Decimal,
}

impl CandidateSelector {
    /// Create a selector using `distance` and the thresholds in `config`.
    pub fn new(distance: DistanceProvider, config: &MatchingConfig) -> Self {
        Self {
            distance,
            max_distance_km: config.max_distance_km,
            base_charge: config.base_charge,
            per_km_rate: config.per_km_rate,
        }
    }

    /// Eligible candidates for `origin`, nearest first.
    ///
    /// Providers that are not available, have no known position, or appear
    /// in `excluded` are skipped. Never fails: an empty result means nobody
    /// qualified.
    pub async fn select(
        &self,
        origin: Coordinates,
        service_type: &str,
        providers: &[ProviderProfile],
        excluded: &BTreeSet<ProviderId>,
    ) -> Vec<Candidate> {
        let eligible: Vec<(&ProviderProfile, Coordinates)> = providers
            .iter()
            .filter(|p| p.status == ProviderStatus::Available && !excluded.contains(&p.id))
            .filter_map(|p| p.coordinates.map(|c| (p, c)))
            .collect();

        let distances = join_all(
            eligible
                .iter()
                .map(|(_, coords)| self.distance.distance_km(origin, *coords)),
        )
        .await;

        let mut candidates: Vec<Candidate> = eligible
            .into_iter()
            .zip(distances)
            .filter_map(|((provider, coords), result)| match result {
                Ok(km) => self.candidate(provider, coords, km),
                Err(e) => {
                    tracing::warn!(
                        provider_id = %provider.id,
                        backend = self.distance.name(),
                        error = %e,
                        "Distance lookup failed, skipping provider"
                    );
                    None
                }
            })
            .collect();

        // Stable: equal distances keep input order.
        candidates.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));

        tracing::debug!(
            service_type,
            considered = providers.len(),
            selected = candidates.len(),
            "Candidates selected"
        );
        candidates
    }

    /// Price a single provider at `km` from the origin, if within range.
    fn candidate(
        &self,
        provider: &ProviderProfile,
        coords: Coordinates,
        km: f64,
    ) -> Option<Candidate> {
        if !km.is_finite() || km > self.max_distance_km {
            return None;
        }
        let distance = round_km(km);
        let Some(price_estimate) = self.price_for(distance) else {
            tracing::warn!(provider_id = %provider.id, km, "Price overflow, skipping provider");
            return None;
        };
        Some(Candidate {
            provider_id: provider.id,
            provider_name: provider.name.clone(),
            coordinates: coords,
            distance_km: distance,
            price_estimate,
        })
    }

    /// `base + rate * km`, rounded to 2 dp.
    pub fn price_for(&self, km: f64) -> Option<Decimal> {
        let km = Decimal::from_f64(km)?;
        let price = self
            .per_km_rate
            .checked_mul(km)?
            .checked_add(self.base_charge)?;
        Some(price.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
    }
}

/// Overall price range shown before booking.
///
/// The cheapest estimate is lowered and the dearest raised by `spread`
/// (0.10 widens by ten percent each way). `None` when there are no
/// candidates.
pub fn estimate_range(candidates: &[Candidate], spread: Decimal) -> Option<(Decimal, Decimal)> {
    let min = candidates.iter().map(|c| c.price_estimate).min()?;
    let max = candidates.iter().map(|c| c.price_estimate).max()?;
    let low = min.checked_mul(Decimal::ONE.checked_sub(spread)?)?;
    let high = max.checked_mul(Decimal::ONE.checked_add(spread)?)?;
    Some((low.round_dp(2), high.round_dp(2)))
}

/// Round a distance to 2 dp.
fn round_km(km: f64) -> f64 {
    (km * 100.0).round() / 100.0
}
