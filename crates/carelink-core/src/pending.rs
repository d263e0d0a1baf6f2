//! Index of requests that are still waiting for a provider.
//!
//! Holds what matching needs between rounds: the offered candidates and
//! the providers that must not be offered again. Also answers proximity
//! queries for the "provider nearby" signal.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use carelink_types::{Candidate, Coordinates, ProviderId, RequestId, RequesterId};
use dashmap::DashMap;

/// Matching state of one pending request.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    /// Who asked.
    pub requester_id: RequesterId,
    /// Requester display name.
    pub requester_name: String,
    /// Where care is needed.
    pub origin: Coordinates,
    /// Kind of care.
    pub service_type: String,
    /// Candidates holding an open offer in the current round.
    pub offered: Vec<Candidate>,
    /// Providers that declined or backed out.
    pub excluded: BTreeSet<ProviderId>,
    /// Number of the current offer round, unique across the index.
    pub round: u64,
}

impl PendingEntry {
    /// The offered candidate line for `provider`, if any.
    pub fn offer_for(&self, provider: ProviderId) -> Option<&Candidate> {
        self.offered.iter().find(|c| c.provider_id == provider)
    }

    /// Identities of every provider holding an open offer.
    pub fn offered_ids(&self) -> Vec<ProviderId> {
        self.offered.iter().map(|c| c.provider_id).collect()
    }
}

/// A pending request within range of some point.
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyPending {
    /// Request identity.
    pub request_id: RequestId,
    /// Its requester.
    pub requester_id: RequesterId,
    /// Straight-line distance from the point to the origin in kilometres.
    pub distance_km: f64,
}

/// Shared pending-request index. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct PendingIndex {
    entries: Arc<DashMap<RequestId, PendingEntry>>,
    rounds: Arc<AtomicU64>,
}

impl PendingIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `id`, replacing any earlier entry.
    pub fn insert(&self, id: RequestId, entry: PendingEntry) {
        self.entries.insert(id, entry);
    }

    /// Stop tracking `id`.
    pub fn remove(&self, id: RequestId) -> Option<PendingEntry> {
        self.entries.remove(&id).map(|(_, e)| e)
    }

    /// Snapshot of the entry for `id`.
    pub fn get(&self, id: RequestId) -> Option<PendingEntry> {
        self.entries.get(&id).map(|e| e.clone())
    }

    /// Record that `provider` declined `id` and withdraw its offer.
    ///
    /// Returns the entry as updated, or `None` if `id` is not pending.
    pub fn decline(&self, id: RequestId, provider: ProviderId) -> Option<PendingEntry> {
        let mut entry = self.entries.get_mut(&id)?;
        entry.offered.retain(|c| c.provider_id != provider);
        entry.excluded.insert(provider);
        Some(entry.clone())
    }

    /// Replace the open offers of `id` with a new round.
    ///
    /// Returns the number of the new round, or `None` if `id` is not pending.
    pub fn set_offered(&self, id: RequestId, offered: Vec<Candidate>) -> Option<u64> {
        let mut entry = self.entries.get_mut(&id)?;
        entry.offered = offered;
        entry.round = self.rounds.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        Some(entry.round)
    }

    /// Whether `round` is still the latest offer round of `id`.
    pub fn is_current_round(&self, id: RequestId, round: u64) -> bool {
        self.entries.get(&id).is_some_and(|e| e.round == round)
    }

    /// Pending requests whose origin lies within `radius_km` of `point`.
    pub fn within(
        &self,
        point: Coordinates,
        radius_km: f64,
        except: Option<RequestId>,
    ) -> Vec<NearbyPending> {
        self.entries
            .iter()
            .filter(|e| Some(*e.key()) != except)
            .filter_map(|e| {
                let distance_km = point.haversine_km(&e.origin);
                (distance_km <= radius_km).then(|| NearbyPending {
                    request_id: *e.key(),
                    requester_id: e.requester_id,
                    distance_km,
                })
            })
            .collect()
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    fn candidate(provider_id: ProviderId) -> Candidate {
        Candidate {
            provider_id,
            provider_name: String::from("Neha"),
            coordinates: Coordinates::new(12.98, 77.6),
            distance_km: 1.5,
            price_estimate: Decimal::new(6500, 2),
        }
    }

    fn entry(origin: Coordinates, offered: Vec<Candidate>) -> PendingEntry {
        PendingEntry {
            requester_id: RequesterId::new(),
            requester_name: String::from("Asha"),
            origin,
            service_type: String::from("elder_care"),
            offered,
            excluded: BTreeSet::new(),
            round: 0,
        }
    }

    #[test]
    fn decline_withdraws_and_excludes() {
        let index = PendingIndex::new();
        let (a, b) = (ProviderId::new(), ProviderId::new());
        let id = RequestId::new();
        index.insert(id, entry(Coordinates::new(12.97, 77.59), vec![candidate(a), candidate(b)]));

        let updated = index.decline(id, a).unwrap();
        assert_eq!(updated.offered_ids(), vec![b]);
        assert!(updated.excluded.contains(&a));
        assert!(updated.offer_for(a).is_none());
        assert!(index.decline(RequestId::new(), a).is_none());
    }

    #[test]
    fn within_respects_radius_and_exception() {
        let index = PendingIndex::new();
        let near = RequestId::new();
        let far = RequestId::new();
        let own = RequestId::new();
        index.insert(near, entry(Coordinates::new(12.975, 77.59), Vec::new()));
        index.insert(far, entry(Coordinates::new(13.20, 77.59), Vec::new()));
        index.insert(own, entry(Coordinates::new(12.97, 77.59), Vec::new()));

        let hits = index.within(Coordinates::new(12.97, 77.59), 1.0, Some(own));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].request_id, near);
        assert!(hits[0].distance_km < 1.0);
    }

    #[test]
    fn new_round_supersedes_old() {
        let index = PendingIndex::new();
        let id = RequestId::new();
        index.insert(id, entry(Coordinates::new(12.97, 77.59), Vec::new()));

        let first = index.set_offered(id, vec![candidate(ProviderId::new())]).unwrap();
        assert!(index.is_current_round(id, first));
        let second = index.set_offered(id, vec![candidate(ProviderId::new())]).unwrap();
        assert!(!index.is_current_round(id, first));
        assert!(index.is_current_round(id, second));

        index.remove(id);
        assert!(!index.is_current_round(id, second));
        assert!(index.set_offered(id, Vec::new()).is_none());
    }
}
