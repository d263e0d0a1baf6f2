//! Presence registry: which party is reachable over which live connection.
//!
//! At most one connection is bound per party. Deregistration is keyed by
//! connection identity, so a superseded connection that closes late can
//! never evict the newer one. Nothing here touches request or session
//! state; a missing entry only means "deliver through the offline channel".

use std::sync::Arc;

use carelink_types::{ConnectionId, Party, ServerMessage};
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Sending half of one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ConnectionHandle {
    /// Wrap the sender of a connection's outbound queue.
    pub fn new(tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: ConnectionId::new(),
            tx,
        }
    }

    /// Create a handle together with the receiver the socket task drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Connection identity.
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message. Returns `false` if the connection has gone away.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Outcome of [`PresenceRegistry::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the party's live connection.
    Delivered,
    /// No live connection; use the offline channel.
    Offline,
}

#[derive(Default)]
struct Inner {
    by_party: DashMap<Party, ConnectionHandle>,
    by_connection: DashMap<ConnectionId, Vec<Party>>,
}

/// Shared registry of live connections. Clones share state.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<Inner>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `party` to `handle`, replacing any earlier binding.
    ///
    /// Returns the connection that was superseded, if any.
    pub fn register(&self, party: Party, handle: ConnectionHandle) -> Option<ConnectionId> {
        let connection = handle.id();
        let previous = self
            .inner
            .by_party
            .insert(party, handle)
            .map(|old| old.id())
            .filter(|old| *old != connection);

        if let Some(old) = previous {
            if let Some(mut parties) = self.inner.by_connection.get_mut(&old) {
                parties.retain(|p| *p != party);
            }
            tracing::debug!(%party, superseded = %old, "Presence replaced");
        }

        let mut parties = self.inner.by_connection.entry(connection).or_default();
        if !parties.contains(&party) {
            parties.push(party);
        }
        previous
    }

    /// The live connection bound to `party`.
    pub fn lookup(&self, party: Party) -> Option<ConnectionHandle> {
        self.inner.by_party.get(&party).map(|h| h.clone())
    }

    /// Whether `party` currently has a live connection.
    pub fn is_connected(&self, party: Party) -> bool {
        self.inner.by_party.contains_key(&party)
    }

    /// Remove every binding still owned by `connection`.
    ///
    /// Bindings that have since moved to a newer connection are left alone.
    /// Returns the parties that were unbound.
    pub fn deregister(&self, connection: ConnectionId) -> Vec<Party> {
        let Some((_, parties)) = self.inner.by_connection.remove(&connection) else {
            return Vec::new();
        };
        parties
            .into_iter()
            .filter(|party| {
                self.inner
                    .by_party
                    .remove_if(party, |_, h| h.id() == connection)
                    .is_some()
            })
            .collect()
    }

    /// Queue `message` for `party`.
    ///
    /// A closed channel counts as offline and its stale binding is pruned.
    pub fn deliver(&self, party: Party, message: ServerMessage) -> Delivery {
        let Some(handle) = self.lookup(party) else {
            return Delivery::Offline;
        };
        if handle.send(message) {
            return Delivery::Delivered;
        }
        tracing::debug!(%party, connection = %handle.id(), "Pruning closed connection");
        self.deregister(handle.id());
        Delivery::Offline
    }

    /// Number of parties with a live connection.
    pub fn connected_count(&self) -> usize {
        self.inner.by_party.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use carelink_types::{Notice, ProviderId, RequesterId};

    use super::*;

    fn ping(text: &str) -> ServerMessage {
        ServerMessage::AuthError(Notice {
            message: text.to_owned(),
        })
    }

    #[test]
    fn register_replaces_previous_connection() {
        let registry = PresenceRegistry::new();
        let party = Party::Provider(ProviderId::new());
        let (first, _rx1) = ConnectionHandle::channel();
        let (second, _rx2) = ConnectionHandle::channel();
        let first_id = first.id();

        assert!(registry.register(party, first).is_none());
        assert_eq!(registry.register(party, second.clone()), Some(first_id));
        assert_eq!(registry.lookup(party).unwrap().id(), second.id());
        assert_eq!(registry.connected_count(), 1);
    }

    #[test]
    fn stale_deregister_does_not_evict_newer_connection() {
        let registry = PresenceRegistry::new();
        let party = Party::Requester(RequesterId::new());
        let (old, _rx1) = ConnectionHandle::channel();
        let (new, mut rx2) = ConnectionHandle::channel();
        let old_id = old.id();

        registry.register(party, old);
        registry.register(party, new);
        assert!(registry.deregister(old_id).is_empty());
        assert!(registry.is_connected(party));

        assert_eq!(registry.deliver(party, ping("hi")), Delivery::Delivered);
        assert_eq!(rx2.try_recv().unwrap(), ping("hi"));
    }

    #[test]
    fn deliver_to_absent_party_is_offline() {
        let registry = PresenceRegistry::new();
        let party = Party::Provider(ProviderId::new());
        assert_eq!(registry.deliver(party, ping("x")), Delivery::Offline);
    }

    #[test]
    fn closed_channel_is_pruned() {
        let registry = PresenceRegistry::new();
        let party = Party::Provider(ProviderId::new());
        let (handle, rx) = ConnectionHandle::channel();
        registry.register(party, handle);
        drop(rx);

        assert_eq!(registry.deliver(party, ping("x")), Delivery::Offline);
        assert!(!registry.is_connected(party));
    }

    #[test]
    fn reconnect_resumes_delivery() {
        let registry = PresenceRegistry::new();
        let party = Party::Requester(RequesterId::new());

        let (first, rx1) = ConnectionHandle::channel();
        let first_id = first.id();
        registry.register(party, first);
        assert_eq!(registry.deregister(first_id), vec![party]);
        drop(rx1);
        assert_eq!(registry.deliver(party, ping("lost")), Delivery::Offline);

        let (second, mut rx2) = ConnectionHandle::channel();
        registry.register(party, second);
        assert_eq!(registry.deliver(party, ping("back")), Delivery::Delivered);
        match rx2.try_recv().unwrap() {
            ServerMessage::AuthError(n) => assert_eq!(n.message, "back"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
