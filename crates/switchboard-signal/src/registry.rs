//! Peer registry and session bookkeeping
//!
//! The registry is the only state shared between connection tasks.
//! Every check-then-set sequence (registration, pairing, cleanup) runs
//! under one mutex, so no interleaving can produce a one-sided session
//! or double-book a peer. Call sites never touch the maps directly;
//! they go through the atomic operations exposed here.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use switchboard_core::{ProtocolViolation, Reply};

use crate::conn::Outbound;

/// Identity a peer chose in its `HELLO`
pub type PeerId = String;

/// Handle for queueing writes onto a connection's writer task
pub type Outbox = mpsc::UnboundedSender<Outbound>;

/// Pairing state of a registered peer
///
/// A paired peer always records its partner, so "paired with nobody"
/// cannot be represented. The session table is exactly the set of
/// `Paired` entries: A holds `partner: B` and B holds `partner: A`,
/// created and destroyed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    Unpaired,
    Paired { partner: PeerId },
}

struct PeerEntry {
    outbox: Outbox,
    /// Remote address, kept for diagnostics only
    addr: SocketAddr,
    state: PairingState,
}

/// Why a `SESSION` request was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairError {
    /// Target identity was never registered
    NotFound,
    /// The caller is already in a session
    AlreadyInSession,
    /// The target is already in a session
    Busy,
    /// The caller was removed concurrently (its connection is being
    /// torn down); no reply is owed
    CallerGone,
}

/// Result of looking up where to forward a paired peer's message
#[derive(Debug)]
pub enum RelayTarget {
    /// Peer is not in a session (or no longer registered)
    NotPaired,
    /// Forward to this partner
    Partner { id: PeerId, outbox: Outbox },
    /// Registry claims a partner that is gone: consistency fault
    Vanished { partner: PeerId },
}

/// Connections that must be closed as a consequence of a removal
pub struct Removal {
    /// Whether the departing peer was actually registered
    pub removed: bool,
    /// `(peer, outbox, addr)` for every connection to close
    pub closed: Vec<(PeerId, Outbox, SocketAddr)>,
}

/// Shared peer registry
#[derive(Default)]
pub struct Registry {
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new peer in state `Unpaired`.
    pub fn register(
        &self,
        id: &str,
        addr: SocketAddr,
        outbox: Outbox,
    ) -> Result<(), ProtocolViolation> {
        let mut peers = self.peers.lock();

        if peers.contains_key(id) {
            return Err(ProtocolViolation::DuplicateIdentity);
        }

        peers.insert(
            id.to_string(),
            PeerEntry {
                outbox,
                addr,
                state: PairingState::Unpaired,
            },
        );
        Ok(())
    }

    /// Pair `caller` with `target`, atomically with respect to any
    /// other pairing or cleanup touching either peer.
    ///
    /// Both entries flip to `Paired` together or not at all. On
    /// success `SESSION_OK` is queued onto the caller's outbox while
    /// the lock is still held, so it reaches the caller before any
    /// payload the new partner relays. Pairing a peer with itself is
    /// permitted and yields an echo session, as in the reference
    /// servers.
    pub fn pair(&self, caller: &str, target: &str) -> Result<(), PairError> {
        let mut peers = self.peers.lock();

        if !peers.contains_key(target) {
            return Err(PairError::NotFound);
        }

        match peers.get(caller) {
            None => return Err(PairError::CallerGone),
            Some(entry) if entry.state != PairingState::Unpaired => {
                return Err(PairError::AlreadyInSession)
            }
            Some(_) => {}
        }

        if let Some(entry) = peers.get(target) {
            if entry.state != PairingState::Unpaired {
                return Err(PairError::Busy);
            }
        }

        if let Some(entry) = peers.get_mut(caller) {
            entry.state = PairingState::Paired {
                partner: target.to_string(),
            };
            let _ = entry
                .outbox
                .send(Outbound::Text(Reply::SessionOk.to_string()));
        }
        if let Some(entry) = peers.get_mut(target) {
            entry.state = PairingState::Paired {
                partner: caller.to_string(),
            };
        }
        Ok(())
    }

    /// Find the partner a paired peer's messages should be forwarded to.
    pub fn relay_target(&self, id: &str) -> RelayTarget {
        let peers = self.peers.lock();

        let partner = match peers.get(id) {
            Some(PeerEntry {
                state: PairingState::Paired { partner },
                ..
            }) => partner.clone(),
            _ => return RelayTarget::NotPaired,
        };

        match peers.get(&partner) {
            Some(entry) => RelayTarget::Partner {
                id: partner,
                outbox: entry.outbox.clone(),
            },
            None => RelayTarget::Vanished { partner },
        }
    }

    /// Remove a departing peer and unwind its session.
    ///
    /// If the peer was paired, the partner's entry is removed in the
    /// same critical section and its outbox is returned so the caller
    /// can force-close that connection too. Removing an absent id is a
    /// no-op, which makes cleanup idempotent.
    pub fn remove(&self, id: &str) -> Removal {
        let mut peers = self.peers.lock();

        let entry = match peers.remove(id) {
            Some(entry) => entry,
            None => {
                return Removal {
                    removed: false,
                    closed: Vec::new(),
                }
            }
        };

        let mut closed = vec![(id.to_string(), entry.outbox, entry.addr)];

        if let PairingState::Paired { partner } = entry.state {
            if partner != id {
                if let Some(other) = peers.remove(&partner) {
                    closed.push((partner, other.outbox, other.addr));
                }
            }
        }

        Removal {
            removed: true,
            closed,
        }
    }

    /// Remove every peer, returning their connections for closing.
    /// Used when draining the server on shutdown.
    pub fn drain(&self) -> Vec<(PeerId, Outbox, SocketAddr)> {
        let mut peers = self.peers.lock();
        peers
            .drain()
            .map(|(id, entry)| (id, entry.outbox, entry.addr))
            .collect()
    }

    /// Number of registered peers (for monitoring)
    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Pairing state of a peer, if registered
    pub fn state_of(&self, id: &str) -> Option<PairingState> {
        self.peers.lock().get(id).map(|e| e.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn addr() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    fn add_peer(registry: &Registry, id: &str) -> UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(id, addr(), tx).unwrap();
        rx
    }

    #[test]
    fn test_register_and_duplicate() {
        let registry = Registry::new();
        let _rx = add_peer(&registry, "alice");

        assert_eq!(registry.peer_count(), 1);
        assert_eq!(registry.state_of("alice"), Some(PairingState::Unpaired));

        let (tx, _rx2) = mpsc::unbounded_channel();
        assert_eq!(
            registry.register("alice", addr(), tx),
            Err(ProtocolViolation::DuplicateIdentity)
        );
        // Existing entry undisturbed
        assert_eq!(registry.peer_count(), 1);
        assert_eq!(registry.state_of("alice"), Some(PairingState::Unpaired));
    }

    #[test]
    fn test_pair_happy_path() {
        let registry = Registry::new();
        let mut a_rx = add_peer(&registry, "alice");
        let mut b_rx = add_peer(&registry, "bob");

        registry.pair("alice", "bob").unwrap();

        // The caller is told; the target just starts receiving traffic
        match a_rx.try_recv().unwrap() {
            Outbound::Text(text) => assert_eq!(text, "SESSION_OK"),
            other => panic!("expected SESSION_OK, got {:?}", other),
        }
        assert!(b_rx.try_recv().is_err());

        assert_eq!(
            registry.state_of("alice"),
            Some(PairingState::Paired {
                partner: "bob".into()
            })
        );
        assert_eq!(
            registry.state_of("bob"),
            Some(PairingState::Paired {
                partner: "alice".into()
            })
        );

        match registry.relay_target("alice") {
            RelayTarget::Partner { id, .. } => assert_eq!(id, "bob"),
            other => panic!("expected partner, got {:?}", other),
        }
        match registry.relay_target("bob") {
            RelayTarget::Partner { id, .. } => assert_eq!(id, "alice"),
            other => panic!("expected partner, got {:?}", other),
        }
    }

    #[test]
    fn test_pair_not_found() {
        let registry = Registry::new();
        let _a = add_peer(&registry, "alice");

        assert_eq!(registry.pair("alice", "zed"), Err(PairError::NotFound));
        assert_eq!(registry.state_of("alice"), Some(PairingState::Unpaired));
    }

    #[test]
    fn test_pair_busy_and_already() {
        let registry = Registry::new();
        let _a = add_peer(&registry, "alice");
        let _b = add_peer(&registry, "bob");
        let _c = add_peer(&registry, "carol");

        registry.pair("alice", "bob").unwrap();

        assert_eq!(registry.pair("carol", "bob"), Err(PairError::Busy));
        assert_eq!(
            registry.pair("alice", "carol"),
            Err(PairError::AlreadyInSession)
        );

        // The established session is unaffected
        assert_eq!(
            registry.state_of("bob"),
            Some(PairingState::Paired {
                partner: "alice".into()
            })
        );
        assert_eq!(registry.state_of("carol"), Some(PairingState::Unpaired));
    }

    #[test]
    fn test_pair_self() {
        let registry = Registry::new();
        let _a = add_peer(&registry, "alice");

        registry.pair("alice", "alice").unwrap();
        match registry.relay_target("alice") {
            RelayTarget::Partner { id, .. } => assert_eq!(id, "alice"),
            other => panic!("expected self partner, got {:?}", other),
        }

        let removal = registry.remove("alice");
        assert!(removal.removed);
        assert_eq!(removal.closed.len(), 1);
        assert_eq!(registry.peer_count(), 0);
    }

    #[test]
    fn test_remove_cascades_to_partner() {
        let registry = Registry::new();
        let _a = add_peer(&registry, "alice");
        let _b = add_peer(&registry, "bob");
        registry.pair("alice", "bob").unwrap();

        let removal = registry.remove("alice");
        assert!(removal.removed);
        let closed: Vec<&str> = removal.closed.iter().map(|(id, _, _)| id.as_str()).collect();
        assert_eq!(closed, vec!["alice", "bob"]);

        // Both gone; identities are free again
        assert_eq!(registry.peer_count(), 0);
        let _a2 = add_peer(&registry, "alice");
        let _b2 = add_peer(&registry, "bob");
    }

    #[test]
    fn test_remove_idempotent() {
        let registry = Registry::new();
        let _a = add_peer(&registry, "alice");

        assert!(registry.remove("alice").removed);
        let second = registry.remove("alice");
        assert!(!second.removed);
        assert!(second.closed.is_empty());

        let never = registry.remove("ghost");
        assert!(!never.removed);
    }

    #[test]
    fn test_unpaired_peer_leaves_partner_alone() {
        let registry = Registry::new();
        let _a = add_peer(&registry, "alice");
        let _b = add_peer(&registry, "bob");

        let removal = registry.remove("alice");
        assert_eq!(removal.closed.len(), 1);
        assert_eq!(registry.state_of("bob"), Some(PairingState::Unpaired));
    }

    #[test]
    fn test_drain() {
        let registry = Registry::new();
        let _a = add_peer(&registry, "alice");
        let _b = add_peer(&registry, "bob");

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.peer_count(), 0);
    }

    #[test]
    fn test_relay_target_unpaired() {
        let registry = Registry::new();
        let _a = add_peer(&registry, "alice");

        assert!(matches!(registry.relay_target("alice"), RelayTarget::NotPaired));
        assert!(matches!(registry.relay_target("ghost"), RelayTarget::NotPaired));
    }
}
