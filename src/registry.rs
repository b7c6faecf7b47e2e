use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::Dialect;
use crate::task::Task;

/// Address key for the peer registry. Owned by value: the address octets are
///  copied out of whatever buffer the kernel handed us, and equality / hash
///  are structural over all octets plus the port. IPv6 flow and scope metadata
///  are deliberately not part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerKey {
    V4 { ip: u32, port: u16 },
    V6 { ip: u128, port: u16 },
}

impl From<SocketAddr> for PeerKey {
    fn from(addr: SocketAddr) -> PeerKey {
        match addr.ip() {
            IpAddr::V4(ip) => PeerKey::V4 {
                ip: ip.to_bits(),
                port: addr.port(),
            },
            IpAddr::V6(ip) => PeerKey::V6 {
                ip: ip.to_bits(),
                port: addr.port(),
            },
        }
    }
}

/// Per-peer session state, represented as a tagged variant so the UDP engine's
///  core can be a pure transition function over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitingAnswer {
        task: Task,
        dialect: Dialect,
        last_sent_at: Instant,
        resend_count: u32,
    },
    /// Retained for the finalize-grace window so duplicate answers get the
    ///  stored acknowledgement bytes back, byte for byte.
    Finalized {
        task_id: u32,
        dialect: Dialect,
        ok: bool,
        ack: Vec<u8>,
        finalized_at: Instant,
    },
}

impl SessionState {
    pub fn is_awaiting(&self) -> bool {
        matches!(self, SessionState::AwaitingAnswer { .. })
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            SessionState::AwaitingAnswer { dialect, .. } => *dialect,
            SessionState::Finalized { dialect, .. } => *dialect,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    /// reply target, as observed on the most recent datagram from this peer
    pub addr: SocketAddr,
    pub state: SessionState,
}

/// Address-keyed store of sessions. Owned exclusively by the UDP engine's loop;
///  all mutation happens there, so no synchronization is needed.
pub struct PeerRegistry {
    sessions: FxHashMap<PeerKey, Session>,
    max_awaiting: usize,
}

impl PeerRegistry {
    pub fn new(max_awaiting: usize) -> PeerRegistry {
        PeerRegistry {
            sessions: FxHashMap::default(),
            max_awaiting,
        }
    }

    pub fn lookup(&self, key: &PeerKey) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn insert(&mut self, key: PeerKey, session: Session) {
        self.sessions.insert(key, session);
    }

    pub fn erase(&mut self, key: &PeerKey) {
        self.sessions.remove(key);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn awaiting_len(&self) -> usize {
        self.sessions.values().filter(|s| s.state.is_awaiting()).count()
    }

    /// Whether a new session may be created. Above the ceiling, new-session
    ///  creation is refused and the triggering datagram is dropped.
    pub fn may_create(&self) -> bool {
        self.awaiting_len() < self.max_awaiting
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PeerKey, &mut Session)> {
        self.sessions.iter_mut()
    }

    /// Eviction pass: drops sessions whose assignment outlived the task
    ///  lifetime without an answer, and finalized sessions past the grace
    ///  window. An unanswered session is kept for one grace window beyond the
    ///  task lifetime so a late answer still gets its NOT_OK acknowledgement.
    ///  Returns the number of evicted sessions.
    pub fn sweep(&mut self, now: Instant, task_lifetime: Duration, finalize_grace: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|key, session| {
            let keep = match &session.state {
                SessionState::AwaitingAnswer { task, .. } => task.age(now) <= task_lifetime + finalize_grace,
                SessionState::Finalized { finalized_at, .. } => {
                    now.saturating_duration_since(*finalized_at) <= finalize_grace
                }
            };
            if !keep {
                debug!(?key, "evicting session");
            }
            keep
        });
        before - self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::str::FromStr;

    use tokio::time;

    use crate::task::Operation;

    use super::*;

    fn addr(s: &str) -> SocketAddr {
        SocketAddr::from_str(s).unwrap()
    }

    fn awaiting(id: u32, created_at: Instant) -> SessionState {
        SessionState::AwaitingAnswer {
            task: Task {
                id,
                op: Operation::Add,
                v1: 1,
                v2: 2,
                created_at,
            },
            dialect: Dialect::Binary,
            last_sent_at: created_at,
            resend_count: 0,
        }
    }

    fn finalized(id: u32, finalized_at: Instant) -> SessionState {
        SessionState::Finalized {
            task_id: id,
            dialect: Dialect::Binary,
            ok: true,
            ack: vec![1, 2, 3],
            finalized_at,
        }
    }

    #[test]
    fn test_key_is_structural() {
        assert_eq!(PeerKey::from(addr("127.0.0.1:9000")), PeerKey::from(addr("127.0.0.1:9000")));
        assert_ne!(PeerKey::from(addr("127.0.0.1:9000")), PeerKey::from(addr("127.0.0.1:9001")));
        assert_ne!(PeerKey::from(addr("127.0.0.2:9000")), PeerKey::from(addr("127.0.0.1:9000")));
        assert_ne!(PeerKey::from(addr("[::1]:9000")), PeerKey::from(addr("127.0.0.1:9000")));
    }

    #[test]
    fn test_key_ignores_v6_scope() {
        let plain = addr("[fe80::1]:9000");
        let mut scoped = plain;
        if let SocketAddr::V6(ref mut v6) = scoped {
            v6.set_scope_id(3);
        }
        assert_eq!(PeerKey::from(plain), PeerKey::from(scoped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_counts_only_awaiting() {
        let now = Instant::now();
        let mut registry = PeerRegistry::new(2);

        registry.insert(
            PeerKey::from(addr("10.0.0.1:1")),
            Session { addr: addr("10.0.0.1:1"), state: awaiting(1, now) },
        );
        assert!(registry.may_create());

        registry.insert(
            PeerKey::from(addr("10.0.0.2:1")),
            Session { addr: addr("10.0.0.2:1"), state: awaiting(2, now) },
        );
        assert!(!registry.may_create());

        // finalized sessions do not count against the ceiling
        registry.insert(
            PeerKey::from(addr("10.0.0.2:1")),
            Session { addr: addr("10.0.0.2:1"), state: finalized(2, now) },
        );
        assert!(registry.may_create());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_expired_awaiting() {
        let mut registry = PeerRegistry::new(10);
        let lifetime = Duration::from_secs(10);
        let grace = Duration::from_secs(2);

        registry.insert(
            PeerKey::from(addr("10.0.0.1:1")),
            Session { addr: addr("10.0.0.1:1"), state: awaiting(1, Instant::now()) },
        );

        // still answerable one grace window past the task lifetime
        time::advance(Duration::from_secs(11)).await;
        assert_eq!(registry.sweep(Instant::now(), lifetime, grace), 0);
        assert_eq!(registry.len(), 1);

        time::advance(Duration::from_secs(2)).await;
        assert_eq!(registry.sweep(Instant::now(), lifetime, grace), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_finalized_after_grace() {
        let mut registry = PeerRegistry::new(10);
        let lifetime = Duration::from_secs(10);
        let grace = Duration::from_secs(2);

        registry.insert(
            PeerKey::from(addr("10.0.0.1:1")),
            Session { addr: addr("10.0.0.1:1"), state: finalized(1, Instant::now()) },
        );

        time::advance(Duration::from_millis(1900)).await;
        assert_eq!(registry.sweep(Instant::now(), lifetime, grace), 0);

        time::advance(Duration::from_millis(200)).await;
        assert_eq!(registry.sweep(Instant::now(), lifetime, grace), 1);
        assert!(registry.is_empty());
    }
}
