use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Client,
    /// Out-of-band creation worker.
    Worker,
}

/// Identity of the caller, passed explicitly through the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionContext {
    pub id: SessionId,
    pub kind: SessionKind,
}

impl SessionContext {
    pub fn is_worker(&self) -> bool {
        matches!(self.kind, SessionKind::Worker)
    }
}

/// Hands out session ids for one engine instance.
#[derive(Debug)]
pub struct SessionRegistry {
    next: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl SessionRegistry {
    pub fn open(&self, kind: SessionKind) -> SessionContext {
        SessionContext {
            id: SessionId(self.next.fetch_add(1, Ordering::Relaxed)),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionKind, SessionRegistry};

    #[test]
    fn sessions_are_unique_per_registry() {
        let registry = SessionRegistry::default();
        let a = registry.open(SessionKind::Client);
        let b = registry.open(SessionKind::Worker);
        assert_ne!(a.id, b.id);
        assert!(b.is_worker());
        assert!(!a.is_worker());
    }
}
