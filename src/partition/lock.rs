use crate::catalog::types::TableId;
use crate::error::AutopartError;
use crate::session::SessionId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::error;

#[derive(Default)]
struct LockState {
    /// Parent table -> owning session.
    held: HashMap<TableId, SessionId>,
}

/// Per-parent exclusive intent locks for partition creation.
pub struct ParentLockManager {
    state: Mutex<LockState>,
    cv: Condvar,
    /// Set once a holder panicked. Every later acquire is rejected.
    poisoned: AtomicBool,
}

impl Default for ParentLockManager {
    fn default() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            cv: Condvar::default(),
            poisoned: AtomicBool::new(false),
        }
    }
}

impl std::fmt::Debug for ParentLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParentLockManager")
            .field("poisoned", &self.poisoned.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum LockAcquireResult<'a> {
    /// Freshly taken; the caller must re-check for a concurrent creator.
    Acquired(ParentLockGuard<'a>),
    /// This session already owns the lock further up the stack.
    AlreadyHeld,
}

impl ParentLockManager {
    pub fn acquire(
        &self,
        parent: TableId,
        session: SessionId,
        timeout: Duration,
    ) -> Result<LockAcquireResult<'_>, AutopartError> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(AutopartError::LockPoisoned);
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state()?;
        loop {
            match state.held.get(&parent) {
                Some(owner) if *owner == session => return Ok(LockAcquireResult::AlreadyHeld),
                Some(_) => {}
                None => {
                    state.held.insert(parent, session);
                    return Ok(LockAcquireResult::Acquired(ParentLockGuard {
                        manager: self,
                        parent,
                        session,
                        released: false,
                    }));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AutopartError::LockTimeout {
                    table: parent.to_string(),
                });
            }
            let (next, _) = self
                .cv
                .wait_timeout(state, deadline.saturating_duration_since(now))
                .map_err(|_| self.poison("wait"))?;
            state = next;
        }
    }

    pub fn holds(&self, parent: TableId, session: SessionId) -> bool {
        self.state
            .lock()
            .map(|state| state.held.get(&parent) == Some(&session))
            .unwrap_or(false)
    }

    pub fn holder(&self, parent: TableId) -> Option<SessionId> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.held.get(&parent).copied())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, LockState>, AutopartError> {
        self.state.lock().map_err(|_| self.poison("acquire"))
    }

    fn poison(&self, during: &str) -> AutopartError {
        self.poisoned.store(true, Ordering::Release);
        error!(during, "parent lock state poisoned, rejecting further creation");
        AutopartError::LockPoisoned
    }

    fn release(&self, parent: TableId, session: SessionId) {
        match self.state.lock() {
            Ok(mut state) => {
                if state.held.get(&parent) == Some(&session) {
                    state.held.remove(&parent);
                }
                drop(state);
                self.cv.notify_all();
            }
            Err(_) => {
                self.poison("release");
            }
        }
    }
}

/// Releases the parent lock on drop.
#[derive(Debug)]
pub struct ParentLockGuard<'a> {
    manager: &'a ParentLockManager,
    parent: TableId,
    session: SessionId,
    released: bool,
}

impl ParentLockGuard<'_> {
    pub fn parent(&self) -> TableId {
        self.parent
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.manager.release(self.parent, self.session);
        }
    }
}

impl Drop for ParentLockGuard<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}
