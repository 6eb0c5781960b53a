//! Query cancellation
//!
//! Sessions that announce BackendKeyData register here. A CancelRequest on a
//! fresh connection looks the key up and flags the session; running result
//! streams poll the flag between rows.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Per-session cancellation flag
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
    active: AtomicUsize,
}

impl CancelFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request cancellation; ignored when nothing is running
    pub fn cancel(&self) -> bool {
        if self.active.load(Ordering::SeqCst) == 0 {
            return false;
        }
        self.cancelled.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Mark an execution as running until the guard drops
    pub fn begin(self: &Arc<Self>) -> ActiveExecution {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveExecution { flag: self.clone() }
    }
}

pub struct ActiveExecution {
    flag: Arc<CancelFlag>,
}

impl ActiveExecution {
    pub fn is_cancelled(&self) -> bool {
        self.flag.is_cancelled()
    }
}

impl Drop for ActiveExecution {
    fn drop(&mut self) {
        if self.flag.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Last running execution; a pending cancel must not leak into the next query
            self.flag.cancelled.store(false, Ordering::SeqCst);
        }
    }
}

/// Process id and secret announced in BackendKeyData
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKey {
    pub process_id: i32,
    pub secret_key: i32,
}

/// Process-wide map of cancellable sessions
#[derive(Debug)]
pub struct CancelRegistry {
    sessions: DashMap<i32, (i32, Arc<CancelFlag>)>,
    next_pid: AtomicI32,
}

impl Default for CancelRegistry {
    fn default() -> Self {
        Self {
            sessions: DashMap::new(),
            next_pid: AtomicI32::new(1),
        }
    }
}

impl CancelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `flag` under a fresh key; the entry lives as long as the guard
    pub fn register(self: &Arc<Self>, flag: Arc<CancelFlag>) -> CancelRegistration {
        let process_id = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let secret_key = uuid::Uuid::new_v4().as_u128() as i32;
        self.sessions.insert(process_id, (secret_key, flag));
        debug!(process_id, "Registered session for cancellation");
        CancelRegistration {
            registry: self.clone(),
            key: BackendKey {
                process_id,
                secret_key,
            },
        }
    }

    /// Flag the session matching both pid and secret
    pub fn cancel(&self, process_id: i32, secret_key: i32) -> bool {
        let Some(entry) = self.sessions.get(&process_id) else {
            debug!(process_id, "CancelRequest for unknown session");
            return false;
        };
        let (secret, flag) = entry.value();
        if *secret != secret_key {
            debug!(process_id, "CancelRequest with wrong secret");
            return false;
        }
        let cancelled = flag.cancel();
        info!(process_id, cancelled, "CancelRequest received");
        cancelled
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Removes the session from the registry on drop
pub struct CancelRegistration {
    registry: Arc<CancelRegistry>,
    key: BackendKey,
}

impl CancelRegistration {
    pub fn key(&self) -> BackendKey {
        self.key
    }
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        self.registry.sessions.remove(&self.key.process_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_cancel_is_ignored() {
        let flag = CancelFlag::new();
        assert!(!flag.cancel());
        assert!(!flag.is_cancelled());
    }

    #[test]
    fn test_cancel_running_execution() {
        let flag = CancelFlag::new();
        let running = flag.begin();
        assert!(flag.cancel());
        assert!(running.is_cancelled());
        drop(running);
        assert!(!flag.is_cancelled());
    }

    #[test]
    fn test_registry_matches_pid_and_secret() {
        let registry = CancelRegistry::new();
        let flag = CancelFlag::new();
        let registration = registry.register(flag.clone());
        let key = registration.key();
        let _running = flag.begin();

        assert!(!registry.cancel(key.process_id, key.secret_key.wrapping_add(1)));
        assert!(!registry.cancel(key.process_id + 100, key.secret_key));
        assert!(registry.cancel(key.process_id, key.secret_key));
        assert!(flag.is_cancelled());

        drop(registration);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_pids_are_unique() {
        let registry = CancelRegistry::new();
        let a = registry.register(CancelFlag::new());
        let b = registry.register(CancelFlag::new());
        assert_ne!(a.key().process_id, b.key().process_id);
        assert_eq!(registry.len(), 2);
    }
}
