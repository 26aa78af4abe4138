//! Process-wide session registry, per-tenant pairing locks and
//! dispatch-in-progress flags.
//!
//! Everything sits behind one mutex whose critical sections never await, so
//! operations for different tenants only contend for a few instructions.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::debug;

use crate::{session::SessionEntry, types::{SessionState, SessionStatus}};

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, Arc<SessionEntry>>,
    pairing_locks: HashSet<String>,
    dispatching: HashSet<String>,
    outcomes: HashMap<String, SessionStatus>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Marks `tenant_id` as pairing. Fails fast when it already is.
    pub fn acquire(&self, tenant_id: &str) -> bool {
        self.lock().pairing_locks.insert(tenant_id.to_string())
    }

    pub fn release(&self, tenant_id: &str) {
        self.lock().pairing_locks.remove(tenant_id);
    }

    pub fn is_locked(&self, tenant_id: &str) -> bool {
        self.lock().pairing_locks.contains(tenant_id)
    }

    /// Scoped form of [`acquire`](Self::acquire): the lock is released when the
    /// guard drops unless ownership is handed to a session task.
    pub fn try_lock_pairing(self: &Arc<Self>, tenant_id: &str) -> Option<PairingLockGuard> {
        if !self.acquire(tenant_id) {
            return None;
        }
        Some(PairingLockGuard {
            registry: self.clone(),
            tenant_id: tenant_id.to_string(),
            armed: true,
        })
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<SessionEntry>> {
        self.lock().sessions.get(tenant_id).cloned()
    }

    pub fn contains(&self, tenant_id: &str) -> bool {
        self.lock().sessions.contains_key(tenant_id)
    }

    /// Registers `entry`, displacing and tearing down any previous session.
    pub fn put(&self, tenant_id: &str, entry: Arc<SessionEntry>) -> Option<Arc<SessionEntry>> {
        let displaced = {
            let mut inner = self.lock();
            inner.outcomes.remove(tenant_id);
            inner.sessions.insert(tenant_id.to_string(), entry.clone())
        };
        let displaced = displaced.filter(|old| old.session_id() != entry.session_id());
        if let Some(old) = &displaced {
            debug!(tenant_id, session_id = old.session_id(), "displaced registry entry");
            old.request_teardown();
        }
        displaced
    }

    /// Removes the tenant's session and asks it to tear down. Never waits for
    /// the teardown itself.
    pub fn remove(&self, tenant_id: &str) -> Option<Arc<SessionEntry>> {
        let removed = self.lock().sessions.remove(tenant_id);
        if let Some(entry) = &removed {
            entry.request_teardown();
        }
        removed
    }

    /// Removes the entry only if it still belongs to `session_id`. Used by a
    /// session task to deregister itself without touching a successor.
    pub fn remove_session(&self, tenant_id: &str, session_id: u64) -> bool {
        let mut inner = self.lock();
        match inner.sessions.get(tenant_id) {
            Some(entry) if entry.session_id() == session_id => {
                inner.sessions.remove(tenant_id);
                true
            }
            _ => false,
        }
    }

    /// Deregisters a finished session and remembers how it ended.
    pub fn finish_session(&self, tenant_id: &str, session_id: u64, outcome: SessionStatus) -> bool {
        let mut inner = self.lock();
        match inner.sessions.get(tenant_id) {
            Some(entry) if entry.session_id() == session_id => {
                inner.sessions.remove(tenant_id);
                inner.outcomes.insert(tenant_id.to_string(), outcome);
                true
            }
            Some(_) => false,
            None => {
                inner.outcomes.insert(tenant_id.to_string(), outcome);
                false
            }
        }
    }

    pub fn last_outcome(&self, tenant_id: &str) -> Option<SessionStatus> {
        self.lock().outcomes.get(tenant_id).cloned()
    }

    pub fn clear_outcome(&self, tenant_id: &str) {
        self.lock().outcomes.remove(tenant_id);
    }

    pub fn ready_tenants(&self) -> Vec<String> {
        let mut tenants = self
            .lock()
            .sessions
            .iter()
            .filter(|(_, entry)| entry.state() == SessionState::Ready)
            .map(|(tenant_id, _)| tenant_id.clone())
            .collect::<Vec<_>>();
        tenants.sort();
        tenants
    }

    pub fn sessions(&self) -> Vec<Arc<SessionEntry>> {
        self.lock().sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims the dispatch slot for `tenant_id`; `None` while a pass runs.
    pub fn try_begin_dispatch(self: &Arc<Self>, tenant_id: &str) -> Option<DispatchGuard> {
        if !self.lock().dispatching.insert(tenant_id.to_string()) {
            return None;
        }
        Some(DispatchGuard {
            registry: self.clone(),
            tenant_id: tenant_id.to_string(),
        })
    }

    pub fn is_dispatching(&self, tenant_id: &str) -> bool {
        self.lock().dispatching.contains(tenant_id)
    }
}

pub struct PairingLockGuard {
    registry: Arc<SessionRegistry>,
    tenant_id: String,
    armed: bool,
}

impl PairingLockGuard {
    /// Hands the lock to whoever releases it next (the session task).
    pub fn handoff(mut self) {
        self.armed = false;
    }
}

impl Drop for PairingLockGuard {
    fn drop(&mut self) {
        if self.armed {
            self.registry.release(&self.tenant_id);
        }
    }
}

pub struct DispatchGuard {
    registry: Arc<SessionRegistry>,
    tenant_id: String,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.registry.lock().dispatching.remove(&self.tenant_id);
    }
}
