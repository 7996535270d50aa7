//! Directory of online users.
//!
//! The registry is the only shared presence state in the server. Every
//! operation takes a single short-lived lock, so lookups never observe a
//! half-registered entry. Evicted sessions are disconnected after the lock
//! is released, since disconnecting re-enters the registry.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::{debug, info};

use crate::{
    message::UserId,
    session::{Session, SessionId},
};

#[derive(Clone, Default)]
pub struct Registry {
    sessions: Arc<Mutex<HashMap<UserId, Arc<Session>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `session` for `user_id`. A prior session for the same user is
    /// removed, disconnected, and returned.
    pub fn register(&self, user_id: UserId, session: Arc<Session>) -> Option<Arc<Session>> {
        let evicted = {
            let mut sessions = self.lock();
            let previous = sessions.insert(user_id, Arc::clone(&session));
            info!(user_id, online = sessions.len(), "user registered");
            previous
        };

        match evicted {
            Some(previous) if previous.id() != session.id() => {
                info!(user_id, session = %previous.id(), "evicting superseded session");
                previous.disconnect();
                Some(previous)
            }
            _ => None,
        }
    }

    /// Removes whatever session is registered for `user_id`. No-op if absent.
    pub fn unregister(&self, user_id: UserId) -> Option<Arc<Session>> {
        let removed = self.lock().remove(&user_id);
        if removed.is_some() {
            info!(user_id, "user unregistered");
        }
        removed
    }

    /// Removes the entry only if it still belongs to `session_id`, so a
    /// session tearing down cannot remove the session that replaced it.
    pub(crate) fn release(&self, user_id: UserId, session_id: SessionId) -> bool {
        let mut sessions = self.lock();
        match sessions.get(&user_id) {
            Some(current) if current.id() == session_id => {
                sessions.remove(&user_id);
                debug!(user_id, session = %session_id, online = sessions.len(), "session released");
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, user_id: UserId) -> Option<Arc<Session>> {
        self.lock().get(&user_id).cloned()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.lock().contains_key(&user_id)
    }

    /// Snapshot of the registered ids. May be stale by the time it is read.
    pub fn online_user_ids(&self) -> BTreeSet<UserId> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Empties the registry and returns everything that was in it.
    pub(crate) fn drain(&self) -> Vec<Arc<Session>> {
        self.lock().drain().map(|(_, session)| session).collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scoped ownership of a registry entry. Dropping it releases the entry if
/// it still belongs to the owning session.
pub(crate) struct Registration {
    registry: Registry,
    user_id: UserId,
    session_id: SessionId,
}

impl Registration {
    pub(crate) fn new(registry: Registry, user_id: UserId, session_id: SessionId) -> Self {
        Self {
            registry,
            user_id,
            session_id,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(self.user_id, self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;
    use crate::session::SessionState;

    fn authenticated(id: u64, user_id: UserId) -> Arc<Session> {
        let session = Session::detached(SessionId(id));
        session.mark_authenticated(user_id);
        session
    }

    #[test]
    fn second_registration_evicts_and_closes_first() {
        let registry = Registry::new();
        let first = authenticated(1, 7);
        let second = authenticated(2, 7);

        assert!(registry.register(7, Arc::clone(&first)).is_none());
        let evicted = registry
            .register(7, Arc::clone(&second))
            .expect("first session evicted");

        assert_eq!(evicted.id(), first.id());
        assert!(first.is_closed());
        assert_eq!(second.state(), SessionState::Authenticated);
        let current = registry.lookup(7).expect("second session registered");
        assert_eq!(current.id(), second.id());
    }

    #[test]
    fn unknown_users_are_absent() {
        let registry = Registry::new();
        assert!(registry.lookup(42).is_none());
        assert!(!registry.is_online(42));
        assert!(registry.online_user_ids().is_empty());
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = Registry::new();
        registry.register(1, authenticated(1, 1));

        assert!(registry.unregister(1).is_some());
        assert!(registry.unregister(1).is_none());
        assert!(registry.unregister(99).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn release_ignores_entries_owned_by_a_newer_session() {
        let registry = Registry::new();
        let old = authenticated(1, 5);
        let new = authenticated(2, 5);
        registry.register(5, old);
        registry.register(5, Arc::clone(&new));

        assert!(!registry.release(5, SessionId(1)));
        assert!(registry.is_online(5));
        assert!(registry.release(5, SessionId(2)));
        assert!(!registry.is_online(5));
    }

    #[test]
    fn dropping_registration_releases_entry() {
        let registry = Registry::new();
        registry.register(3, authenticated(9, 3));
        let registration = Registration::new(registry.clone(), 3, SessionId(9));

        drop(registration);
        assert!(registry.lookup(3).is_none());
    }

    #[test]
    fn concurrent_registrations_are_not_lost() {
        const USERS: usize = 32;
        let registry = Registry::new();
        let barrier = Arc::new(Barrier::new(USERS));

        let handles: Vec<_> = (0..USERS)
            .map(|index| {
                let registry = registry.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let user_id = index as UserId + 1;
                    barrier.wait();
                    registry.register(user_id, authenticated(index as u64, user_id));
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("registering thread");
        }

        let expected: BTreeSet<UserId> = (1..=USERS as UserId).collect();
        assert_eq!(registry.online_user_ids(), expected);
    }
}
