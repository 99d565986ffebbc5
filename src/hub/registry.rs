//! Process-wide listener registry.
//!
//! Writes are serialized behind a lock and publish a fresh copy-on-write
//! snapshot. Readers clone the current snapshot `Arc` and iterate it without
//! holding the lock, so a write landing mid-pass only becomes visible to the
//! next pass.

use std::sync::{Arc, PoisonError, RwLock};

use crate::subscription::{ListenerId, Subscription};

use super::control::SessionId;

/// Immutable point-in-time view of the registry, in registration order.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    version: u64,
    subscriptions: Arc<[Arc<Subscription>]>,
}

impl RegistrySnapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            subscriptions: Arc::from(Vec::<Arc<Subscription>>::new()),
        }
    }

    /// Number of writes applied before this snapshot was taken.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Subscription>> {
        self.subscriptions.iter()
    }

    #[must_use]
    pub fn get(&self, listener_id: &ListenerId) -> Option<&Arc<Subscription>> {
        self.subscriptions.iter().find(|s| &s.listener_id == listener_id)
    }
}

#[derive(Debug)]
struct Entry {
    subscription: Arc<Subscription>,
    owner: Option<SessionId>,
}

#[derive(Debug)]
struct Inner {
    entries: Vec<Entry>,
    snapshot: RegistrySnapshot,
}

impl Inner {
    fn position(&self, listener_id: &ListenerId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| &e.subscription.listener_id == listener_id)
    }

    fn publish(&mut self) {
        let subscriptions: Vec<Arc<Subscription>> =
            self.entries.iter().map(|e| Arc::clone(&e.subscription)).collect();
        self.snapshot = RegistrySnapshot {
            version: self.snapshot.version + 1,
            subscriptions: Arc::from(subscriptions),
        };
    }
}

/// Listener registry keyed by [`ListenerId`].
#[derive(Debug)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: Vec::new(),
                snapshot: RegistrySnapshot::empty(),
            }),
        }
    }

    /// Inserts or replaces the subscription at its listener id.
    ///
    /// A replaced listener keeps its original position in registration order.
    /// Returns true if an existing entry was replaced.
    pub fn register(&self, subscription: Subscription) -> bool {
        self.insert(subscription, None)
    }

    /// Like [`Registry::register`], recording the owning control-plane session.
    pub fn register_owned(&self, subscription: Subscription, session: SessionId) -> bool {
        self.insert(subscription, Some(session))
    }

    fn insert(&self, subscription: Subscription, owner: Option<SessionId>) -> bool {
        let subscription = Arc::new(subscription);
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let replaced = match inner.position(&subscription.listener_id) {
            Some(idx) => {
                inner.entries[idx] = Entry { subscription, owner };
                true
            }
            None => {
                inner.entries.push(Entry { subscription, owner });
                false
            }
        };
        inner.publish();
        replaced
    }

    /// Removes the listener. Returns false if it was not registered.
    pub fn deregister(&self, listener_id: &ListenerId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(idx) = inner.position(listener_id) else {
            return false;
        };
        inner.entries.remove(idx);
        inner.publish();
        true
    }

    /// Removes the listener only while `session` still owns it.
    pub fn deregister_owned(&self, listener_id: &ListenerId, session: SessionId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(idx) = inner.position(listener_id) else {
            return false;
        };
        if inner.entries[idx].owner != Some(session) {
            return false;
        }
        inner.entries.remove(idx);
        inner.publish();
        true
    }

    /// Current point-in-time view.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot
            .clone()
    }

    #[must_use]
    pub fn get(&self, listener_id: &ListenerId) -> Option<Arc<Subscription>> {
        self.snapshot().get(listener_id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}
