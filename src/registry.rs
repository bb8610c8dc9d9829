use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mio::Token;
use slab::Slab;

/// Tokens below this are reserved for the listener and the shutdown waker.
pub const FIRST_CONN: usize = 2;

/// Arena of live connections keyed by their poll token.
///
/// Entries are shared as `Arc<T>`: a task that already dequeued a connection keeps its buffers
/// alive after `remove`, but the slot (and so the token) is only handed out again once removed.
pub struct ConnectionRegistry<T> {
    slots: Mutex<Slab<Arc<T>>>,
}

impl<T> ConnectionRegistry<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slab::with_capacity(capacity)),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slab<Arc<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a slot and builds the entry from the token assigned to it.
    pub fn create<F>(&self, build: F) -> Arc<T>
    where
        F: FnOnce(Token) -> T,
    {
        let mut slots = self.slots();
        let entry = slots.vacant_entry();
        let token = Token(entry.key() + FIRST_CONN);
        let value = Arc::new(build(token));
        entry.insert(Arc::clone(&value));
        value
    }

    pub fn get(&self, token: Token) -> Option<Arc<T>> {
        let key = token.0.checked_sub(FIRST_CONN)?;
        self.slots().get(key).cloned()
    }

    pub fn remove(&self, token: Token) -> Option<Arc<T>> {
        let key = token.0.checked_sub(FIRST_CONN)?;
        self.slots().try_remove(key)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the registry, returning every entry that was still live.
    pub fn drain(&self) -> Vec<Arc<T>> {
        self.slots().drain().collect()
    }
}

impl<T> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_get_remove() {
        let registry = ConnectionRegistry::new();
        let first = registry.create(|token| (token, "first"));
        let second = registry.create(|token| (token, "second"));

        assert_eq!(first.0, Token(FIRST_CONN));
        assert_eq!(second.0, Token(FIRST_CONN + 1));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(first.0).unwrap().1, "first");

        let removed = registry.remove(first.0).unwrap();
        assert_eq!(removed.1, "first");
        assert!(registry.get(first.0).is_none());
        assert!(registry.remove(first.0).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reserved_tokens_never_resolve() {
        let registry = ConnectionRegistry::new();
        registry.create(|token| token);
        assert!(registry.get(Token(0)).is_none());
        assert!(registry.get(Token(1)).is_none());
        assert!(registry.remove(Token(1)).is_none());
    }

    #[test]
    fn removed_entry_outlives_its_slot() {
        let registry = ConnectionRegistry::new();
        let entry = registry.create(|_| vec![1u8, 2, 3]);
        let token = Token(FIRST_CONN);
        let in_flight = registry.get(token).unwrap();
        registry.remove(token);
        assert_eq!(*in_flight, vec![1, 2, 3]);
        assert_eq!(Arc::strong_count(&entry), 2);
    }

    #[test]
    fn slot_is_reused_only_after_removal() {
        let registry = ConnectionRegistry::new();
        let a = registry.create(|token| token);
        let b = registry.create(|token| token);
        assert_ne!(*a, *b);
        registry.remove(*a);
        let c = registry.create(|token| token);
        assert_eq!(*c, *a);
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }
}
