//! Open loops, keyed by their endpoints.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use looplink_core::LoopMeta;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("loop already registered: {0}")]
    Duplicate(LoopMeta),
}

/// Concurrent map from loop to its local handle.
///
/// Mutations are mutually exclusive; lookups share the lock. No await
/// point is ever reached while the lock is held.
#[derive(Debug)]
pub struct LoopRegistry<S> {
    loops: RwLock<HashMap<LoopMeta, S>>,
}

impl<S> Default for LoopRegistry<S> {
    fn default() -> Self {
        Self {
            loops: RwLock::new(HashMap::new()),
        }
    }
}

impl<S: Clone> LoopRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loop. An existing entry is kept and reported.
    pub fn register(&self, meta: LoopMeta, handle: S) -> Result<(), RegistryError> {
        let mut loops = self.write();
        if loops.contains_key(&meta) {
            return Err(RegistryError::Duplicate(meta));
        }
        loops.insert(meta, handle);
        Ok(())
    }

    pub fn lookup(&self, meta: &LoopMeta) -> Option<S> {
        self.read().get(meta).cloned()
    }

    /// Remove a loop, returning its handle if it was registered.
    pub fn remove(&self, meta: &LoopMeta) -> Option<S> {
        self.write().remove(meta)
    }

    /// Remove a loop only if `matches` accepts the registered handle.
    pub fn remove_if<F>(&self, meta: &LoopMeta, matches: F) -> Option<S>
    where
        F: FnOnce(&S) -> bool,
    {
        let mut loops = self.write();
        if loops.get(meta).is_some_and(matches) {
            loops.remove(meta)
        } else {
            None
        }
    }

    /// Remove every loop at once.
    pub fn drain(&self) -> Vec<(LoopMeta, S)> {
        self.write().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<LoopMeta, S>> {
        self.loops.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<LoopMeta, S>> {
        self.loops.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use looplink_core::LoopAddr;
    use looplink_crypto::StaticKeypair;

    fn meta(local_port: u16, remote_port: u16) -> LoopMeta {
        let pk = StaticKeypair::generate().public_key();
        LoopMeta::new(LoopAddr::new(pk, local_port), LoopAddr::new(pk, remote_port))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = LoopRegistry::new();
        let m = meta(1, 2);
        registry.register(m, "first").unwrap();
        assert_eq!(registry.lookup(&m), Some("first"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_keeps_original() {
        let registry = LoopRegistry::new();
        let m = meta(1, 2);
        registry.register(m, "first").unwrap();
        assert_eq!(
            registry.register(m, "second"),
            Err(RegistryError::Duplicate(m))
        );
        assert_eq!(registry.lookup(&m), Some("first"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = LoopRegistry::new();
        let m = meta(1, 2);
        registry.register(m, 7u32).unwrap();
        assert_eq!(registry.remove(&m), Some(7));
        assert_eq!(registry.remove(&m), None);
        assert!(registry.lookup(&m).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_if_checks_handle() {
        let registry = LoopRegistry::new();
        let m = meta(1, 2);
        let old = std::sync::Arc::new(1u8);
        let new = std::sync::Arc::new(1u8);
        registry.register(m, new.clone()).unwrap();

        assert!(registry.remove_if(&m, |h| std::sync::Arc::ptr_eq(h, &old)).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_if(&m, |h| std::sync::Arc::ptr_eq(h, &new)).is_some());
        assert!(registry.is_empty());
        assert!(registry.remove_if(&m, |_| true).is_none());
    }

    #[test]
    fn test_distinct_ports_are_distinct_loops() {
        let registry = LoopRegistry::new();
        let a = meta(1, 2);
        let b = LoopMeta::new(a.local, LoopAddr::new(a.remote.pk, 3));
        registry.register(a, 'a').unwrap();
        registry.register(b, 'b').unwrap();
        assert_eq!(registry.lookup(&b), Some('b'));
    }

    #[test]
    fn test_drain_empties() {
        let registry = LoopRegistry::new();
        for port in 0..5 {
            registry.register(meta(port, port), port).unwrap();
        }
        let mut drained: Vec<_> = registry.drain().into_iter().map(|(_, v)| v).collect();
        drained.sort();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_register_single_winner() {
        let registry = std::sync::Arc::new(LoopRegistry::new());
        let m = meta(9, 9);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.register(m, i).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }
}
