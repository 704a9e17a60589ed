//! Concurrent battle lifecycle management.
//!
//! The engines themselves are single-threaded by contract; this module
//! provides the documented external serialization: each battle lives behind
//! its own [`parking_lot::Mutex`], and the registry maps battle ids to those
//! handles behind a [`parking_lot::RwLock`]. Transport sessions clone the
//! handle once at join time and lock per message, so traffic for different
//! battles never contends.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::SyncError;

/// A shared, lockable reference to one battle's engine.
pub type BattleHandle<E> = Arc<Mutex<E>>;

/// A concurrent map of live battles.
#[derive(Debug, Default)]
pub struct BattleRegistry<E> {
    battles: RwLock<HashMap<u64, BattleHandle<E>>>,
}

impl<E> BattleRegistry<E> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            battles: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `engine` under `battle_id` and returns its handle.
    ///
    /// Fails without replacing anything if the id is already live; destroy
    /// first to reuse an id.
    pub fn create(&self, battle_id: u64, engine: E) -> Result<BattleHandle<E>, SyncError> {
        let mut battles = self.battles.write();
        if battles.contains_key(&battle_id) {
            return Err(SyncError::InvalidRequest {
                info: format!("battle {battle_id} already exists"),
            });
        }
        let handle = Arc::new(Mutex::new(engine));
        battles.insert(battle_id, Arc::clone(&handle));
        debug!(battle_id, "battle created");
        Ok(handle)
    }

    /// Returns the handle for `battle_id`, if live.
    #[must_use]
    pub fn get(&self, battle_id: u64) -> Option<BattleHandle<E>> {
        self.battles.read().get(&battle_id).map(Arc::clone)
    }

    /// Removes `battle_id` from the registry, returning the handle so late
    /// in-flight messages on sessions that still hold it drain harmlessly.
    pub fn destroy(&self, battle_id: u64) -> Option<BattleHandle<E>> {
        let removed = self.battles.write().remove(&battle_id);
        if removed.is_some() {
            debug!(battle_id, "battle destroyed");
        }
        removed
    }

    /// Removes every battle.
    pub fn clear(&self) {
        self.battles.write().clear();
    }

    /// The number of live battles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.battles.read().len()
    }

    /// Returns `true` if no battles are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.battles.read().is_empty()
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn create_get_destroy_lifecycle() {
        let registry: BattleRegistry<u32> = BattleRegistry::new();
        assert!(registry.is_empty());
        let handle = registry.create(7, 100).unwrap();
        assert_eq!(*handle.lock(), 100);
        assert_eq!(registry.len(), 1);

        let again = registry.get(7).unwrap();
        *again.lock() += 1;
        assert_eq!(*handle.lock(), 101);

        assert!(registry.get(8).is_none());
        let removed = registry.destroy(7).unwrap();
        assert!(registry.get(7).is_none());
        // A drained handle still works for stragglers.
        assert_eq!(*removed.lock(), 101);
        assert!(registry.destroy(7).is_none());
    }

    #[test]
    fn duplicate_id_is_rejected_without_replacement() {
        let registry: BattleRegistry<u32> = BattleRegistry::new();
        registry.create(1, 10).unwrap();
        let err = registry.create(1, 20).unwrap_err();
        assert!(matches!(err, SyncError::InvalidRequest { .. }));
        assert_eq!(*registry.get(1).unwrap().lock(), 10);
    }

    #[test]
    fn clear_empties_the_registry() {
        let registry: BattleRegistry<u32> = BattleRegistry::new();
        for id in 0..4 {
            registry.create(id, 0).unwrap();
        }
        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn per_battle_locking_serializes_concurrent_mutation() {
        let registry: Arc<BattleRegistry<u64>> = Arc::new(BattleRegistry::new());
        registry.create(1, 0).unwrap();
        let mut workers = Vec::new();
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            workers.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let handle = registry.get(1).unwrap();
                    *handle.lock() += 1;
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*registry.get(1).unwrap().lock(), 4000);
    }
}
