//! Process-wide map from connection key to pool.
//!
//! The registry lock only guards the map. Pools that lose an install race or
//! get replaced are cleared after the lock is released.

use crate::db::pool::ThreadLocalPool;
use crate::models::ConnectionKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct RegistryCache {
    pools: Mutex<HashMap<ConnectionKey, Arc<ThreadLocalPool>>>,
}

impl RegistryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, key: &ConnectionKey) -> Option<Arc<ThreadLocalPool>> {
        self.pools.lock().get(key).cloned()
    }

    /// Install `pool` unless `key` already has one. Returns the installed pool.
    pub fn install_if_absent(
        &self,
        key: ConnectionKey,
        pool: Arc<ThreadLocalPool>,
    ) -> Arc<ThreadLocalPool> {
        let (winner, loser) = {
            let mut pools = self.pools.lock();
            match pools.entry(key) {
                Entry::Occupied(entry) => (Arc::clone(entry.get()), Some(pool)),
                Entry::Vacant(entry) => {
                    info!(key = %entry.key(), database = ?pool.name(), "Installed connection pool");
                    entry.insert(Arc::clone(&pool));
                    (pool, None)
                }
            }
        };

        if let Some(loser) = loser {
            debug!(database = ?loser.name(), "Discarding pool that lost the install race");
            loser.clear();
        }
        winner
    }

    /// Install `pool` in place of a pool built from another connection string.
    ///
    /// When a concurrent caller already installed a pool for the same
    /// connection string, that pool is kept and returned instead.
    pub fn replace(&self, key: ConnectionKey, pool: Arc<ThreadLocalPool>) -> Arc<ThreadLocalPool> {
        let (winner, discarded) = {
            let mut pools = self.pools.lock();
            match pools.entry(key) {
                Entry::Occupied(entry)
                    if entry.get().connection_string() == pool.connection_string() =>
                {
                    (Arc::clone(entry.get()), Some(pool))
                }
                Entry::Occupied(mut entry) => {
                    info!(key = %entry.key(), database = ?pool.name(), "Replaced connection pool");
                    let old = entry.insert(Arc::clone(&pool));
                    (pool, Some(old))
                }
                Entry::Vacant(entry) => {
                    info!(key = %entry.key(), database = ?pool.name(), "Installed connection pool");
                    entry.insert(Arc::clone(&pool));
                    (pool, None)
                }
            }
        };

        if let Some(discarded) = discarded {
            discarded.clear();
        }
        winner
    }

    pub fn remove(&self, key: &ConnectionKey) -> Option<Arc<ThreadLocalPool>> {
        let removed = self.pools.lock().remove(key);
        if let Some(pool) = &removed {
            info!(key = %key, "Removed connection pool");
            pool.clear();
        }
        removed
    }

    pub fn keys(&self) -> Vec<ConnectionKey> {
        let mut keys: Vec<_> = self.pools.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }

    /// Drop every pool, e.g. on shutdown.
    pub fn close_all(&self) {
        let pools: Vec<_> = self.pools.lock().drain().collect();
        info!(count = pools.len(), "Closing all connection pools");
        for (_, pool) in pools {
            pool.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::{PoolSettings, ThreadKey};
    use crate::db::scripted::ScriptedDriver;
    use crate::db::transaction::TransactionManager;
    use std::thread;

    fn pool(driver: &ScriptedDriver, dsn: &str) -> Arc<ThreadLocalPool> {
        Arc::new(
            ThreadLocalPool::open(
                Arc::new(driver.clone()),
                dsn,
                PoolSettings::default(),
                Arc::new(TransactionManager::new()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_resolve_missing() {
        let registry = RegistryCache::new();
        assert!(registry.resolve(&ConnectionKey::from("/app/db")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_install_if_absent_first_wins() {
        let driver = ScriptedDriver::new();
        let registry = RegistryCache::new();
        let key = ConnectionKey::from("/app/db");

        let first = pool(&driver, "shop");
        let second = pool(&driver, "shop");
        second.get(ThreadKey::from_raw(1)).unwrap();

        let a = registry.install_if_absent(key.clone(), Arc::clone(&first));
        let b = registry.install_if_absent(key.clone(), Arc::clone(&second));
        assert!(Arc::ptr_eq(&a, &first));
        assert!(Arc::ptr_eq(&b, &first));
        assert!(second.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_install_keeps_one_pool() {
        let driver = ScriptedDriver::new();
        let registry = Arc::new(RegistryCache::new());
        let key = ConnectionKey::from("/app/db");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let key = key.clone();
                let candidate = pool(&driver, "shop");
                thread::spawn(move || registry.install_if_absent(key, candidate))
            })
            .collect();
        let winners: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let installed = registry.resolve(&key).unwrap();
        assert!(winners.iter().all(|w| Arc::ptr_eq(w, &installed)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_replace_stale_pool_clears_it() {
        let driver = ScriptedDriver::new();
        let registry = RegistryCache::new();
        let key = ConnectionKey::from("/app/db");

        let old = pool(&driver, "shop");
        old.get(ThreadKey::from_raw(1)).unwrap();
        registry.install_if_absent(key.clone(), Arc::clone(&old));

        let new = pool(&driver, "shop_v2");
        let installed = registry.replace(key.clone(), Arc::clone(&new));
        assert!(Arc::ptr_eq(&installed, &new));
        assert!(old.is_empty());
        assert_eq!(registry.resolve(&key).unwrap().name(), Some("shop_v2"));
    }

    #[test]
    fn test_replace_keeps_concurrent_pool_for_same_string() {
        let driver = ScriptedDriver::new();
        let registry = RegistryCache::new();
        let key = ConnectionKey::from("/app/db");

        let existing = pool(&driver, "shop_v2");
        registry.install_if_absent(key.clone(), Arc::clone(&existing));

        let late = pool(&driver, "shop_v2");
        let installed = registry.replace(key, late);
        assert!(Arc::ptr_eq(&installed, &existing));
    }

    #[test]
    fn test_remove_and_close_all() {
        let driver = ScriptedDriver::new();
        let registry = RegistryCache::new();
        registry.install_if_absent(ConnectionKey::from("/b"), pool(&driver, "b"));
        registry.install_if_absent(ConnectionKey::from("/a"), pool(&driver, "a"));
        assert_eq!(
            registry.keys(),
            vec![ConnectionKey::from("/a"), ConnectionKey::from("/b")]
        );

        assert!(registry.remove(&ConnectionKey::from("/a")).is_some());
        assert!(registry.remove(&ConnectionKey::from("/a")).is_none());

        registry.close_all();
        assert!(registry.is_empty());
    }
}
