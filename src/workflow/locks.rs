//! Named Step Locks
//!
//! Locks are keyed by name (e.g. `mount:<host>`) and held for the duration of
//! a single step. Keys are acquired in sorted order so two steps asking for
//! overlapping sets cannot deadlock.

use crate::domain::model::ResourceId;
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Lock key guarding filesystem mount bookkeeping on a host
pub fn mount_lock_key(host: &ResourceId) -> String {
    format!("mount:{}", host)
}

/// Guards for one step; dropping releases every lock
#[derive(Debug)]
pub struct StepLocks {
    keys: Vec<String>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl StepLocks {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

/// Process-wide table of named locks
#[derive(Debug, Default)]
pub struct LockManager {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire all `keys` within `limit`, or none of them
    pub async fn acquire(&self, keys: &[String], limit: Duration) -> Result<StepLocks> {
        let mut sorted: Vec<String> = keys.to_vec();
        sorted.sort();
        sorted.dedup();

        let handles: Vec<Arc<Mutex<()>>> = sorted.iter().map(|k| self.lock_for(k)).collect();
        let acquire_all = async move {
            let mut guards = Vec::with_capacity(handles.len());
            for handle in handles {
                guards.push(handle.lock_owned().await);
            }
            guards
        };

        match tokio::time::timeout(limit, acquire_all).await {
            Ok(guards) => {
                debug!("Acquired step locks {:?}", sorted);
                Ok(StepLocks {
                    keys: sorted,
                    _guards: guards,
                })
            }
            Err(_) => Err(Error::LockTimeout {
                keys: sorted.join(", "),
                timeout: limit,
            }),
        }
    }

    /// Whether a key is currently held
    pub fn is_locked(&self, key: &str) -> bool {
        let Some(lock) = self.locks.get(key).map(|entry| entry.value().clone()) else {
            return false;
        };
        let held = lock.try_lock().is_err();
        held
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_locks_released_on_drop() {
        let manager = LockManager::new();
        let key = mount_lock_key(&"h1".into());
        assert_eq!(key, "mount:h1");

        let held = manager
            .acquire(&[key.clone()], Duration::from_secs(1))
            .await
            .unwrap();
        assert!(manager.is_locked(&key));

        let contended = manager.acquire(&[key.clone()], Duration::from_millis(20)).await;
        assert_matches!(contended, Err(Error::LockTimeout { .. }));

        drop(held);
        assert!(!manager.is_locked(&key));
        assert!(manager
            .acquire(&[key], Duration::from_millis(20))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_keys_do_not_self_deadlock() {
        let manager = LockManager::new();
        let keys = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        let locks = manager.acquire(&keys, Duration::from_millis(50)).await.unwrap();
        assert_eq!(locks.keys(), ["a".to_string(), "b".to_string()]);
    }
}
