//! Keyed mutual exclusion.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per key, created on demand.
///
/// Entries nobody holds are pruned whenever a new key is locked.
pub struct KeyedLocks<K> {
    table: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let entry = {
            let mut table = self.table.lock().await;
            if !table.contains_key(&key) {
                table.retain(|_, m| Arc::strong_count(m) > 1);
            }
            table.entry(key).or_default().clone()
        };
        entry.lock_owned().await
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("p/1/dev".to_string()).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("p/1/dev".to_string()).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        let _other = locks.lock("p/2/dev".to_string()).await;
        drop(guard);
        contender.await.unwrap();
    }
}
