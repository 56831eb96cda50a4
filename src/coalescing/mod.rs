// Coalescing module
//
// Keyed single-flight locks. At most one holder per key; other tasks
// acquiring the same key wait on the holder's semaphore instead of
// polling. The convert coordinator locks raw source paths around encode
// fan-outs and the downloader locks destination paths while streaming,
// so readers never observe half-written files.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Map of in-flight keys to their single-permit semaphores.
#[derive(Debug, Clone, Default)]
pub struct KeyedLock {
    in_flight: Arc<tokio::sync::Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting while another holder is
    /// active. The returned guard releases the key on drop.
    pub async fn acquire(&self, key: &str) -> KeyedLockGuard {
        let semaphore = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(key) {
                Some(sem) => Arc::clone(sem),
                None => {
                    let sem = Arc::new(Semaphore::new(1));
                    in_flight.insert(key.to_string(), Arc::clone(&sem));
                    sem
                }
            }
        };

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("keyed lock semaphore closed");

        KeyedLockGuard {
            key: key.to_string(),
            lock: self.clone(),
            _permit: permit,
        }
    }

    /// Whether `key` currently has a holder or waiters.
    pub async fn is_held(&self, key: &str) -> bool {
        let in_flight = self.in_flight.lock().await;
        match in_flight.get(key) {
            Some(sem) => sem.available_permits() == 0,
            None => false,
        }
    }

    /// Number of keys currently tracked.
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

/// Guard that releases a key when dropped.
pub struct KeyedLockGuard {
    key: String,
    lock: KeyedLock,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl Drop for KeyedLockGuard {
    fn drop(&mut self) {
        // The permit itself is released synchronously; removing the map
        // entry needs the async mutex, so defer it to a task. The entry
        // is only removed once no other task still holds a reference.
        let lock = self.lock.clone();
        let key = std::mem::take(&mut self.key);
        tokio::spawn(async move {
            let mut in_flight = lock.in_flight.lock().await;
            if let Some(semaphore) = in_flight.get(&key) {
                if Arc::strong_count(semaphore) <= 2 {
                    in_flight.remove(&key);
                }
            }
        });
    }
}
