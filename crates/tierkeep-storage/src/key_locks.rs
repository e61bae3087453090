use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

type Identity = (String, String);

/// Per-`(service, key)` mutual exclusion for writers in this process.
///
/// Entries are created on demand and pruned once no caller holds or waits on them.
/// Other processes are not covered; they only see backend-level atomicity.
#[derive(Debug, Default)]
pub struct KeyLocks {
    table: Mutex<HashMap<Identity, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the lock for `(service, key)`.
    pub fn with_lock<T>(&self, service: &str, key: &str, f: impl FnOnce() -> T) -> T {
        let id = (service.to_string(), key.to_string());
        let slot = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(table.entry(id.clone()).or_default())
        };

        let result = {
            let _held = slot.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the table and this caller still reference the slot.
        if Arc::strong_count(&slot) == 2 {
            table.remove(&id);
        }
        result
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn same_identity_is_serialized() {
        let locks = Arc::new(KeyLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    locks.with_lock("svc", "k", || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(10));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn different_identities_do_not_block_each_other() {
        let locks = KeyLocks::new();
        let value = locks.with_lock("svc", "a", || locks.with_lock("svc", "b", || 7));
        assert_eq!(value, 7);
        assert_eq!(locks.len(), 0);
    }
}
