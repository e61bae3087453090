use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tierkeep_core::Item;
use tracing::trace;

#[derive(Debug, Default)]
struct Bucket {
    items: HashMap<String, Item>,
    /// Set once the bucket mirrors a full enumeration of the service.
    complete: bool,
}

#[derive(Debug, Default)]
struct State {
    services: HashMap<String, Bucket>,
    /// Bumped by every write-side mutation.
    generation: u64,
}

/// In-process read cache, one bucket per service, behind a single lock.
///
/// Never authoritative: it only mirrors what this process wrote or read, and no
/// critical section performs I/O. Values read from the backend are installed with
/// [`Self::populate`], which is skipped if a write landed while the read was in flight.
#[derive(Debug, Default)]
pub struct ReadThroughCache {
    state: Mutex<State>,
}

impl ReadThroughCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, service: &str, key: &str) -> Option<Item> {
        let hit = self
            .lock()
            .services
            .get(service)
            .and_then(|bucket| bucket.items.get(key))
            .cloned();
        trace!(service, key, hit = hit.is_some(), "cache lookup");
        hit
    }

    /// The whole bucket, but only if it was established by [`Self::replace`].
    pub fn snapshot(&self, service: &str) -> Option<HashMap<String, Item>> {
        self.lock()
            .services
            .get(service)
            .filter(|bucket| bucket.complete)
            .map(|bucket| bucket.items.clone())
    }

    /// Upserts a single item, creating a partial bucket if needed.
    pub fn set(&self, service: &str, item: Item) {
        trace!(service, key = %item.key, "cache set");
        let mut state = self.lock();
        state.generation += 1;
        state
            .services
            .entry(service.to_string())
            .or_default()
            .items
            .insert(item.key.clone(), item);
    }

    /// Swaps in a fresh full view of `service`, dropping anything not in `items`.
    pub fn replace(&self, service: &str, items: HashMap<String, Item>) {
        trace!(service, count = items.len(), "cache replace");
        let mut state = self.lock();
        state.generation += 1;
        state.services.insert(
            service.to_string(),
            Bucket {
                items,
                complete: true,
            },
        );
    }

    pub fn delete(&self, service: &str, key: &str) {
        trace!(service, key, "cache delete");
        let mut state = self.lock();
        state.generation += 1;
        if let Some(bucket) = state.services.get_mut(service) {
            bucket.items.remove(key);
        }
    }

    /// Drops the whole bucket so the next read of `service` goes to the backend.
    pub fn forget_service(&self, service: &str) {
        trace!(service, "cache forget service");
        let mut state = self.lock();
        state.generation += 1;
        state.services.remove(service);
    }

    /// Token to hand back to [`Self::populate`] / [`Self::populate_all`] after a backend read.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Installs the result of a single backend read (`None` evicts), unless the cache
    /// was written since `seen` was taken. Returns whether anything was applied.
    pub fn populate(&self, service: &str, key: &str, found: Option<Item>, seen: u64) -> bool {
        let mut state = self.lock();
        if state.generation != seen {
            trace!(service, key, "cache changed during read, not populating");
            return false;
        }
        match found {
            Some(item) => {
                state
                    .services
                    .entry(service.to_string())
                    .or_default()
                    .items
                    .insert(key.to_string(), item);
            }
            None => {
                if let Some(bucket) = state.services.get_mut(service) {
                    bucket.items.remove(key);
                }
            }
        }
        true
    }

    /// Like [`Self::replace`], guarded the same way as [`Self::populate`].
    pub fn populate_all(&self, service: &str, items: HashMap<String, Item>, seen: u64) -> bool {
        let mut state = self.lock();
        if state.generation != seen {
            trace!(service, "cache changed during enumeration, not populating");
            return false;
        }
        state.services.insert(
            service.to_string(),
            Bucket {
                items,
                complete: true,
            },
        );
        true
    }

    // Entries are plain copies of committed values, so a poisoned lock holds nothing torn.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
