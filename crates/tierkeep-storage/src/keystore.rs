use std::collections::HashMap;

use tierkeep_core::{HardwareKeyProvider, Item, Result, SecureBackend, SecurityTier};
use tracing::{debug, instrument};

use crate::{
    cache::ReadThroughCache,
    config::KeystoreConfig,
    envelope::Envelope,
    item_writer::{ItemWriter, StoredItem},
    throttle::CancellationToken,
};

/// Entry point: a tiered store with a read-through cache in front of the backend.
///
/// Construct one per process and share it by reference or `Arc`; it owns the
/// single cache and lock the store relies on.
pub struct Keystore<B: SecureBackend, P: HardwareKeyProvider> {
    writer: ItemWriter<B, P>,
    cache: ReadThroughCache,
}

impl<B: SecureBackend, P: HardwareKeyProvider> Keystore<B, P> {
    pub fn new(backend: B, key_provider: P, config: &KeystoreConfig) -> Self {
        Self {
            writer: ItemWriter::new(
                backend,
                Envelope::new(key_provider, config.key_tag.clone()),
                config.throttle(),
            ),
            cache: ReadThroughCache::new(),
        }
    }

    /// Writes through to the backend, then mirrors the plaintext item into the cache.
    #[instrument(skip_all, fields(service = %item.service, key = %item.key, %tier))]
    pub fn store(&self, item: Item, tier: SecurityTier) -> Result<()> {
        self.writer.store_and_then(&item, tier, |result| match result {
            Ok(()) => self.cache.set(&item.service, item.clone()),
            // Backend now holds either the old primary or the new backup.
            Err(_) => self.cache.forget_service(&item.service),
        })
    }

    #[instrument(skip(self))]
    pub fn get_item(&self, key: &str, service: &str, use_cache: bool) -> Result<Option<Item>> {
        if use_cache {
            if let Some(hit) = self.cache.get(service, key) {
                return Ok(Some(hit));
            }
        }
        let seen = self.cache.generation();
        let found = self.writer.get_item(key, service)?;
        self.cache.populate(service, key, found.clone(), seen);
        Ok(found)
    }

    #[instrument(skip(self))]
    pub fn get_all_items(&self, service: &str, use_cache: bool) -> Result<HashMap<String, Item>> {
        self.get_all(service, use_cache, None)
    }

    /// Like [`Self::get_all_items`], but the throttle wait can be cut short by `cancel`.
    #[instrument(skip(self, cancel))]
    pub fn get_all_items_cancellable(
        &self,
        service: &str,
        use_cache: bool,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Item>> {
        self.get_all(service, use_cache, Some(cancel))
    }

    fn get_all(
        &self,
        service: &str,
        use_cache: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<HashMap<String, Item>> {
        if use_cache {
            if let Some(snapshot) = self.cache.snapshot(service) {
                debug!(count = snapshot.len(), "serving enumeration from cache");
                return Ok(snapshot);
            }
        }
        let seen = self.cache.generation();
        let items = self.writer.get_all_items(service, cancel)?;
        self.cache.populate_all(service, items.clone(), seen);
        Ok(items)
    }

    /// Deletes from the backend, then evicts. Absence is success.
    #[instrument(skip(self))]
    pub fn delete(&self, key: &str, service: &str) -> Result<()> {
        self.writer
            .delete_and_then(key, service, |result| match result {
                Ok(()) => self.cache.delete(service, key),
                // The record may still be there.
                Err(_) => self.cache.forget_service(service),
            })
    }

    /// Raw stored form and tier of an item, read straight from the backend.
    pub fn get_stored_item(&self, key: &str, service: &str) -> Result<Option<StoredItem>> {
        self.writer.get_stored_item(key, service)
    }

    /// Removes every record of `service` and leaves an empty cached view behind.
    #[instrument(skip(self))]
    pub fn purge_service(&self, service: &str) -> Result<usize> {
        let removed = self.writer.purge_service(service);
        match removed {
            Ok(_) => self.cache.replace(service, HashMap::new()),
            // Partial purge: let the next read go to the backend.
            Err(_) => self.cache.forget_service(service),
        }
        removed
    }
}
