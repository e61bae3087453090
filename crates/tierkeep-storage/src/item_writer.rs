use std::collections::HashMap;

use tierkeep_core::{
    backup_key, is_backup_key, primary_key, ErrorKind, HardwareKeyProvider, Item, KeystoreError,
    NewRecord, Record, RecordClass, RecordQuery, Result, SecureBackend, SecurityTier,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    envelope::{access_policy, Envelope},
    key_locks::KeyLocks,
    throttle::{CancellationToken, EnumerationThrottle},
};

/// A record as it sits in the backend, before the envelope is removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    /// Identity is reported under the primary key even when read from a backup.
    pub item: Item,
    pub tier: SecurityTier,
    pub from_backup: bool,
}

/// Crash-safe writer and reader over a [`SecureBackend`].
///
/// A replace first adds a backup record, then swaps the primary record, then drops
/// the backup. At every point a reader finds the old or the new value under the
/// primary key or its backup.
pub struct ItemWriter<B: SecureBackend, P: HardwareKeyProvider> {
    backend: B,
    envelope: Envelope<P>,
    locks: KeyLocks,
    throttle: EnumerationThrottle,
}

impl<B: SecureBackend, P: HardwareKeyProvider> ItemWriter<B, P> {
    pub fn new(backend: B, envelope: Envelope<P>, throttle: EnumerationThrottle) -> Self {
        Self {
            backend,
            envelope,
            locks: KeyLocks::new(),
            throttle,
        }
    }

    pub fn store(&self, item: &Item, tier: SecurityTier) -> Result<()> {
        self.store_and_then(item, tier, |_| ())
    }

    /// Like [`Self::store`], running `on_done` with the outcome before the key lock
    /// is released, so mirrors of the backend observe writes in commit order.
    #[instrument(skip_all, fields(service = %item.service, key = %item.key, %tier))]
    pub fn store_and_then(
        &self,
        item: &Item,
        tier: SecurityTier,
        on_done: impl FnOnce(&Result<()>),
    ) -> Result<()> {
        validate_identity(&item.service, &item.key)?;
        self.locks.with_lock(&item.service, &item.key, || {
            let result = self
                .store_locked(item, tier)
                .map_err(|e| e.with_item(&item.service, &item.key));
            on_done(&result);
            result
        })
    }

    fn store_locked(&self, item: &Item, tier: SecurityTier) -> Result<()> {
        let service = item.service.as_str();
        let backup = backup_key(&item.key);
        let stored_value = self.envelope.wrap(&item.value, tier)?;
        let description = tier.attribute();
        let primary = NewRecord {
            class: RecordClass::GenericPassword,
            account: &item.key,
            service,
            value: &stored_value,
            access: access_policy(tier),
            description: Some(description.as_str()),
        };
        let backup_record = NewRecord {
            account: &backup,
            ..primary
        };

        // 1. Write-ahead copy.
        match self.backend.add(backup_record) {
            Ok(()) => {}
            Err(err) if err.kind == ErrorKind::DuplicateItem => {
                self.repair_stale_backup(&item.key, service)?;
                self.backend
                    .add(backup_record)
                    .map_err(|e| e.with_item(service, &backup))?;
            }
            Err(err) => return Err(err.with_item(service, &backup)),
        }
        debug!("backup record written");

        // 2. Drop the current primary; the backup covers the gap.
        self.delete_record(&item.key, service)?;

        // 3. Commit. On failure the backup stays behind as the durable copy.
        if let Err(err) = self.backend.add(primary) {
            warn!(error = %err, "primary write failed, backup record retained");
            return Err(err);
        }

        // 4. The backup is now redundant; a leftover one is shadowed by the primary.
        if let Err(err) = self.delete_record(&backup, service) {
            warn!(error = %err, "backup record not removed after commit");
        }
        Ok(())
    }

    /// Resolves a backup left by an interrupted earlier write so a new one can be added.
    /// If the primary is missing the backup is promoted first, so the item is never absent.
    fn repair_stale_backup(&self, key: &str, service: &str) -> Result<()> {
        let backup = backup_key(key);
        let Some(stale) = self.fetch_record(&backup, service)? else {
            return Ok(());
        };
        if self.fetch_record(key, service)?.is_none() {
            info!(key, service, "promoting backup left by an interrupted write");
            self.backend
                .add(NewRecord {
                    class: RecordClass::GenericPassword,
                    account: key,
                    service,
                    value: &stale.value,
                    access: stale.access,
                    description: stale.description.as_deref(),
                })
                .map_err(|e| e.with_item(service, key))?;
        }
        self.delete_record(&backup, service)
    }

    #[instrument(skip(self))]
    pub fn get_item(&self, key: &str, service: &str) -> Result<Option<Item>> {
        validate_identity(service, key)?;
        self.locked_read(key, service)
            .and_then(|found| {
                found
                    .map(|record| self.open_record(record).map(|stored| stored.item))
                    .transpose()
            })
            .map_err(|e| e.with_item(service, key))
    }

    /// Reads the record without removing the envelope.
    #[instrument(skip(self))]
    pub fn get_stored_item(&self, key: &str, service: &str) -> Result<Option<StoredItem>> {
        validate_identity(service, key)?;
        self.locked_read(key, service)
            .and_then(|found| found.map(decode_record).transpose())
            .map_err(|e| e.with_item(service, key))
    }

    // Holding the key lock keeps a reader out of the window between a commit and
    // the backup removal, where an unlocked primary-then-backup probe can miss both.
    fn locked_read(&self, key: &str, service: &str) -> Result<Option<Record>> {
        self.locks.with_lock(service, key, || self.read(key, service))
    }

    fn read(&self, key: &str, service: &str) -> Result<Option<Record>> {
        if let Some(record) = self.fetch_record(key, service)? {
            return Ok(Some(record));
        }
        let recovered = self.fetch_record(&backup_key(key), service)?;
        if recovered.is_some() {
            warn!("primary record missing, serving backup record");
        }
        Ok(recovered)
    }

    /// Enumerates every record of `service` across all record classes, keyed by
    /// primary key. At most one enumeration starts per throttle window.
    #[instrument(skip(self, cancel))]
    pub fn get_all_items(
        &self,
        service: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<HashMap<String, Item>> {
        self.throttle.acquire(cancel)?;

        let mut items = HashMap::new();
        for class in RecordClass::ALL {
            let records = match self.backend.query(&RecordQuery::all(class, Some(service))) {
                Ok(records) => records,
                Err(err)
                    if matches!(err.kind, ErrorKind::ItemNotFound | ErrorKind::NoSuchAttribute) =>
                {
                    debug!(class = class.as_str(), "no records in class");
                    continue;
                }
                Err(err) => return Err(err),
            };
            debug!(class = class.as_str(), count = records.len(), "enumerated class");

            for record in records {
                let account = record.account.clone();
                let stored = self
                    .open_record(record)
                    .map_err(|e| e.with_item(service, &account))?;
                let key = stored.item.key.clone();
                if stored.from_backup {
                    items.entry(key).or_insert(stored.item);
                } else {
                    items.insert(key, stored.item);
                }
            }
        }
        Ok(items)
    }

    /// Deletes the primary record. Absence is success.
    pub fn delete(&self, key: &str, service: &str) -> Result<()> {
        self.delete_and_then(key, service, |_| ())
    }

    /// Like [`Self::delete`], running `on_done` under the key lock.
    #[instrument(skip(self, on_done))]
    pub fn delete_and_then(
        &self,
        key: &str,
        service: &str,
        on_done: impl FnOnce(&Result<()>),
    ) -> Result<()> {
        validate_identity(service, key)?;
        self.locks.with_lock(service, key, || {
            let result = self
                .delete_record(key, service)
                .map_err(|e| e.with_item(service, key));
            on_done(&result);
            result
        })
    }

    /// Deletes every generic password record of `service`, backups included.
    /// Returns the number of records removed.
    #[instrument(skip(self))]
    pub fn purge_service(&self, service: &str) -> Result<usize> {
        let records = match self
            .backend
            .query(&RecordQuery::all(RecordClass::GenericPassword, Some(service)))
        {
            Ok(records) => records,
            Err(err) if err.is_not_found() => return Ok(0),
            Err(err) => return Err(err),
        };

        let mut removed = 0;
        for record in records {
            let account = record.account;
            self.locks.with_lock(service, primary_key(&account), || {
                self.delete_record(&account, service)
                    .map_err(|e| e.with_item(service, &account))
            })?;
            removed += 1;
        }
        info!(removed, "purged service");
        Ok(removed)
    }

    fn fetch_record(&self, account: &str, service: &str) -> Result<Option<Record>> {
        let query = RecordQuery::single(RecordClass::GenericPassword, account, service);
        match self.backend.query(&query) {
            Ok(records) => Ok(records.into_iter().next()),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.with_item(service, account)),
        }
    }

    fn delete_record(&self, account: &str, service: &str) -> Result<()> {
        match self
            .backend
            .delete(RecordClass::GenericPassword, account, service)
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => {
                debug!(account, "nothing to delete");
                Ok(())
            }
            Err(err) => Err(err.with_item(service, account)),
        }
    }

    fn open_record(&self, record: Record) -> Result<StoredItem> {
        let mut stored = decode_record(record)?;
        stored.item.value = self.envelope.unwrap(&stored.item.value, stored.tier)?;
        Ok(stored)
    }
}

fn decode_record(record: Record) -> Result<StoredItem> {
    let tier = SecurityTier::from_attribute(record.description.as_deref()).inspect_err(|_| {
        warn!(account = %record.account, "record has no valid tier attribute");
    })?;
    Ok(StoredItem {
        from_backup: is_backup_key(&record.account),
        item: Item::new(primary_key(&record.account), record.service, record.value),
        tier,
    })
}

fn validate_identity(service: &str, key: &str) -> Result<()> {
    if service.is_empty() || key.is_empty() || is_backup_key(key) {
        return Err(KeystoreError::new(ErrorKind::InvalidParameter).with_item(service, key));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tierkeep_core::{InMemoryBackend, Operation};

    use super::*;
    use crate::key_provider::InMemoryKeyProvider;

    const TAG: &str = "test.writer";

    struct Harness {
        backend: InMemoryBackend,
        provider: InMemoryKeyProvider,
        writer: ItemWriter<InMemoryBackend, InMemoryKeyProvider>,
    }

    fn harness() -> Harness {
        harness_with_interval(Duration::from_millis(1))
    }

    fn harness_with_interval(interval: Duration) -> Harness {
        let backend = InMemoryBackend::new();
        let provider = InMemoryKeyProvider::default();
        let writer = ItemWriter::new(
            backend.clone(),
            Envelope::new(provider.clone(), TAG),
            EnumerationThrottle::new(interval, None),
        );
        Harness {
            backend,
            provider,
            writer,
        }
    }

    fn item(key: &str, value: &str) -> Item {
        Item::new(key, "S", value.as_bytes().to_vec())
    }

    #[test]
    fn store_then_get_round_trips_every_tier() {
        let h = harness();
        for tier in SecurityTier::ALL {
            let expected = item(&format!("k-{tier}"), "value");
            h.writer.store(&expected, tier).expect("store");
            let found = h.writer.get_item(&expected.key, "S").expect("get");
            assert_eq!(found, Some(expected));
        }
    }

    #[test]
    fn store_leaves_only_the_primary_record() {
        let h = harness();
        h.writer.store(&item("u1", "a"), SecurityTier::Low).unwrap();
        h.writer.store(&item("u1", "b"), SecurityTier::Low).unwrap();
        assert_eq!(h.backend.accounts("S"), vec!["u1".to_string()]);
        assert_eq!(
            h.writer.get_item("u1", "S").unwrap(),
            Some(item("u1", "b"))
        );
    }

    #[test]
    fn high_tier_is_encrypted_at_rest() {
        let h = harness();
        h.writer.store(&item("u1", "secret"), SecurityTier::High).unwrap();
        let stored = h.writer.get_stored_item("u1", "S").unwrap().expect("present");
        assert_eq!(stored.tier, SecurityTier::High);
        assert_ne!(stored.item.value, b"secret");
    }

    #[test]
    fn failed_backup_add_preserves_prior_state() {
        let h = harness();
        h.writer.store(&item("u1", "old"), SecurityTier::Low).unwrap();
        h.backend
            .fail_next(Operation::Add, "u1_backup", ErrorKind::IoFailure);

        let err = h
            .writer
            .store(&item("u1", "new"), SecurityTier::Low)
            .expect_err("backup add fails");
        assert_eq!(err.kind, ErrorKind::IoFailure);
        assert_eq!(err.context.unwrap().key, "u1_backup");
        assert_eq!(h.writer.get_item("u1", "S").unwrap(), Some(item("u1", "old")));
    }

    #[test]
    fn interrupted_before_commit_reads_from_backup() {
        let h = harness();
        h.writer.store(&item("u1", "old"), SecurityTier::High).unwrap();
        h.backend.fail_next(Operation::Add, "u1", ErrorKind::IoFailure);

        let err = h
            .writer
            .store(&item("u1", "new"), SecurityTier::High)
            .expect_err("primary add fails");
        assert_eq!(err.kind, ErrorKind::IoFailure);
        assert_eq!(h.backend.accounts("S"), vec!["u1_backup".to_string()]);

        let found = h.writer.get_item("u1", "S").unwrap();
        assert_eq!(found, Some(item("u1", "new")));
        let stored = h.writer.get_stored_item("u1", "S").unwrap().unwrap();
        assert!(stored.from_backup);
    }

    #[test]
    fn interrupted_before_primary_delete_keeps_old_value_visible() {
        let h = harness();
        h.writer.store(&item("u1", "old"), SecurityTier::Medium).unwrap();
        h.backend.fail_next(Operation::Delete, "u1", ErrorKind::IoFailure);

        h.writer
            .store(&item("u1", "new"), SecurityTier::Medium)
            .expect_err("primary delete fails");
        assert_eq!(h.writer.get_item("u1", "S").unwrap(), Some(item("u1", "old")));
    }

    #[test]
    fn next_store_repairs_a_stale_backup() {
        let h = harness();
        h.writer.store(&item("u1", "old"), SecurityTier::Low).unwrap();
        h.backend.fail_next(Operation::Add, "u1", ErrorKind::IoFailure);
        h.writer
            .store(&item("u1", "mid"), SecurityTier::Low)
            .expect_err("primary add fails");

        h.writer.store(&item("u1", "new"), SecurityTier::Low).expect("repaired");
        assert_eq!(h.backend.accounts("S"), vec!["u1".to_string()]);
        assert_eq!(h.writer.get_item("u1", "S").unwrap(), Some(item("u1", "new")));
    }

    #[test]
    fn leftover_backup_after_commit_is_shadowed() {
        let h = harness();
        h.backend
            .fail_next(Operation::Delete, "u1_backup", ErrorKind::IoFailure);
        h.writer
            .store(&item("u1", "v"), SecurityTier::Low)
            .expect("commit succeeded");

        let all = h.writer.get_all_items("S", None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["u1"], item("u1", "v"));
    }

    #[test]
    fn delete_is_idempotent() {
        let h = harness();
        h.writer.delete("missing", "S").expect("absent delete");
        h.writer.store(&item("u1", "v"), SecurityTier::Low).unwrap();
        h.writer.delete("u1", "S").expect("delete");
        h.writer.delete("u1", "S").expect("delete again");
        assert_eq!(h.writer.get_item("u1", "S").unwrap(), None);
    }

    #[test]
    fn backend_errors_propagate_with_context() {
        let h = harness();
        h.backend.fail_next(Operation::Delete, "u1", ErrorKind::InteractionNotAllowed);
        let err = h.writer.delete("u1", "S").expect_err("fault");
        assert_eq!(err.kind, ErrorKind::InteractionNotAllowed);
        assert_eq!(err.context.unwrap().service, "S");
    }

    #[test]
    fn missing_key_material_fails_high_reads() {
        let h = harness();
        h.writer.store(&item("u1", "secret"), SecurityTier::High).unwrap();
        h.provider.destroy(TAG);
        let err = h.writer.get_item("u1", "S").expect_err("key destroyed");
        assert_eq!(err.kind, ErrorKind::MissingKeyMaterial);
    }

    #[test]
    fn reserved_and_empty_identities_are_rejected() {
        let h = harness();
        for bad in [item("", "v"), item("u1_backup", "v"), Item::new("k", "", b"v".to_vec())] {
            let err = h.writer.store(&bad, SecurityTier::Low).expect_err("invalid");
            assert_eq!(err.kind, ErrorKind::InvalidParameter);
        }
    }

    #[test]
    fn invalid_tier_attribute_is_a_conversion_failure() {
        let h = harness();
        h.backend
            .add(NewRecord {
                class: RecordClass::GenericPassword,
                account: "foreign",
                service: "S",
                value: b"v",
                access: Default::default(),
                description: Some("high"),
            })
            .unwrap();
        let err = h.writer.get_item("foreign", "S").expect_err("ambiguous tier");
        assert_eq!(err.kind, ErrorKind::DataConversionFailure);
    }

    #[test]
    fn enumeration_covers_all_classes_and_tolerates_empty_ones() {
        let h = harness();
        h.writer.store(&item("a", "1"), SecurityTier::Low).unwrap();
        h.writer.store(&item("b", "2"), SecurityTier::High).unwrap();
        h.backend
            .add(NewRecord {
                class: RecordClass::InternetPassword,
                account: "c",
                service: "S",
                value: b"3",
                access: Default::default(),
                description: Some(SecurityTier::Medium.attribute().as_str()),
            })
            .unwrap();
        h.backend
            .fail_class(RecordClass::Identity, Some(ErrorKind::NoSuchAttribute));

        let all = h.writer.get_all_items("S", None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all["b"], item("b", "2"));
        assert_eq!(all["c"], item("c", "3"));
    }

    #[test]
    fn enumeration_aborts_on_other_errors() {
        let h = harness();
        h.writer.store(&item("a", "1"), SecurityTier::Low).unwrap();
        h.backend
            .fail_class(RecordClass::Certificate, Some(ErrorKind::AuthenticationFailed));
        let err = h.writer.get_all_items("S", None).expect_err("abort");
        assert_eq!(err.kind, ErrorKind::AuthenticationFailed);
    }

    #[test]
    fn enumeration_recovers_backup_only_items() {
        let h = harness();
        h.backend.fail_next(Operation::Add, "u1", ErrorKind::IoFailure);
        h.writer
            .store(&item("u1", "v"), SecurityTier::High)
            .expect_err("primary add fails");
        let all = h.writer.get_all_items("S", None).unwrap();
        assert_eq!(all.get("u1"), Some(&item("u1", "v")));
    }

    #[test]
    fn enumerations_are_throttled() {
        let h = harness_with_interval(Duration::from_millis(300));
        let first = Instant::now();
        h.writer.get_all_items("S", None).unwrap();
        h.writer.get_all_items("S", None).unwrap();
        assert!(first.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn purge_removes_primary_and_backup_records() {
        let h = harness();
        h.writer.store(&item("a", "1"), SecurityTier::Low).unwrap();
        h.backend.fail_next(Operation::Add, "b", ErrorKind::IoFailure);
        h.writer
            .store(&item("b", "2"), SecurityTier::Low)
            .expect_err("leaves backup");

        assert_eq!(h.writer.purge_service("S").unwrap(), 2);
        assert!(h.backend.accounts("S").is_empty());
        assert_eq!(h.writer.purge_service("S").unwrap(), 0);
    }
}
