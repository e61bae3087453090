use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, KeystoreError, Result};

/// Record classes a secure storage backend distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordClass {
    GenericPassword,
    InternetPassword,
    Certificate,
    CryptographicKey,
    Identity,
}

impl RecordClass {
    pub const ALL: [RecordClass; 5] = [
        Self::GenericPassword,
        Self::InternetPassword,
        Self::Certificate,
        Self::CryptographicKey,
        Self::Identity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GenericPassword => "generic-password",
            Self::InternetPassword => "internet-password",
            Self::Certificate => "certificate",
            Self::CryptographicKey => "cryptographic-key",
            Self::Identity => "identity",
        }
    }
}

/// Access-control capability bundle attached to a record at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub unlocked_this_device_only: bool,
    pub require_user_presence: bool,
}

/// A record to be added.
#[derive(Clone, Copy)]
pub struct NewRecord<'a> {
    pub class: RecordClass,
    pub account: &'a str,
    pub service: &'a str,
    pub value: &'a [u8],
    pub access: AccessPolicy,
    pub description: Option<&'a str>,
}

/// A record returned by a query.
#[derive(Clone, PartialEq, Eq)]
pub struct Record {
    pub class: RecordClass,
    pub account: String,
    pub service: String,
    pub value: Vec<u8>,
    pub access: AccessPolicy,
    pub description: Option<String>,
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("class", &self.class)
            .field("account", &self.account)
            .field("service", &self.service)
            .field("value", &format_args!("[{} bytes]", self.value.len()))
            .field("access", &self.access)
            .field("description", &self.description)
            .finish()
    }
}

/// Query filter; `None` fields match anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    pub class: RecordClass,
    pub service: Option<String>,
    pub account: Option<String>,
    pub match_all: bool,
}

impl RecordQuery {
    /// Matches the one record at `(account, service)`.
    pub fn single(class: RecordClass, account: &str, service: &str) -> Self {
        Self {
            class,
            service: Some(service.to_string()),
            account: Some(account.to_string()),
            match_all: false,
        }
    }

    /// Matches every record of the class, optionally restricted to one service.
    pub fn all(class: RecordClass, service: Option<&str>) -> Self {
        Self {
            class,
            service: service.map(str::to_string),
            account: None,
            match_all: true,
        }
    }

    fn matches(&self, record: &Record) -> bool {
        record.class == self.class
            && self.service.as_deref().is_none_or(|s| s == record.service)
            && self.account.as_deref().is_none_or(|a| a == record.account)
    }
}

/// Persistent attribute store addressed by `(class, account, service)`.
///
/// Implementations report absence as `ItemNotFound` from both `delete` and
/// `query`, and refuse to overwrite on `add` with `DuplicateItem`.
pub trait SecureBackend: Send + Sync {
    fn add(&self, record: NewRecord<'_>) -> Result<()>;

    fn delete(&self, class: RecordClass, account: &str, service: &str) -> Result<()>;

    fn query(&self, query: &RecordQuery) -> Result<Vec<Record>>;
}

impl<B: SecureBackend + ?Sized> SecureBackend for Arc<B> {
    fn add(&self, record: NewRecord<'_>) -> Result<()> {
        (**self).add(record)
    }

    fn delete(&self, class: RecordClass, account: &str, service: &str) -> Result<()> {
        (**self).delete(class, account, service)
    }

    fn query(&self, query: &RecordQuery) -> Result<Vec<Record>> {
        (**self).query(query)
    }
}

/// Backend operation a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Add,
    Delete,
    Query,
}

type RecordId = (RecordClass, String, String);

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<RecordId, Record>,
    faults: HashMap<(Operation, String), ErrorKind>,
    class_faults: HashMap<RecordClass, ErrorKind>,
}

/// In-memory backend for tests and smoke runs, with one-shot fault injection
/// to simulate a process dying between protocol steps.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<MemoryState>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `op` touching `account` fails with `kind`.
    pub fn fail_next(&self, op: Operation, account: &str, kind: ErrorKind) {
        if let Ok(mut state) = self.inner.lock() {
            state.faults.insert((op, account.to_string()), kind);
        }
    }

    /// Every enumeration of `class` fails with `kind` until cleared.
    pub fn fail_class(&self, class: RecordClass, kind: Option<ErrorKind>) {
        if let Ok(mut state) = self.inner.lock() {
            match kind {
                Some(kind) => state.class_faults.insert(class, kind),
                None => state.class_faults.remove(&class),
            };
        }
    }

    /// Accounts currently stored for a service in the generic password class.
    pub fn accounts(&self, service: &str) -> Vec<String> {
        self.inner
            .lock()
            .map(|state| {
                state
                    .records
                    .values()
                    .filter(|r| r.class == RecordClass::GenericPassword && r.service == service)
                    .map(|r| r.account.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.inner.lock().map_err(|err| {
            tracing::error!("backend lock poisoned: {err}");
            KeystoreError::new(ErrorKind::IoFailure)
        })
    }
}

impl MemoryState {
    fn take_fault(&mut self, op: Operation, account: &str) -> Result<()> {
        match self.faults.remove(&(op, account.to_string())) {
            Some(kind) => Err(KeystoreError::new(kind)),
            None => Ok(()),
        }
    }
}

impl SecureBackend for InMemoryBackend {
    fn add(&self, record: NewRecord<'_>) -> Result<()> {
        let mut state = self.lock()?;
        state.take_fault(Operation::Add, record.account)?;

        let id = (record.class, record.service.to_string(), record.account.to_string());
        if state.records.contains_key(&id) {
            return Err(KeystoreError::new(ErrorKind::DuplicateItem));
        }
        state.records.insert(
            id,
            Record {
                class: record.class,
                account: record.account.to_string(),
                service: record.service.to_string(),
                value: record.value.to_vec(),
                access: record.access,
                description: record.description.map(str::to_string),
            },
        );
        Ok(())
    }

    fn delete(&self, class: RecordClass, account: &str, service: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.take_fault(Operation::Delete, account)?;

        let id = (class, service.to_string(), account.to_string());
        state
            .records
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| KeystoreError::new(ErrorKind::ItemNotFound))
    }

    fn query(&self, query: &RecordQuery) -> Result<Vec<Record>> {
        let mut state = self.lock()?;
        if let Some(account) = &query.account {
            state.take_fault(Operation::Query, account)?;
        }
        if let Some(kind) = state.class_faults.get(&query.class) {
            return Err(KeystoreError::new(kind.clone()));
        }

        let mut found: Vec<Record> = state
            .records
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        if found.is_empty() {
            return Err(KeystoreError::new(ErrorKind::ItemNotFound));
        }
        if !query.match_all {
            found.truncate(1);
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record<'a>(account: &'a str, value: &'a [u8]) -> NewRecord<'a> {
        NewRecord {
            class: RecordClass::GenericPassword,
            account,
            service: "svc",
            value,
            access: AccessPolicy::default(),
            description: Some("tierkeep:tier=low"),
        }
    }

    #[test]
    fn add_refuses_duplicates() {
        let backend = InMemoryBackend::new();
        backend.add(record("a", b"1")).expect("first add");
        let err = backend.add(record("a", b"2")).expect_err("duplicate");
        assert_eq!(err.kind, ErrorKind::DuplicateItem);
    }

    #[test]
    fn delete_and_query_report_absence() {
        let backend = InMemoryBackend::new();
        let err = backend
            .delete(RecordClass::GenericPassword, "a", "svc")
            .expect_err("missing");
        assert!(err.is_not_found());

        let err = backend
            .query(&RecordQuery::single(RecordClass::GenericPassword, "a", "svc"))
            .expect_err("missing");
        assert!(err.is_not_found());
    }

    #[test]
    fn query_filters_by_class_and_service() {
        let backend = InMemoryBackend::new();
        backend.add(record("a", b"1")).expect("add");
        backend.add(record("b", b"2")).expect("add");
        backend
            .add(NewRecord {
                service: "other",
                ..record("c", b"3")
            })
            .expect("add");

        let all = backend
            .query(&RecordQuery::all(RecordClass::GenericPassword, Some("svc")))
            .expect("query");
        assert_eq!(all.len(), 2);

        let err = backend
            .query(&RecordQuery::all(RecordClass::Certificate, Some("svc")))
            .expect_err("no certificates");
        assert!(err.is_not_found());
    }

    #[test]
    fn injected_fault_fires_once() {
        let backend = InMemoryBackend::new();
        backend.fail_next(Operation::Add, "a", ErrorKind::IoFailure);
        let err = backend.add(record("a", b"1")).expect_err("fault");
        assert_eq!(err.kind, ErrorKind::IoFailure);
        backend.add(record("a", b"1")).expect("second add succeeds");
        assert_eq!(backend.accounts("svc"), vec!["a".to_string()]);
    }
}
