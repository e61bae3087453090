//! Core contracts for Tierkeep: items, protection tiers, the error taxonomy,
//! and the two platform collaborators (secure storage backend and hardware key provider).
//! This crate is intentionally small to keep dependency surface minimal.

pub mod backend;
pub mod error;
pub mod item;
pub mod key_provider;

pub use backend::{
    AccessPolicy, InMemoryBackend, NewRecord, Operation, Record, RecordClass, RecordQuery,
    SecureBackend,
};
pub use error::{ErrorKind, ItemRef, KeystoreError, Result};
pub use item::{backup_key, is_backup_key, primary_key, Item, SecurityTier, BACKUP_SUFFIX};
pub use key_provider::HardwareKeyProvider;
