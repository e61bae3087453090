//! Tiered secure storage on top of a `SecureBackend`.
//! High-tier values are sealed to a device key (OS keyring in production, or test doubles);
//! every write goes through a backup-then-commit protocol so a crash never loses an item.

pub mod cache;
pub mod config;
pub mod envelope;
pub mod file_backend;
pub mod item_writer;
mod key_locks;
pub mod key_provider;
pub mod keystore;
pub mod throttle;

pub use config::{KeystoreConfig, DEFAULT_KEY_TAG};
pub use file_backend::FileBackend;
pub use item_writer::StoredItem;
pub use key_provider::{InMemoryKeyProvider, KeyringKeyProvider};
pub use keystore::Keystore;
pub use throttle::CancellationToken;
