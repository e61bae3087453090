use std::path::PathBuf;

use crate::config::Config;
use color_eyre::Result;
use dirs::data_dir;
#[cfg(test)]
use tierkeep_storage::InMemoryKeyProvider;
use tierkeep_storage::{FileBackend, KeyringKeyProvider, Keystore};
use tracing::debug;

/// Keyring service the device key is filed under.
const KEYRING_SERVICE: &str = "tierkeep-cli";

pub type ProductionKeystore = Keystore<FileBackend, KeyringKeyProvider>;

/// Resolve the default data directory for tierkeep.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("tierkeep"))
}

/// Build the keystore over the file backend, honoring config overrides.
pub fn keystore_from_config(config: &Config) -> Result<ProductionKeystore> {
    let root = match &config.data_dir {
        Some(root) => {
            debug!(?root, "initializing keystore (config override)");
            root.clone()
        }
        None => {
            let root = default_data_dir()?;
            debug!(?root, "initializing keystore");
            root
        }
    };
    Ok(Keystore::new(
        FileBackend::new(root),
        KeyringKeyProvider::new(KEYRING_SERVICE),
        &config.keystore,
    ))
}

/// Helper for tests to construct a keystore rooted at a temp dir with an in-memory key.
#[cfg(test)]
pub fn test_keystore(root: impl Into<PathBuf>) -> Keystore<FileBackend, InMemoryKeyProvider> {
    Keystore::new(
        FileBackend::new(root),
        InMemoryKeyProvider::default(),
        &tierkeep_storage::KeystoreConfig {
            enumeration_interval_ms: 1,
            ..Default::default()
        },
    )
}
