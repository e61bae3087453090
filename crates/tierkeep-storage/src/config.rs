use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::throttle::{EnumerationThrottle, DEFAULT_ENUMERATION_INTERVAL};

/// Identifier of the hardware key used for High-tier values.
pub const DEFAULT_KEY_TAG: &str = "tierkeep.envelope.key";

/// Tunables for a [`crate::keystore::Keystore`].
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeystoreConfig {
    /// Tag under which the hardware key pair is looked up or generated.
    pub key_tag: String,
    /// Minimum spacing between full enumerations.
    pub enumeration_interval_ms: u64,
    /// Upper bound on how long an enumeration may wait for its slot; unbounded if unset.
    pub max_enumeration_wait_ms: Option<u64>,
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            key_tag: DEFAULT_KEY_TAG.to_string(),
            enumeration_interval_ms: DEFAULT_ENUMERATION_INTERVAL.as_millis() as u64,
            max_enumeration_wait_ms: None,
        }
    }
}

impl KeystoreConfig {
    pub fn throttle(&self) -> EnumerationThrottle {
        EnumerationThrottle::new(
            Duration::from_millis(self.enumeration_interval_ms),
            self.max_enumeration_wait_ms.map(Duration::from_millis),
        )
    }
}
