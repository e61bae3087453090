use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, KeystoreError};

/// Suffix reserved for write-ahead backup records.
pub const BACKUP_SUFFIX: &str = "_backup";

/// Namespace for the tier tag stamped into a record's description attribute.
const TIER_ATTRIBUTE_PREFIX: &str = "tierkeep:tier=";

/// An opaque value stored under a `(service, key)` identity.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Item {
    pub key: String,
    pub service: String,
    pub value: Vec<u8>,
}

impl Item {
    pub fn new(key: impl Into<String>, service: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            service: service.into(),
            value: value.into(),
        }
    }

    /// Builds an item with a random UUID value, keyed off the service name.
    #[cfg(test)]
    pub fn mock(service: &str) -> Self {
        Self::new(
            format!("{service}MockKey"),
            service,
            uuid::Uuid::new_v4().to_string().into_bytes(),
        )
    }
}

// Values are secrets; keep them out of logs and panic messages.
impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("key", &self.key)
            .field("service", &self.service)
            .field("value", &format_args!("[{} bytes]", self.value.len()))
            .finish()
    }
}

/// Protection level chosen at write time.
///
/// - `Low`: stored as-is, readable while the device is unlocked.
/// - `Medium`: stored as-is, every read demands user presence.
/// - `High`: encrypted with the hardware key, every read demands user presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityTier {
    #[default]
    Low,
    Medium,
    High,
}

impl SecurityTier {
    pub const ALL: [SecurityTier; 3] = [Self::Low, Self::Medium, Self::High];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Value written to the record's description attribute.
    pub fn attribute(self) -> String {
        format!("{TIER_ATTRIBUTE_PREFIX}{}", self.as_str())
    }

    /// Recovers the tier from a stored description attribute.
    /// Anything but one of the three namespaced tags is an integrity violation.
    pub fn from_attribute(attribute: Option<&str>) -> Result<Self, KeystoreError> {
        attribute
            .and_then(|raw| raw.strip_prefix(TIER_ATTRIBUTE_PREFIX))
            .and_then(|tag| tag.parse().ok())
            .ok_or_else(|| KeystoreError::new(ErrorKind::DataConversionFailure))
    }

    pub fn requires_user_presence(self) -> bool {
        !matches!(self, Self::Low)
    }

    pub fn is_encrypted(self) -> bool {
        matches!(self, Self::High)
    }
}

impl fmt::Display for SecurityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityTier {
    type Err = KeystoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(KeystoreError::new(ErrorKind::InvalidParameter)),
        }
    }
}

/// Account name of the write-ahead backup record for `key`.
pub fn backup_key(key: &str) -> String {
    format!("{key}{BACKUP_SUFFIX}")
}

pub fn is_backup_key(key: &str) -> bool {
    key.ends_with(BACKUP_SUFFIX)
}

/// Primary key a stored account name belongs to.
pub fn primary_key(account: &str) -> &str {
    account.strip_suffix(BACKUP_SUFFIX).unwrap_or(account)
}
