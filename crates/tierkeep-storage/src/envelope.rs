use std::sync::{Mutex, PoisonError};

use tierkeep_core::{
    AccessPolicy, ErrorKind, HardwareKeyProvider, KeystoreError, Result, SecurityTier,
};
use tracing::{debug, instrument};

/// Access-control policy the backend must attach to a record of `tier`.
pub fn access_policy(tier: SecurityTier) -> AccessPolicy {
    AccessPolicy {
        unlocked_this_device_only: true,
        require_user_presence: tier.requires_user_presence(),
    }
}

/// Applies and removes the per-tier protection around stored values.
///
/// Low and Medium values pass through untouched; High values are encrypted to the
/// public half of a hardware key identified by `key_tag`, generated on first use.
pub struct Envelope<P: HardwareKeyProvider> {
    provider: P,
    key_tag: String,
    /// Serializes first-use key generation within this process.
    generation: Mutex<()>,
}

impl<P: HardwareKeyProvider> Envelope<P> {
    pub fn new(provider: P, key_tag: impl Into<String>) -> Self {
        Self {
            provider,
            key_tag: key_tag.into(),
            generation: Mutex::new(()),
        }
    }

    #[instrument(skip_all, fields(%tier))]
    pub fn wrap(&self, value: &[u8], tier: SecurityTier) -> Result<Vec<u8>> {
        if !tier.is_encrypted() {
            return Ok(value.to_vec());
        }
        let private_key = self.private_key_or_generate()?;
        let public_key = self
            .provider
            .derive_public_key(&private_key)
            .ok_or_else(|| KeystoreError::new(ErrorKind::PublicKeyCreationFailed))?;
        self.provider.encrypt(value, &public_key)
    }

    #[instrument(skip_all, fields(%tier))]
    pub fn unwrap(&self, stored: &[u8], tier: SecurityTier) -> Result<Vec<u8>> {
        if !tier.is_encrypted() {
            return Ok(stored.to_vec());
        }
        let private_key = self
            .provider
            .fetch_private_key(&self.key_tag)?
            .ok_or_else(|| KeystoreError::new(ErrorKind::MissingKeyMaterial))?;
        self.provider.decrypt(stored, &private_key)
    }

    fn private_key_or_generate(&self) -> Result<P::PrivateKey> {
        if let Some(key) = self.provider.fetch_private_key(&self.key_tag)? {
            return Ok(key);
        }
        // Providers that overwrite on generate would otherwise hand each racing
        // writer a different key, and only the last one survives.
        let _generating = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = self.provider.fetch_private_key(&self.key_tag)? {
            return Ok(key);
        }
        debug!(tag = %self.key_tag, "no device key yet, generating");
        match self.provider.generate_key_pair(&self.key_tag) {
            Ok(key) => Ok(key),
            // Another caller won the race to create it.
            Err(err) if err.kind == ErrorKind::DuplicateItem => self
                .provider
                .fetch_private_key(&self.key_tag)?
                .ok_or_else(|| KeystoreError::new(ErrorKind::MissingKeyMaterial)),
            Err(err) => Err(err),
        }
    }
}
