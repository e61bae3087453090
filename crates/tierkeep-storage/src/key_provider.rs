use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use tierkeep_core::{ErrorKind, HardwareKeyProvider, KeystoreError, Result};
use tracing::{debug, info};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HKDF_LABEL: &[u8] = b"tierkeep:envelope:v1";

/// Private key handle. The secret is zeroized on drop and never printed.
#[derive(Clone)]
pub struct DeviceKey {
    tag: String,
    secret: StaticSecret,
}

impl DeviceKey {
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKey")
            .field("tag", &self.tag)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Public half of a [`DeviceKey`].
#[derive(Debug, Clone, Copy)]
pub struct DevicePublicKey(PublicKey);

/// Key provider that keeps the private key in the OS keyring (`keyring` crate).
///
/// This is a software stand-in for a secure enclave: the key is protected by the
/// platform credential store rather than by dedicated hardware.
pub struct KeyringKeyProvider {
    service: String,
    /// Held across check, generate and store; the keyring overwrites on `set_secret`.
    generation: Mutex<()>,
}

impl KeyringKeyProvider {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            generation: Mutex::new(()),
        }
    }

    fn entry(&self, tag: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, tag).map_err(keyring_err)
    }
}

impl HardwareKeyProvider for KeyringKeyProvider {
    type PrivateKey = DeviceKey;
    type PublicKey = DevicePublicKey;

    fn generate_key_pair(&self, tag: &str) -> Result<DeviceKey> {
        let _generating = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = self.fetch_private_key(tag)? {
            return Ok(existing);
        }

        let secret = StaticSecret::random_from_rng(OsRng);
        self.entry(tag)?
            .set_secret(secret.as_bytes())
            .map_err(|e| {
                KeystoreError::new(ErrorKind::PrivateKeyCreationFailed(e.to_string()))
            })?;
        info!(tag, "generated device key");
        // Return what the keyring holds, in case another process stored first.
        self.fetch_private_key(tag)?.ok_or_else(|| {
            KeystoreError::new(ErrorKind::PrivateKeyCreationFailed(
                "device key not readable after store".to_string(),
            ))
        })
    }

    fn fetch_private_key(&self, tag: &str) -> Result<Option<DeviceKey>> {
        match self.entry(tag)?.get_secret() {
            Ok(bytes) => decode_secret(tag, &bytes).map(Some),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(keyring_err(err)),
        }
    }

    fn derive_public_key(&self, private_key: &DeviceKey) -> Option<DevicePublicKey> {
        Some(DevicePublicKey(PublicKey::from(&private_key.secret)))
    }

    fn encrypt(&self, plaintext: &[u8], public_key: &DevicePublicKey) -> Result<Vec<u8>> {
        seal(plaintext, &public_key.0)
    }

    fn decrypt(&self, ciphertext: &[u8], private_key: &DeviceKey) -> Result<Vec<u8>> {
        open(ciphertext, &private_key.secret)
    }
}

/// In-memory key provider for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyProvider {
    inner: Arc<Mutex<HashMap<String, DeviceKey>>>,
}

impl InMemoryKeyProvider {
    /// Drops the key under `tag`, as if it had been wiped out-of-band.
    pub fn destroy(&self, tag: &str) {
        if let Ok(mut keys) = self.inner.lock() {
            keys.remove(tag);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, DeviceKey>>> {
        self.inner.lock().map_err(|err| {
            KeystoreError::new(ErrorKind::PrivateKeyCreationFailed(format!(
                "lock poisoned: {err}"
            )))
        })
    }
}

impl HardwareKeyProvider for InMemoryKeyProvider {
    type PrivateKey = DeviceKey;
    type PublicKey = DevicePublicKey;

    fn generate_key_pair(&self, tag: &str) -> Result<DeviceKey> {
        let mut keys = self.lock()?;
        let key = keys.entry(tag.to_string()).or_insert_with(|| {
            debug!(tag, "generated in-memory device key");
            DeviceKey {
                tag: tag.to_string(),
                secret: StaticSecret::random_from_rng(OsRng),
            }
        });
        Ok(key.clone())
    }

    fn fetch_private_key(&self, tag: &str) -> Result<Option<DeviceKey>> {
        Ok(self.lock()?.get(tag).cloned())
    }

    fn derive_public_key(&self, private_key: &DeviceKey) -> Option<DevicePublicKey> {
        Some(DevicePublicKey(PublicKey::from(&private_key.secret)))
    }

    fn encrypt(&self, plaintext: &[u8], public_key: &DevicePublicKey) -> Result<Vec<u8>> {
        seal(plaintext, &public_key.0)
    }

    fn decrypt(&self, ciphertext: &[u8], private_key: &DeviceKey) -> Result<Vec<u8>> {
        open(ciphertext, &private_key.secret)
    }
}

/// ECIES: ephemeral X25519 agreement, HKDF-SHA256, AES-256-GCM.
/// Output layout is `ephemeral_public || nonce || ciphertext`.
fn seal(plaintext: &[u8], recipient: &PublicKey) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);

    let key = derive_key(shared.as_bytes(), &ephemeral_public, recipient)
        .map_err(|reason| KeystoreError::new(ErrorKind::EncryptFailed(reason)))?;
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|e| KeystoreError::new(ErrorKind::EncryptFailed(e.to_string())))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: HKDF_LABEL,
            },
        )
        .map_err(|e| KeystoreError::new(ErrorKind::EncryptFailed(e.to_string())))?;

    let mut out = Vec::with_capacity(KEY_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(sealed: &[u8], secret: &StaticSecret) -> Result<Vec<u8>> {
    if sealed.len() < KEY_LEN + NONCE_LEN + TAG_LEN {
        return Err(KeystoreError::new(ErrorKind::DecryptFailed(format!(
            "ciphertext too short: {} bytes",
            sealed.len()
        ))));
    }
    let (ephemeral_bytes, rest) = sealed.split_at(KEY_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let mut ephemeral = [0u8; KEY_LEN];
    ephemeral.copy_from_slice(ephemeral_bytes);
    let ephemeral_public = PublicKey::from(ephemeral);
    let shared = secret.diffie_hellman(&ephemeral_public);

    let key = derive_key(shared.as_bytes(), &ephemeral_public, &PublicKey::from(secret))
        .map_err(|reason| KeystoreError::new(ErrorKind::DecryptFailed(reason)))?;
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|e| KeystoreError::new(ErrorKind::DecryptFailed(e.to_string())))?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad: HKDF_LABEL,
            },
        )
        .map_err(|e| KeystoreError::new(ErrorKind::DecryptFailed(e.to_string())))
}

fn derive_key(
    shared_secret: &[u8; KEY_LEN],
    ephemeral_public: &PublicKey,
    recipient_public: &PublicKey,
) -> std::result::Result<Zeroizing<[u8; KEY_LEN]>, String> {
    let mut info = Vec::with_capacity(HKDF_LABEL.len() + 2 * KEY_LEN);
    info.extend_from_slice(HKDF_LABEL);
    info.extend_from_slice(ephemeral_public.as_bytes());
    info.extend_from_slice(recipient_public.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hkdf.expand(&info, key.as_mut_slice())
        .map_err(|e| format!("hkdf expand failed: {e}"))?;
    Ok(key)
}

fn decode_secret(tag: &str, bytes: &[u8]) -> Result<DeviceKey> {
    let raw: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
        debug!(tag, len = bytes.len(), "stored device key has wrong length");
        KeystoreError::new(ErrorKind::DecodeFailure)
    })?;
    Ok(DeviceKey {
        tag: tag.to_string(),
        secret: StaticSecret::from(raw),
    })
}

fn keyring_err(err: keyring::Error) -> KeystoreError {
    match err {
        keyring::Error::NoStorageAccess(_) | keyring::Error::PlatformFailure(_) => {
            debug!("keyring unavailable: {err}");
            KeystoreError::new(ErrorKind::BackendUnavailable)
        }
        other => {
            debug!("keyring failure: {other}");
            KeystoreError::new(ErrorKind::IoFailure)
        }
    }
}
