use crate::error::Result;

/// Hardware-backed asymmetric key capability.
///
/// The private half never leaves the provider; callers only hold opaque handles.
/// Generation is expected to be idempotent per tag: asking for a key that already
/// exists either returns it or fails with `DuplicateItem`.
pub trait HardwareKeyProvider: Send + Sync {
    /// Opaque reference to a non-exportable private key.
    type PrivateKey: Send + Sync;
    /// Public half derived from a private key.
    type PublicKey: Send + Sync;

    fn generate_key_pair(&self, tag: &str) -> Result<Self::PrivateKey>;

    /// `Ok(None)` when no key exists under `tag`.
    fn fetch_private_key(&self, tag: &str) -> Result<Option<Self::PrivateKey>>;

    fn derive_public_key(&self, private_key: &Self::PrivateKey) -> Option<Self::PublicKey>;

    fn encrypt(&self, plaintext: &[u8], public_key: &Self::PublicKey) -> Result<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8], private_key: &Self::PrivateKey) -> Result<Vec<u8>>;
}
