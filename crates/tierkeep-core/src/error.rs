use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeystoreError>;

/// Failure kinds surfaced by the keystore, its backend, and the hardware key provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("function or operation not implemented")]
    NotImplemented,
    #[error("I/O error")]
    IoFailure,
    #[error("record already open with write permission")]
    AlreadyOpenForWrite,
    #[error("one or more parameters were not valid")]
    InvalidParameter,
    #[error("failed to allocate memory")]
    AllocationFailure,
    #[error("user canceled the operation")]
    UserCanceled,
    #[error("bad parameter or invalid state for operation")]
    BadRequest,
    #[error("secure storage backend is not available")]
    BackendUnavailable,
    #[error("the specified item already exists")]
    DuplicateItem,
    #[error("the specified item could not be found")]
    ItemNotFound,
    #[error("the specified attribute does not exist")]
    NoSuchAttribute,
    #[error("user interaction is not allowed")]
    InteractionNotAllowed,
    #[error("unable to decode the provided data")]
    DecodeFailure,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("stored record could not be converted")]
    DataConversionFailure,
    #[error("access control creation failed: {0}")]
    AccessControlCreationFailed(String),
    #[error("private key creation failed: {0}")]
    PrivateKeyCreationFailed(String),
    #[error("public key creation failed")]
    PublicKeyCreationFailed,
    #[error("algorithm not supported by key")]
    UnsupportedAlgorithm,
    #[error("hardware private key is missing")]
    MissingKeyMaterial,
    #[error("hardware encryption failed: {0}")]
    EncryptFailed(String),
    #[error("hardware decryption failed: {0}")]
    DecryptFailed(String),
    #[error("enumeration wait was cancelled")]
    Cancelled,
    #[error("enumeration wait of {required_ms}ms exceeds the configured maximum")]
    ThrottleWaitExceeded { required_ms: u64 },
    #[error("unknown backend status {0}")]
    UnknownBackendStatus(i32),
}

impl ErrorKind {
    /// Maps a platform secure-storage status code onto an error kind.
    pub fn from_status(status: i32) -> Self {
        match status {
            -4 => Self::NotImplemented,
            -36 => Self::IoFailure,
            -49 => Self::AlreadyOpenForWrite,
            -50 => Self::InvalidParameter,
            -108 => Self::AllocationFailure,
            -128 => Self::UserCanceled,
            -909 => Self::BadRequest,
            -25291 => Self::BackendUnavailable,
            -25293 => Self::AuthenticationFailed,
            -25299 => Self::DuplicateItem,
            -25300 => Self::ItemNotFound,
            -25303 => Self::NoSuchAttribute,
            -25308 => Self::InteractionNotAllowed,
            -26275 => Self::DecodeFailure,
            other => {
                tracing::debug!(status = other, "unmapped backend status");
                Self::UnknownBackendStatus(other)
            }
        }
    }
}

/// The `(service, key)` identity an error refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRef {
    pub service: String,
    pub key: String,
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service: {}, key: {}", self.service, self.key)
    }
}

/// Error returned by every keystore operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}{}", describe_context(.context))]
pub struct KeystoreError {
    pub kind: ErrorKind,
    pub context: Option<ItemRef>,
}

impl KeystoreError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }

    /// Attaches the offending identity unless a more specific one is already present.
    pub fn with_item(mut self, service: &str, key: &str) -> Self {
        if self.context.is_none() {
            self.context = Some(ItemRef {
                service: service.to_string(),
                key: key.to_string(),
            });
        }
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::ItemNotFound
    }
}

impl From<ErrorKind> for KeystoreError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

fn describe_context(context: &Option<ItemRef>) -> String {
    context
        .as_ref()
        .map(|item| format!(" ({item})"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_statuses() {
        assert_eq!(ErrorKind::from_status(-25300), ErrorKind::ItemNotFound);
        assert_eq!(ErrorKind::from_status(-25299), ErrorKind::DuplicateItem);
        assert_eq!(ErrorKind::from_status(-25303), ErrorKind::NoSuchAttribute);
        assert_eq!(ErrorKind::from_status(-4), ErrorKind::NotImplemented);
    }

    #[test]
    fn unknown_status_keeps_code() {
        assert_eq!(
            ErrorKind::from_status(-1),
            ErrorKind::UnknownBackendStatus(-1)
        );
    }

    #[test]
    fn display_includes_item_context() {
        let err = KeystoreError::new(ErrorKind::DuplicateItem).with_item("S", "u1");
        assert_eq!(
            err.to_string(),
            "the specified item already exists (service: S, key: u1)"
        );
    }

    #[test]
    fn first_context_wins() {
        let err = KeystoreError::new(ErrorKind::IoFailure)
            .with_item("S", "u1_backup")
            .with_item("S", "u1");
        assert_eq!(err.context.unwrap().key, "u1_backup");
    }
}
