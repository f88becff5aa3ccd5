use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeystoreError {
    /// Wrong password or PRF output: the main key could not be recovered.
    #[error("unlock failed: {0}")]
    UnlockFailed(String),

    #[error("browser or authenticator does not support PRF")]
    PrfUnsupported,

    #[error("canceled by user")]
    CanceledByUser,

    #[error("container corrupted: {0}")]
    ContainerCorrupted(String),

    #[error("container changed since it was read")]
    StaleContainer,

    #[error("container is not fully migrated to asymmetric encapsulation")]
    MigrationRequired,

    #[error("no key container exists")]
    ContainerMissing,

    #[error("unlock method not found: {0}")]
    UnlockMethodNotFound(String),

    #[error("cannot remove the last unlock method")]
    LastUnlockMethod,

    #[error("no ARKG seed registered")]
    ArkgSeedAbsent,

    #[error("more than one ARKG seed is not supported")]
    ArkgSeedAlreadyPresent,

    #[error("key pair not found for kid: {0}")]
    KeyNotFound(String),

    #[error("signature not found in authenticator output")]
    SignatureNotFound,

    #[error("authenticator error: {0}")]
    Authenticator(String),

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption error: {0}")]
    Decryption(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("cose error: {0}")]
    Cose(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Core(#[from] wallet_core::CoreError),
}

impl From<serde_json::Error> for KeystoreError {
    fn from(e: serde_json::Error) -> Self {
        KeystoreError::Serialization(e.to_string())
    }
}

impl From<p256::elliptic_curve::Error> for KeystoreError {
    fn from(e: p256::elliptic_curve::Error) -> Self {
        KeystoreError::InvalidKey(e.to_string())
    }
}

pub type KeystoreResult<T> = Result<T, KeystoreError>;
