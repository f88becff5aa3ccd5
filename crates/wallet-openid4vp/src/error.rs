use thiserror::Error;

#[derive(Debug, Error)]
pub enum Oid4vpError {
    /// Signature, hostname, SAN or TLS pin check failed for the verifier.
    #[error("verifier is not trusted: {0}")]
    NontrustedVerifier(String),

    #[error("authorization request has no presentation definition")]
    MissingPresentationDefinition,

    #[error("only one input descriptor is supported")]
    OnlyOneInputDescriptorSupported,

    #[error("no stored credential satisfies the request")]
    InsufficientCredentials,

    #[error("nonce was already used by a previous flow")]
    NonceReplay,

    #[error("no active presentation flow")]
    NoActiveFlow,

    /// A later authorization request replaced this one while it was in progress.
    #[error("authorization request superseded by a newer one")]
    Superseded,

    #[error("invalid authorization request: {0}")]
    InvalidRequest(String),

    #[error("credential not selectable: {0}")]
    InvalidSelection(String),

    #[error("sd-jwt error: {0}")]
    SdJwt(String),

    #[error("unsupported response encryption: {0}")]
    UnsupportedEncryption(String),

    #[error("jwe error: {0}")]
    Jwe(String),

    #[error("tls certificate lookup failed: {0}")]
    TlsCertificate(String),

    #[error(transparent)]
    Keystore(#[from] wallet_keystore::KeystoreError),

    #[error(transparent)]
    Mdoc(#[from] wallet_mdoc::MdocError),

    #[error(transparent)]
    Core(#[from] wallet_core::CoreError),
}

impl From<serde_json::Error> for Oid4vpError {
    fn from(e: serde_json::Error) -> Self {
        Oid4vpError::Core(e.into())
    }
}

pub type Oid4vpResult<T> = Result<T, Oid4vpError>;
