use thiserror::Error;

/// Error type for the wallet root crate, aggregating errors from every
/// component crate.
#[derive(Debug, Error)]
pub enum RootError {
    #[error("keystore error: {0}")]
    Keystore(#[from] wallet_keystore::KeystoreError),

    #[error("openid4vp error: {0}")]
    OpenId4Vp(#[from] wallet_openid4vp::Oid4vpError),

    #[error("mdoc error: {0}")]
    Mdoc(#[from] wallet_mdoc::MdocError),

    #[error("core error: {0}")]
    Core(#[from] wallet_core::CoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RootError {
    fn from(e: serde_json::Error) -> Self {
        RootError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for RootError {
    fn from(e: toml::de::Error) -> Self {
        RootError::Config(format!("TOML parse error: {}", e))
    }
}

pub type RootResult<T> = Result<T, RootError>;
