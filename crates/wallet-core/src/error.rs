use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("credential store error: {0}")]
    CredentialStore(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("http status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
