use thiserror::Error;

#[derive(Debug, Error)]
pub enum MdocError {
    #[error("proximity transport is not available")]
    ProximityUnavailable,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("invalid session state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("canceled by user")]
    CanceledByUser,

    #[error("credential does not contain the requested elements")]
    InsufficientCredentials,

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("cbor error: {0}")]
    Cbor(String),

    #[error(transparent)]
    Keystore(#[from] wallet_keystore::KeystoreError),

    #[error(transparent)]
    Core(#[from] wallet_core::CoreError),
}

pub type MdocResult<T> = Result<T, MdocError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            MdocError::ProximityUnavailable.to_string(),
            "proximity transport is not available"
        );
        let err = MdocError::InvalidState {
            expected: "engaged",
            actual: "init",
        };
        assert_eq!(
            err.to_string(),
            "invalid session state: expected engaged, found init"
        );
    }

    #[test]
    fn test_keystore_error_is_transparent() {
        let err: MdocError = wallet_keystore::KeystoreError::CanceledByUser.into();
        assert_eq!(err.to_string(), "canceled by user");
    }
}
