pub mod arkg;
pub mod ceremony;
pub mod container;
pub mod cose;
pub mod encapsulation;
pub mod envelope;
pub mod error;
pub mod jws;
pub mod kdf;
pub mod keystore;
pub mod passkey;
pub mod signer;
pub mod store;

pub use ceremony::{AutoConfirm, SignInteraction, SignPrompt, UserResponse};
pub use container::{
    ContainerShape, CredentialKeyPair, EncryptedContainer, PrivateData, PrivateKeyRef,
    UnlockMethodInfo,
};
pub use error::*;
pub use keystore::{KeyCustodyStore, KeystoreSettings, NoRetry, PrfRetryPrompt, UnlockedKeystore};
pub use passkey::{Authenticator, MockAuthenticator};
pub use signer::{CredentialSigner, Signer};
pub use store::{Commit, ContainerStore, InMemoryContainerStore, JsonFileContainerStore};
