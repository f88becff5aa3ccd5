//! Wallet Root Library
//!
//! Configuration, error handling and the orchestration layer that ties the
//! key custody store, OpenID4VP presentation and mdoc proximity sessions to
//! a file-backed key container and a real HTTP client.
//!
//! # Architecture
//!
//! The root crate is a thin orchestrator. [`Wallet`] owns the key custody
//! store for the configured container file and hands out presentation
//! handlers and proximity sessions configured from [`WalletConfig`]. Every
//! container mutation is committed here, right after the keystore returns it.

pub mod config;
pub mod error;
pub mod http;

pub use config::{KeystoreConfig, LoggingConfig, MdocConfig, OpenId4VpConfig, WalletConfig};
pub use error::{RootError, RootResult};
pub use http::ReqwestHttpClient;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use wallet_core::{CredentialId, CredentialStore, HttpClient, Kid};
use wallet_keystore::passkey::{
    AssertionRequest, AssertionResponse, RegistrationRequest, RegistrationResponse,
};
use wallet_keystore::{
    AutoConfirm, Authenticator, CredentialSigner, JsonFileContainerStore, KeyCustodyStore,
    KeystoreError, KeystoreResult, KeystoreSettings, UnlockedKeystore,
};
use wallet_mdoc::{MdocProximitySession, ProximityTransport};
use wallet_openid4vp::{
    AuthorizationMatch, HelperTlsCertificateSource, OpenId4VpHandler, ResponseOutcome,
};

// ---------------------------------------------------------------------------
// NoPlatformAuthenticator: hosts without WebAuthn
// ---------------------------------------------------------------------------

/// Authenticator for hosts with no platform credential API. Only password
/// unlock and locally wrapped keys work behind it.
pub struct NoPlatformAuthenticator;

#[async_trait]
impl Authenticator for NoPlatformAuthenticator {
    async fn create(&self, _request: RegistrationRequest) -> KeystoreResult<RegistrationResponse> {
        Err(KeystoreError::Authenticator(
            "no platform authenticator available".into(),
        ))
    }

    async fn get(&self, _request: AssertionRequest) -> KeystoreResult<AssertionResponse> {
        Err(KeystoreError::Authenticator(
            "no platform authenticator available".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

pub struct Wallet {
    config: WalletConfig,
    store: Arc<JsonFileContainerStore>,
    keystore: KeyCustodyStore,
}

impl Wallet {
    /// Open the container named by `config` with the configured KDF settings.
    pub fn open(config: WalletConfig) -> RootResult<Self> {
        config.validate()?;
        let settings = config.keystore_settings()?;
        Ok(Self::with_parts(
            config,
            settings,
            Arc::new(NoPlatformAuthenticator),
        ))
    }

    /// Open with explicit keystore settings and authenticator.
    pub fn with_parts(
        config: WalletConfig,
        settings: KeystoreSettings,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let store = Arc::new(JsonFileContainerStore::new(
            config.keystore.container_path.clone(),
        ));
        let keystore = KeyCustodyStore::new(store.clone(), authenticator, settings);
        Self {
            config,
            store,
            keystore,
        }
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn keystore(&self) -> &KeyCustodyStore {
        &self.keystore
    }

    // -- key custody -------------------------------------------------------

    pub async fn init_password(&self, password: &str) -> RootResult<()> {
        let (_, commit) = self.keystore.init_password(password).await?;
        let version = commit.apply(self.store.as_ref()).await?;
        info!(
            path = %self.config.keystore.container_path.display(),
            version,
            "key container created"
        );
        Ok(())
    }

    /// Unlock with the password, persisting any unlock-method migration.
    pub async fn unlock(&self, password: &str) -> RootResult<UnlockedKeystore> {
        let (unlocked, migration) = self.keystore.unlock_password(password).await?;
        if let Some(commit) = migration {
            commit.apply(self.store.as_ref()).await?;
        }
        Ok(unlocked)
    }

    pub async fn new_keys(&self, password: &str, count: usize) -> RootResult<Vec<Kid>> {
        let unlocked = self.unlock(password).await?;
        let (_, commit, kids) = self.keystore.generate_credential_keypairs(&unlocked, count)?;
        commit.apply(self.store.as_ref()).await?;
        Ok(kids)
    }

    /// Re-key the container under a fresh main key. Returns the number of
    /// credential keys carried over.
    pub async fn rotate(&self, password: &str) -> RootResult<usize> {
        let unlocked = self.unlock(password).await?;
        let (next, ()) = self.keystore.rotate_latest(&unlocked, |_, _| Ok(())).await?;
        Ok(next.kids().len())
    }

    pub async fn openid4vci_proofs(
        &self,
        password: &str,
        nonce: &str,
        audience: &str,
        issuer: &str,
        count: usize,
    ) -> RootResult<Vec<String>> {
        let unlocked = self.unlock(password).await?;
        let (_, commit, proofs) = self
            .keystore
            .generate_openid4vci_proofs(&unlocked, Arc::new(AutoConfirm), nonce, audience, issuer, count)
            .await?;
        commit.apply(self.store.as_ref()).await?;
        Ok(proofs)
    }

    pub fn signer(&self, unlocked: &UnlockedKeystore) -> CredentialSigner {
        self.keystore.signer(unlocked, Arc::new(AutoConfirm))
    }

    // -- presentation ------------------------------------------------------

    /// OpenID4VP handler with the configured trust policy.
    pub fn presentation_handler(
        &self,
        http: Arc<dyn HttpClient>,
        credentials: Arc<dyn CredentialStore>,
    ) -> OpenId4VpHandler {
        let mut handler = OpenId4VpHandler::new(http.clone(), credentials)
            .with_policy(self.config.trust_policy());
        if let Some(helper) = &self.config.openid4vp.tls_cert_helper_url {
            handler = handler.with_tls_source(Arc::new(HelperTlsCertificateSource::new(
                http,
                helper.clone(),
            )));
        }
        handler
    }

    /// Answer the authorization request at `url` with `credential`, or the
    /// first conformant credential when none is named.
    pub async fn present(
        &self,
        password: &str,
        url: &str,
        credential: Option<CredentialId>,
        http: Arc<dyn HttpClient>,
        credentials: Arc<dyn CredentialStore>,
    ) -> RootResult<(AuthorizationMatch, ResponseOutcome)> {
        let handler = self.presentation_handler(http, credentials);
        let matched = handler.handle_authorization_request(url).await?;
        let chosen = match credential {
            Some(id) => id,
            None => matched
                .descriptor
                .credential_ids
                .first()
                .cloned()
                .ok_or(wallet_openid4vp::Oid4vpError::InsufficientCredentials)?,
        };
        let unlocked = self.unlock(password).await?;
        let signer = self.signer(&unlocked);
        let selection = BTreeMap::from([(matched.descriptor.descriptor_id.clone(), chosen)]);
        let outcome = handler.send_authorization_response(&selection, &signer).await?;
        Ok((matched, outcome))
    }

    /// A proximity session over `transport` with the configured mdoc settings.
    pub fn proximity_session(&self, transport: Arc<dyn ProximityTransport>) -> MdocProximitySession {
        MdocProximitySession::new(transport, self.config.mdoc_settings())
    }
}
