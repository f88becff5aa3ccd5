//! KeyCustodyStore: unlock, migrate, rotate and extend the key container.
//!
//! Every mutating operation returns the new in-memory state together with a
//! [`Commit`]. Nothing reaches the [`ContainerStore`] until the caller applies
//! the commit, so a flow abandoned halfway leaves persisted state untouched.

use crate::arkg::{self, CREDENTIAL_INFO};
use crate::ceremony::SignInteraction;
use crate::container::{
    generate_main_key, ArkgSeed, CredentialKeyPair, EncryptedContainer, MainKey, PrfUnlock,
    PrivateData, PrivateKeyRef, UnlockMethodInfo,
};
use crate::cose::{ArkgDerivedKeyRef, ArkgPublicSeed};
use crate::encapsulation::{generate_secret_key, public_key_bytes, secret_key_bytes};
use crate::envelope;
use crate::error::{KeystoreError, KeystoreResult};
use crate::jws;
use crate::kdf::{self, KdfParams, Pbkdf2Params};
use crate::passkey::{AssertionRequest, Authenticator, PrfOutputs, RegistrationRequest};
use crate::signer::{CredentialSigner, ALG_ES256};
use crate::store::{Commit, ContainerStore};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use wallet_core::{did_key_from_jwk, Cancellation, DidKeyVersion, EcJwk, Kid, Timestamp};
use zeroize::Zeroizing;

pub const DEFAULT_MAX_ROTATION_ATTEMPTS: u32 = 3;

/// Asked when an authenticator returned no PRF output although it may support PRF.
#[async_trait]
pub trait PrfRetryPrompt: Send + Sync {
    async fn confirm_retry(&self) -> bool;
}

/// Never retries.
pub struct NoRetry;

#[async_trait]
impl PrfRetryPrompt for NoRetry {
    async fn confirm_retry(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct KeystoreSettings {
    pub rp_id: String,
    pub kdf: KdfParams,
    pub did_key_version: DidKeyVersion,
    pub max_rotation_attempts: u32,
}

impl Default for KeystoreSettings {
    fn default() -> Self {
        Self {
            rp_id: "localhost".to_string(),
            kdf: KdfParams::default(),
            did_key_version: DidKeyVersion::default(),
            max_rotation_attempts: DEFAULT_MAX_ROTATION_ATTEMPTS,
        }
    }
}

// ---------------------------------------------------------------------------
// UnlockedKeystore: plaintext state held in memory after unlock
// ---------------------------------------------------------------------------

pub struct UnlockedKeystore {
    main_key: MainKey,
    private_data: PrivateData,
    container: EncryptedContainer,
    version: u64,
}

impl std::fmt::Debug for UnlockedKeystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockedKeystore")
            .field("keypairs", &self.private_data.keypairs.len())
            .field("arkg_seeds", &self.private_data.arkg_seeds.len())
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl UnlockedKeystore {
    pub fn private_data(&self) -> &PrivateData {
        &self.private_data
    }

    pub fn container(&self) -> &EncryptedContainer {
        &self.container
    }

    /// Store version this state corresponds to once its pending commit (if any) lands.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn kids(&self) -> Vec<Kid> {
        self.private_data.keypairs.keys().cloned().collect()
    }

    pub fn keypair(&self, kid: &Kid) -> KeystoreResult<&CredentialKeyPair> {
        self.private_data.keypair(kid)
    }

    pub fn unlock_methods(&self) -> Vec<UnlockMethodInfo> {
        self.container.unlock_methods()
    }

    /// Same keys, replaced container. The payload ciphertext is not touched.
    fn with_container(&self, container: EncryptedContainer) -> Self {
        Self {
            main_key: self.main_key.clone(),
            private_data: self.private_data.clone(),
            container,
            version: self.version + 1,
        }
    }

    fn commit_for(&self, next: &UnlockedKeystore) -> Commit {
        Commit::new(self.version, next.container.clone())
    }
}

// ---------------------------------------------------------------------------
// KeyCustodyStore
// ---------------------------------------------------------------------------

pub struct KeyCustodyStore {
    store: Arc<dyn ContainerStore>,
    authenticator: Arc<dyn Authenticator>,
    settings: KeystoreSettings,
    cancellation: Cancellation,
}

impl KeyCustodyStore {
    pub fn new(
        store: Arc<dyn ContainerStore>,
        authenticator: Arc<dyn Authenticator>,
        settings: KeystoreSettings,
    ) -> Self {
        Self {
            store,
            authenticator,
            settings,
            cancellation: Cancellation::new(),
        }
    }

    /// Use `cancellation` to abort pending authenticator ceremonies.
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn settings(&self) -> &KeystoreSettings {
        &self.settings
    }

    pub fn store(&self) -> &dyn ContainerStore {
        self.store.as_ref()
    }

    /// Signer over the credential keys of `unlocked`.
    pub fn signer(
        &self,
        unlocked: &UnlockedKeystore,
        interaction: Arc<dyn SignInteraction>,
    ) -> CredentialSigner {
        CredentialSigner::new(
            unlocked.main_key.clone(),
            unlocked.private_data.keypairs.clone(),
            self.authenticator.clone(),
            interaction,
            self.settings.rp_id.clone(),
            self.cancellation.clone(),
        )
    }

    pub async fn load(&self) -> KeystoreResult<(u64, EncryptedContainer)> {
        let stored = self
            .store
            .load()
            .await?
            .ok_or(KeystoreError::ContainerMissing)?;
        Ok((stored.version, stored.value))
    }

    pub async fn unlock_methods(&self) -> KeystoreResult<Vec<UnlockMethodInfo>> {
        Ok(self.load().await?.1.unlock_methods())
    }

    async fn ceremony<T, F>(&self, fut: F) -> KeystoreResult<T>
    where
        F: Future<Output = KeystoreResult<T>> + Send,
    {
        self.cancellation
            .run(fut)
            .await
            .ok_or(KeystoreError::CanceledByUser)?
    }

    // -- password ----------------------------------------------------------

    async fn password_key(
        &self,
        password: &str,
        params: &Pbkdf2Params,
    ) -> KeystoreResult<Zeroizing<[u8; 32]>> {
        let password = Zeroizing::new(password.to_string());
        let params = params.clone();
        tokio::task::spawn_blocking(move || kdf::derive_password_key(&password, &params))
            .await
            .map_err(|e| KeystoreError::KeyDerivation(format!("pbkdf2 task failed: {}", e)))
    }

    /// Create a new container protected by a password.
    ///
    /// The commit expects an empty store and fails with `StaleContainer` if a
    /// container already exists.
    pub async fn init_password(&self, password: &str) -> KeystoreResult<(UnlockedKeystore, Commit)> {
        let main_key = generate_main_key();
        let private_data = PrivateData::default();
        let mut container = EncryptedContainer::new(&main_key, &private_data)?;

        let params = self.settings.kdf.new_pbkdf2_params();
        let base_key = self.password_key(password, &params).await?;
        let wrapped = container.wrap_for_method(&base_key, &main_key)?;
        container.set_password(params, wrapped);

        tracing::info!("key container initialized with password");
        let unlocked = UnlockedKeystore {
            main_key,
            private_data,
            container: container.clone(),
            version: 1,
        };
        Ok((unlocked, Commit::new(0, container)))
    }

    /// Unlock with the password. Returns a commit when the password method
    /// was migrated to asymmetric wrapping as part of the unlock.
    pub async fn unlock_password(
        &self,
        password: &str,
    ) -> KeystoreResult<(UnlockedKeystore, Option<Commit>)> {
        let (version, container) = self.load().await?;
        let method = container
            .password
            .as_ref()
            .ok_or_else(|| KeystoreError::UnlockMethodNotFound("password".into()))?;

        let base_key = self.password_key(password, &method.pbkdf2).await?;
        let main_key = container
            .unwrap_main_key(&method.main_key, &base_key)
            .map_err(|e| {
                tracing::warn!("password unlock failed");
                match e {
                    KeystoreError::ContainerCorrupted(_) => e,
                    _ => KeystoreError::UnlockFailed("wrong password".into()),
                }
            })?;
        let private_data = container.open(&main_key)?;

        let mut migrated = container.clone();
        let commit = if migrated.migrate_password(&base_key, &main_key)? {
            tracing::info!("password unlock method migrated to asymmetric encapsulation");
            Some(Commit::new(version, migrated.clone()))
        } else {
            None
        };
        let version = if commit.is_some() { version + 1 } else { version };
        Ok((
            UnlockedKeystore {
                main_key,
                private_data,
                container: if commit.is_some() { migrated } else { container },
                version,
            },
            commit,
        ))
    }

    /// Add or replace the password method.
    pub async fn add_password(
        &self,
        unlocked: &UnlockedKeystore,
        password: &str,
    ) -> KeystoreResult<(UnlockedKeystore, Commit)> {
        let mut container = unlocked.container.clone();
        let params = self.settings.kdf.new_pbkdf2_params();
        let base_key = self.password_key(password, &params).await?;
        let wrapped = container.wrap_for_method(&base_key, &unlocked.main_key)?;
        container.set_password(params, wrapped);

        let next = unlocked.with_container(container);
        let commit = unlocked.commit_for(&next);
        Ok((next, commit))
    }

    pub fn remove_password(
        &self,
        unlocked: &UnlockedKeystore,
    ) -> KeystoreResult<(UnlockedKeystore, Commit)> {
        let mut container = unlocked.container.clone();
        container.remove_password()?;
        let next = unlocked.with_container(container);
        let commit = unlocked.commit_for(&next);
        Ok((next, commit))
    }

    // -- PRF ---------------------------------------------------------------

    /// Resolve the PRF output, re-asking the same credential once if allowed.
    async fn prf_output(
        &self,
        credential_id: &[u8],
        prf_salt: &[u8],
        initial: PrfOutputs,
        prompt: &dyn PrfRetryPrompt,
    ) -> KeystoreResult<Zeroizing<Vec<u8>>> {
        let mut outputs = initial;
        let mut retried = false;
        loop {
            if let Some(first) = outputs.first.take() {
                return Ok(Zeroizing::new(first));
            }
            if outputs.enabled == Some(false) {
                tracing::warn!("authenticator reports PRF unsupported");
                return Err(KeystoreError::PrfUnsupported);
            }
            if retried || !prompt.confirm_retry().await {
                return Err(KeystoreError::CanceledByUser);
            }
            retried = true;

            let mut request = AssertionRequest::new(self.settings.rp_id.clone());
            request.allow_credentials = vec![credential_id.to_vec()];
            request
                .prf_eval_by_credential
                .insert(credential_id.to_vec(), prf_salt.to_vec());
            tracing::debug!("retrying assertion for PRF output");
            outputs = self.ceremony(self.authenticator.get(request)).await?.prf;
        }
    }

    /// Register an authenticator credential and build its PRF unlock entry.
    /// An ARKG seed returned by the registration is added to `data`.
    async fn register_prf(
        &self,
        container: &mut EncryptedContainer,
        main_key: &MainKey,
        data: &mut PrivateData,
        user_handle: &[u8],
        user_name: &str,
        prompt: &dyn PrfRetryPrompt,
    ) -> KeystoreResult<Vec<u8>> {
        let prf_salt = kdf::random_salt().to_vec();
        let registration = self
            .ceremony(self.authenticator.create(RegistrationRequest {
                rp_id: self.settings.rp_id.clone(),
                user_handle: user_handle.to_vec(),
                user_name: user_name.to_string(),
                prf_salt: prf_salt.clone(),
                generate_arkg_seed: data.arkg_seeds.is_empty(),
            }))
            .await?;

        let output = self
            .prf_output(&registration.credential_id, &prf_salt, registration.prf, prompt)
            .await?;
        let hkdf_salt = kdf::random_salt().to_vec();
        let hkdf_info = self.settings.kdf.prf_hkdf_info().to_vec();
        let base_key = kdf::derive_prf_key(&output, &hkdf_salt, &hkdf_info)?;
        let wrapped = container.wrap_for_method(&base_key, main_key)?;

        container.add_prf(PrfUnlock {
            credential_id: registration.credential_id.clone(),
            transports: registration.transports,
            prf_salt,
            hkdf_salt,
            hkdf_info,
            main_key: wrapped,
        });

        if let Some(seed_bytes) = registration.arkg_seed {
            data.add_arkg_seed(ArkgSeed {
                credential_id: registration.credential_id.clone(),
                public_seed: ArkgPublicSeed::from_cose_bytes(&seed_bytes)?,
            })?;
            tracing::info!("ARKG seed registered");
        }
        Ok(registration.credential_id)
    }

    /// Create a new container protected by a freshly registered authenticator.
    pub async fn init_prf(
        &self,
        user_handle: &[u8],
        user_name: &str,
        prompt: &dyn PrfRetryPrompt,
    ) -> KeystoreResult<(UnlockedKeystore, Commit)> {
        let main_key = generate_main_key();
        let mut private_data = PrivateData::default();
        let mut container = EncryptedContainer::new(&main_key, &private_data)?;
        self.register_prf(
            &mut container,
            &main_key,
            &mut private_data,
            user_handle,
            user_name,
            prompt,
        )
        .await?;
        container.reseal(&main_key, &private_data)?;

        tracing::info!("key container initialized with PRF credential");
        let unlocked = UnlockedKeystore {
            main_key,
            private_data,
            container: container.clone(),
            version: 1,
        };
        Ok((unlocked, Commit::new(0, container)))
    }

    /// Unlock with any registered PRF credential.
    pub async fn unlock_prf(
        &self,
        prompt: &dyn PrfRetryPrompt,
    ) -> KeystoreResult<(UnlockedKeystore, Option<Commit>)> {
        let (version, container) = self.load().await?;
        let inputs = container.prf_assertion_inputs();
        if inputs.is_empty() {
            return Err(KeystoreError::UnlockMethodNotFound("prf".into()));
        }

        let mut request = AssertionRequest::new(self.settings.rp_id.clone());
        for input in &inputs {
            request.allow_credentials.push(input.credential_id.clone());
            request
                .prf_eval_by_credential
                .insert(input.credential_id.clone(), input.prf_salt.clone());
        }
        let assertion = self.ceremony(self.authenticator.get(request)).await?;
        let method = container
            .find_prf(&assertion.credential_id)
            .ok_or_else(|| {
                KeystoreError::UnlockMethodNotFound(wallet_core::b64u_encode(
                    &assertion.credential_id,
                ))
            })?
            .clone();

        let output = self
            .prf_output(&method.credential_id, &method.prf_salt, assertion.prf, prompt)
            .await?;
        let base_key = kdf::derive_prf_key(&output, &method.hkdf_salt, &method.hkdf_info)?;
        let main_key = container
            .unwrap_main_key(&method.main_key, &base_key)
            .map_err(|e| match e {
                KeystoreError::ContainerCorrupted(_) => e,
                _ => KeystoreError::UnlockFailed("PRF key did not unwrap the main key".into()),
            })?;
        let private_data = container.open(&main_key)?;

        let mut migrated = container.clone();
        let commit = if migrated.migrate_prf(&method.credential_id, &base_key, &main_key)? {
            tracing::info!("PRF unlock method migrated to asymmetric encapsulation");
            Some(Commit::new(version, migrated.clone()))
        } else {
            None
        };
        let version = if commit.is_some() { version + 1 } else { version };
        Ok((
            UnlockedKeystore {
                main_key,
                private_data,
                container: if commit.is_some() { migrated } else { container },
                version,
            },
            commit,
        ))
    }

    /// Register another authenticator as an unlock method.
    ///
    /// When the authenticator also returns the first ARKG seed, the payload
    /// changes and the container is re-sealed under the same main key.
    pub async fn add_prf(
        &self,
        unlocked: &UnlockedKeystore,
        user_handle: &[u8],
        user_name: &str,
        prompt: &dyn PrfRetryPrompt,
    ) -> KeystoreResult<(UnlockedKeystore, Commit, Vec<u8>)> {
        let mut container = unlocked.container.clone();
        let mut private_data = unlocked.private_data.clone();
        let credential_id = self
            .register_prf(
                &mut container,
                &unlocked.main_key,
                &mut private_data,
                user_handle,
                user_name,
                prompt,
            )
            .await?;
        if private_data != unlocked.private_data {
            container.reseal(&unlocked.main_key, &private_data)?;
        }
        let mut next = unlocked.with_container(container);
        next.private_data = private_data;
        let commit = unlocked.commit_for(&next);
        Ok((next, commit, credential_id))
    }

    pub fn remove_prf(
        &self,
        unlocked: &UnlockedKeystore,
        credential_id: &[u8],
    ) -> KeystoreResult<(UnlockedKeystore, Commit)> {
        let mut container = unlocked.container.clone();
        container.remove_prf(credential_id)?;
        let next = unlocked.with_container(container);
        let commit = unlocked.commit_for(&next);
        Ok((next, commit))
    }

    // -- rotation ----------------------------------------------------------

    /// Re-key everything after applying `mutate` to the payload.
    ///
    /// `mutate` receives the current main key so it can wrap new local keys;
    /// they are rewrapped under the new main key with everything else.
    pub fn rotate<T, F>(
        &self,
        unlocked: &UnlockedKeystore,
        mut mutate: F,
    ) -> KeystoreResult<(UnlockedKeystore, Commit, T)>
    where
        F: FnMut(&mut PrivateData, &MainKey) -> KeystoreResult<T>,
    {
        let mut data = unlocked.container.open(&unlocked.main_key)?;
        let output = mutate(&mut data, &unlocked.main_key)?;
        let (container, main_key, private_data) =
            unlocked.container.rekey(&unlocked.main_key, data)?;
        tracing::info!(
            keypairs = private_data.keypairs.len(),
            "key container rotated"
        );
        let next = UnlockedKeystore {
            main_key,
            private_data,
            container,
            version: unlocked.version + 1,
        };
        let commit = unlocked.commit_for(&next);
        Ok((next, commit, output))
    }

    /// Rotate against the latest stored container and commit, retrying on
    /// concurrent writes.
    ///
    /// The stored container must still open under `unlocked`'s main key;
    /// if another writer rotated in between, this fails with `StaleContainer`
    /// and the caller must unlock again.
    pub async fn rotate_latest<T, F>(
        &self,
        unlocked: &UnlockedKeystore,
        mut mutate: F,
    ) -> KeystoreResult<(UnlockedKeystore, T)>
    where
        F: FnMut(&mut PrivateData, &MainKey) -> KeystoreResult<T>,
    {
        for attempt in 0..self.settings.max_rotation_attempts.max(1) {
            let (version, container) = self.load().await?;
            let private_data = container
                .open(&unlocked.main_key)
                .map_err(|_| KeystoreError::StaleContainer)?;
            let current = UnlockedKeystore {
                main_key: unlocked.main_key.clone(),
                private_data,
                container,
                version,
            };
            let (next, commit, output) = self.rotate(&current, &mut mutate)?;
            match commit.apply(self.store.as_ref()).await {
                Ok(_) => return Ok((next, output)),
                Err(KeystoreError::StaleContainer) => {
                    tracing::debug!(attempt, "rotation raced a concurrent write, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(KeystoreError::StaleContainer)
    }

    // -- credential keys ---------------------------------------------------

    fn new_credential_keypair(
        &self,
        data: &PrivateData,
        main_key: &MainKey,
    ) -> KeystoreResult<CredentialKeyPair> {
        let (public_sec1, private_key) = match data.arkg_seed()? {
            Some(seed) => {
                let derived = arkg::derive_public_key(&seed.public_seed, CREDENTIAL_INFO)?;
                let key_ref = ArkgDerivedKeyRef {
                    kid: seed.public_seed.kid.clone().unwrap_or_default(),
                    key_handle: derived.key_handle.clone(),
                    info: CREDENTIAL_INFO.to_vec(),
                };
                (
                    derived.sec1_uncompressed(),
                    PrivateKeyRef::External {
                        credential_id: seed.credential_id.clone(),
                        key_ref: key_ref.encode()?,
                    },
                )
            }
            None => {
                let secret = generate_secret_key();
                (
                    public_key_bytes(&secret),
                    PrivateKeyRef::Wrapped {
                        envelope: envelope::encrypt(main_key, &*secret_key_bytes(&secret))?,
                    },
                )
            }
        };
        let public_key = EcJwk::from_sec1_uncompressed(&public_sec1)?;
        let kid = public_key.thumbprint();
        let did = did_key_from_jwk(&public_key, self.settings.did_key_version)?;
        tracing::debug!(kid = %kid, arkg = matches!(private_key, PrivateKeyRef::External { .. }), "credential key generated");
        Ok(CredentialKeyPair {
            kid,
            did,
            alg: ALG_ES256.to_string(),
            public_key,
            private_key,
        })
    }

    /// Generate `count` credential keypairs, ARKG-derived when a seed is registered.
    pub fn generate_credential_keypairs(
        &self,
        unlocked: &UnlockedKeystore,
        count: usize,
    ) -> KeystoreResult<(UnlockedKeystore, Commit, Vec<Kid>)> {
        self.rotate(unlocked, |data, main_key| {
            let mut kids = Vec::with_capacity(count);
            for _ in 0..count {
                let keypair = self.new_credential_keypair(data, main_key)?;
                kids.push(keypair.kid.clone());
                data.insert_keypair(keypair);
            }
            Ok(kids)
        })
    }

    /// Generate `count` keys and one `openid4vci-proof+jwt` per key.
    /// Hardware signatures are requested one after another.
    pub async fn generate_openid4vci_proofs(
        &self,
        unlocked: &UnlockedKeystore,
        interaction: Arc<dyn SignInteraction>,
        nonce: &str,
        audience: &str,
        issuer: &str,
        count: usize,
    ) -> KeystoreResult<(UnlockedKeystore, Commit, Vec<String>)> {
        let (next, commit, kids) = self.generate_credential_keypairs(unlocked, count)?;
        let signer = self.signer(&next, interaction);
        let issued_at = Timestamp::now().seconds_since_epoch as i64;
        let mut proofs = Vec::with_capacity(kids.len());
        for kid in &kids {
            proofs.push(jws::openid4vci_proof(&signer, kid, nonce, audience, issuer, issued_at).await?);
        }
        Ok((next, commit, proofs))
    }

    /// Register an ARKG seed obtained outside of PRF registration.
    pub fn add_arkg_seed(
        &self,
        unlocked: &UnlockedKeystore,
        credential_id: &[u8],
        cose_seed: &[u8],
    ) -> KeystoreResult<(UnlockedKeystore, Commit)> {
        let public_seed = ArkgPublicSeed::from_cose_bytes(cose_seed)?;
        let (next, commit, ()) = self.rotate(unlocked, |data, _| {
            data.add_arkg_seed(ArkgSeed {
                credential_id: credential_id.to_vec(),
                public_seed: public_seed.clone(),
            })
        })?;
        Ok((next, commit))
    }

    /// Kid of the key an SD-JWT credential is bound to, if this keystore holds it.
    pub fn kid_for_sd_jwt(
        &self,
        unlocked: &UnlockedKeystore,
        sd_jwt: &str,
    ) -> KeystoreResult<Kid> {
        let kid = jws::kid_from_sd_jwt_cnf(sd_jwt)?;
        unlocked.keypair(&kid)?;
        Ok(kid)
    }
}
