//! The persisted key container and its plaintext payload.
//!
//! Layering, outermost first:
//!
//! - each unlock method (password or PRF credential) derives a 256-bit base key
//! - the base key recovers the main key, either directly by AES-KW (legacy
//!   `Symmetric` shape) or through the method's static keypair and the
//!   container's ephemeral public key (`Asymmetric` shape)
//! - the main key AES-GCM-encrypts `PrivateData` and every locally held
//!   credential private key
//!
//! All operations here are pure value transformations. Persisting the result
//! is the caller's job, through [`crate::store::Commit`].

use crate::cose::ArkgPublicSeed;
use crate::encapsulation::{
    decapsulate, encapsulate, generate_secret_key, generate_static_keypair, kw_unwrap,
    public_key_bytes, unwrap_static_private_key, StaticKeypair,
};
use crate::envelope::{self, EncryptedEnvelope};
use crate::error::{KeystoreError, KeystoreResult};
use crate::kdf::Pbkdf2Params;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use wallet_core::{EcJwk, Kid};
use zeroize::Zeroizing;

pub type MainKey = Zeroizing<[u8; 32]>;

pub fn generate_main_key() -> MainKey {
    let mut key = Zeroizing::new([0u8; 32]);
    rand::rngs::OsRng.fill_bytes(&mut *key);
    key
}

// ---------------------------------------------------------------------------
// Persisted shape
// ---------------------------------------------------------------------------

/// How one unlock method protects the main key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WrappedMainKey {
    /// Legacy: the derived key AES-KW-wraps the main key directly.
    Symmetric {
        #[serde(rename = "wrappedKey", with = "wallet_core::b64u_bytes")]
        wrapped_key: Vec<u8>,
    },
    /// The derived key wraps a static private key; ECDH between that key and
    /// the container's ephemeral public key yields the AES-KW key.
    Asymmetric {
        keypair: StaticKeypair,
        #[serde(rename = "wrappedKey", with = "wallet_core::b64u_bytes")]
        wrapped_key: Vec<u8>,
    },
}

impl WrappedMainKey {
    pub fn is_asymmetric(&self) -> bool {
        matches!(self, WrappedMainKey::Asymmetric { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MainKeyEncapsulation {
    /// Ephemeral public key of the current main-key generation, uncompressed SEC1.
    #[serde(with = "wallet_core::b64u_bytes")]
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordUnlock {
    pub pbkdf2: Pbkdf2Params,
    pub main_key: WrappedMainKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrfUnlock {
    #[serde(with = "wallet_core::b64u_bytes")]
    pub credential_id: Vec<u8>,
    #[serde(default)]
    pub transports: Vec<String>,
    /// Salt sent to the authenticator's PRF evaluation.
    #[serde(with = "wallet_core::b64u_bytes")]
    pub prf_salt: Vec<u8>,
    #[serde(with = "wallet_core::b64u_bytes")]
    pub hkdf_salt: Vec<u8>,
    #[serde(with = "wallet_core::b64u_bytes")]
    pub hkdf_info: Vec<u8>,
    pub main_key: WrappedMainKey,
}

/// Persisted key container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedContainer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_key: Option<MainKeyEncapsulation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<PasswordUnlock>,
    #[serde(default)]
    pub prf_keys: Vec<PrfUnlock>,
    pub private_data: EncryptedEnvelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerShape {
    Symmetric,
    Asymmetric,
    /// Some methods migrated, some not. Only seen between unlocks.
    Mixed,
}

/// Public description of one unlock method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockMethodInfo {
    Password,
    Prf {
        credential_id: Vec<u8>,
        transports: Vec<String>,
    },
}

/// What the caller needs to request a PRF assertion for one registered credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrfAssertionInput {
    pub credential_id: Vec<u8>,
    pub transports: Vec<String>,
    pub prf_salt: Vec<u8>,
}

impl EncryptedContainer {
    /// A container with no unlock methods yet. Callers add at least one before committing.
    pub(crate) fn new(main_key: &MainKey, data: &PrivateData) -> KeystoreResult<Self> {
        let ephemeral = generate_secret_key();
        Ok(Self {
            main_key: Some(MainKeyEncapsulation {
                public_key: public_key_bytes(&ephemeral),
            }),
            password: None,
            prf_keys: Vec::new(),
            private_data: seal(main_key, data)?,
        })
    }

    fn wrapped_keys(&self) -> impl Iterator<Item = &WrappedMainKey> {
        self.password
            .iter()
            .map(|p| &p.main_key)
            .chain(self.prf_keys.iter().map(|p| &p.main_key))
    }

    pub fn shape(&self) -> ContainerShape {
        let (mut asym, mut sym) = (0usize, 0usize);
        for wrapped in self.wrapped_keys() {
            if wrapped.is_asymmetric() {
                asym += 1;
            } else {
                sym += 1;
            }
        }
        match (asym, sym) {
            (_, 0) if self.main_key.is_some() => ContainerShape::Asymmetric,
            (0, _) => ContainerShape::Symmetric,
            _ => ContainerShape::Mixed,
        }
    }

    pub fn method_count(&self) -> usize {
        self.wrapped_keys().count()
    }

    pub fn unlock_methods(&self) -> Vec<UnlockMethodInfo> {
        let mut methods = Vec::new();
        if self.password.is_some() {
            methods.push(UnlockMethodInfo::Password);
        }
        methods.extend(self.prf_keys.iter().map(|p| UnlockMethodInfo::Prf {
            credential_id: p.credential_id.clone(),
            transports: p.transports.clone(),
        }));
        methods
    }

    pub fn prf_assertion_inputs(&self) -> Vec<PrfAssertionInput> {
        self.prf_keys
            .iter()
            .map(|p| PrfAssertionInput {
                credential_id: p.credential_id.clone(),
                transports: p.transports.clone(),
                prf_salt: p.prf_salt.clone(),
            })
            .collect()
    }

    pub fn find_prf(&self, credential_id: &[u8]) -> Option<&PrfUnlock> {
        self.prf_keys.iter().find(|p| p.credential_id == credential_id)
    }

    fn main_public_key(&self) -> KeystoreResult<&[u8]> {
        self.main_key
            .as_ref()
            .map(|m| m.public_key.as_slice())
            .ok_or_else(|| {
                KeystoreError::ContainerCorrupted("asymmetric unlock without main public key".into())
            })
    }

    /// Recover the main key through one method's wrapping.
    pub fn unwrap_main_key(
        &self,
        wrapped: &WrappedMainKey,
        base_key: &Zeroizing<[u8; 32]>,
    ) -> KeystoreResult<MainKey> {
        match wrapped {
            WrappedMainKey::Symmetric { wrapped_key } => kw_unwrap(base_key, wrapped_key),
            WrappedMainKey::Asymmetric {
                keypair,
                wrapped_key,
            } => {
                let static_private = unwrap_static_private_key(base_key, keypair)?;
                decapsulate(&static_private, self.main_public_key()?, wrapped_key)
            }
        }
    }

    /// Asymmetric wrapping of `main_key` for a new or upgraded method.
    ///
    /// Uses the new static private key against the container's ephemeral
    /// public key, creating the ephemeral key if the container has none.
    pub fn wrap_for_method(
        &mut self,
        base_key: &Zeroizing<[u8; 32]>,
        main_key: &MainKey,
    ) -> KeystoreResult<WrappedMainKey> {
        if self.main_key.is_none() {
            let ephemeral = generate_secret_key();
            self.main_key = Some(MainKeyEncapsulation {
                public_key: public_key_bytes(&ephemeral),
            });
        }
        let (keypair, static_private) = generate_static_keypair(base_key)?;
        let wrapped_key = encapsulate(&static_private, self.main_public_key()?, main_key)?;
        Ok(WrappedMainKey::Asymmetric {
            keypair,
            wrapped_key,
        })
    }

    pub fn set_password(&mut self, pbkdf2: Pbkdf2Params, main_key: WrappedMainKey) {
        self.password = Some(PasswordUnlock { pbkdf2, main_key });
    }

    /// Add a PRF method, replacing any earlier entry for the same credential.
    pub fn add_prf(&mut self, prf: PrfUnlock) {
        self.prf_keys.retain(|p| p.credential_id != prf.credential_id);
        self.prf_keys.push(prf);
    }

    pub fn remove_prf(&mut self, credential_id: &[u8]) -> KeystoreResult<()> {
        if self.find_prf(credential_id).is_none() {
            return Err(KeystoreError::UnlockMethodNotFound(wallet_core::b64u_encode(
                credential_id,
            )));
        }
        if self.method_count() == 1 {
            return Err(KeystoreError::LastUnlockMethod);
        }
        self.prf_keys.retain(|p| p.credential_id != credential_id);
        Ok(())
    }

    pub fn remove_password(&mut self) -> KeystoreResult<()> {
        if self.password.is_none() {
            return Err(KeystoreError::UnlockMethodNotFound("password".into()));
        }
        if self.method_count() == 1 {
            return Err(KeystoreError::LastUnlockMethod);
        }
        self.password = None;
        Ok(())
    }

    /// Upgrade the password method to asymmetric wrapping, if it is still symmetric.
    pub fn migrate_password(
        &mut self,
        base_key: &Zeroizing<[u8; 32]>,
        main_key: &MainKey,
    ) -> KeystoreResult<bool> {
        match &self.password {
            Some(p) if !p.main_key.is_asymmetric() => {}
            _ => return Ok(false),
        }
        let wrapped = self.wrap_for_method(base_key, main_key)?;
        if let Some(p) = self.password.as_mut() {
            p.main_key = wrapped;
        }
        Ok(true)
    }

    /// Upgrade one PRF method to asymmetric wrapping, if it is still symmetric.
    pub fn migrate_prf(
        &mut self,
        credential_id: &[u8],
        base_key: &Zeroizing<[u8; 32]>,
        main_key: &MainKey,
    ) -> KeystoreResult<bool> {
        match self.find_prf(credential_id) {
            Some(p) if !p.main_key.is_asymmetric() => {}
            Some(_) => return Ok(false),
            None => {
                return Err(KeystoreError::UnlockMethodNotFound(wallet_core::b64u_encode(
                    credential_id,
                )))
            }
        }
        let wrapped = self.wrap_for_method(base_key, main_key)?;
        if let Some(p) = self
            .prf_keys
            .iter_mut()
            .find(|p| p.credential_id == credential_id)
        {
            p.main_key = wrapped;
        }
        Ok(true)
    }

    /// Decrypt the payload under a recovered main key.
    ///
    /// A main key that passed the AES-KW integrity check but fails here means
    /// the payload itself is damaged.
    pub fn open(&self, main_key: &MainKey) -> KeystoreResult<PrivateData> {
        let plaintext = envelope::decrypt(main_key, &self.private_data)
            .map_err(|e| KeystoreError::ContainerCorrupted(e.to_string()))?;
        PrivateData::from_json(&plaintext)
    }

    pub fn reseal(&mut self, main_key: &MainKey, data: &PrivateData) -> KeystoreResult<()> {
        self.private_data = seal(main_key, data)?;
        Ok(())
    }

    /// Full re-key: fresh main key and ephemeral keypair, every method
    /// re-encapsulated, every local credential key rewrapped.
    ///
    /// Requires every method to be asymmetric, since only their static public
    /// keys let us re-encapsulate without the method secrets.
    pub fn rekey(
        &self,
        old_main_key: &MainKey,
        mut data: PrivateData,
    ) -> KeystoreResult<(Self, MainKey, PrivateData)> {
        if self.shape() != ContainerShape::Asymmetric {
            return Err(KeystoreError::MigrationRequired);
        }
        let new_main_key = generate_main_key();
        let ephemeral = generate_secret_key();

        let mut next = self.clone();
        next.main_key = Some(MainKeyEncapsulation {
            public_key: public_key_bytes(&ephemeral),
        });
        let methods = next
            .password
            .iter_mut()
            .map(|p| &mut p.main_key)
            .chain(next.prf_keys.iter_mut().map(|p| &mut p.main_key));
        for wrapped in methods {
            if let WrappedMainKey::Asymmetric {
                keypair,
                wrapped_key,
            } = wrapped
            {
                *wrapped_key = encapsulate(&ephemeral, &keypair.public_key, &new_main_key)?;
            }
        }

        data.rewrap_private_keys(old_main_key, &new_main_key)?;
        next.private_data = seal(&new_main_key, &data)?;
        Ok((next, new_main_key, data))
    }
}

fn seal(main_key: &MainKey, data: &PrivateData) -> KeystoreResult<EncryptedEnvelope> {
    envelope::encrypt_value(main_key, data)
}

// ---------------------------------------------------------------------------
// Plaintext payload
// ---------------------------------------------------------------------------

/// Where a credential private key lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PrivateKeyRef {
    /// Raw scalar, AES-GCM-encrypted under the main key.
    Wrapped { envelope: EncryptedEnvelope },
    /// ARKG-derived key held by an authenticator, addressed by a COSE_Key_Ref.
    External {
        #[serde(rename = "credentialId", with = "wallet_core::b64u_bytes")]
        credential_id: Vec<u8>,
        #[serde(rename = "keyRef", with = "wallet_core::b64u_bytes")]
        key_ref: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialKeyPair {
    pub kid: Kid,
    pub did: String,
    pub alg: String,
    pub public_key: EcJwk,
    pub private_key: PrivateKeyRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArkgSeed {
    #[serde(with = "wallet_core::b64u_bytes")]
    pub credential_id: Vec<u8>,
    pub public_seed: ArkgPublicSeed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateData {
    #[serde(default)]
    pub keypairs: BTreeMap<Kid, CredentialKeyPair>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arkg_seeds: Vec<ArkgSeed>,
}

/// Single-keypair payload written by early wallet versions.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyPrivateData {
    public_key: EcJwk,
    did: String,
    alg: String,
    wrapped_private_key: EncryptedEnvelope,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredPrivateData {
    Legacy(LegacyPrivateData),
    Current(PrivateData),
}

impl PrivateData {
    /// Parse a payload, upgrading the legacy single-keypair form.
    pub fn from_json(bytes: &[u8]) -> KeystoreResult<Self> {
        let stored: StoredPrivateData = serde_json::from_slice(bytes)
            .map_err(|e| KeystoreError::ContainerCorrupted(format!("private data: {}", e)))?;
        match stored {
            StoredPrivateData::Current(data) => Ok(data),
            StoredPrivateData::Legacy(legacy) => {
                let kid = legacy.public_key.thumbprint();
                tracing::info!(kid = %kid, "migrating legacy single-keypair private data");
                let mut data = PrivateData::default();
                data.keypairs.insert(
                    kid.clone(),
                    CredentialKeyPair {
                        kid,
                        did: legacy.did,
                        alg: legacy.alg,
                        public_key: legacy.public_key,
                        private_key: PrivateKeyRef::Wrapped {
                            envelope: legacy.wrapped_private_key,
                        },
                    },
                );
                Ok(data)
            }
        }
    }

    pub fn keypair(&self, kid: &Kid) -> KeystoreResult<&CredentialKeyPair> {
        self.keypairs
            .get(kid)
            .ok_or_else(|| KeystoreError::KeyNotFound(kid.to_string()))
    }

    pub fn insert_keypair(&mut self, keypair: CredentialKeyPair) {
        self.keypairs.insert(keypair.kid.clone(), keypair);
    }

    /// The single registered ARKG seed, if any.
    pub fn arkg_seed(&self) -> KeystoreResult<Option<&ArkgSeed>> {
        match self.arkg_seeds.as_slice() {
            [] => Ok(None),
            [seed] => Ok(Some(seed)),
            _ => Err(KeystoreError::ArkgSeedAlreadyPresent),
        }
    }

    pub fn add_arkg_seed(&mut self, seed: ArkgSeed) -> KeystoreResult<()> {
        if !self.arkg_seeds.is_empty() {
            return Err(KeystoreError::ArkgSeedAlreadyPresent);
        }
        self.arkg_seeds.push(seed);
        Ok(())
    }

    fn rewrap_private_keys(&mut self, old: &MainKey, new: &MainKey) -> KeystoreResult<()> {
        for keypair in self.keypairs.values_mut() {
            if let PrivateKeyRef::Wrapped { envelope: env } = &mut keypair.private_key {
                let scalar = envelope::decrypt(old, env).map_err(|e| {
                    KeystoreError::ContainerCorrupted(format!("key {}: {}", keypair.kid, e))
                })?;
                *env = envelope::encrypt(new, &scalar)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encapsulation::{kw_wrap, secret_key_bytes};
    use crate::kdf::KdfParams;

    fn base_key(fill: u8) -> Zeroizing<[u8; 32]> {
        Zeroizing::new([fill; 32])
    }

    fn sample_keypair(main_key: &MainKey) -> CredentialKeyPair {
        let secret = generate_secret_key();
        let jwk = EcJwk::from_sec1_uncompressed(&public_key_bytes(&secret)).unwrap();
        CredentialKeyPair {
            kid: jwk.thumbprint(),
            did: "did:key:zTest".into(),
            alg: "ES256".into(),
            public_key: jwk,
            private_key: PrivateKeyRef::Wrapped {
                envelope: envelope::encrypt(main_key, &*secret_key_bytes(&secret)).unwrap(),
            },
        }
    }

    fn container_with_password(main_key: &MainKey, data: &PrivateData) -> EncryptedContainer {
        let mut container = EncryptedContainer::new(main_key, data).unwrap();
        let wrapped = container.wrap_for_method(&base_key(1), main_key).unwrap();
        container.set_password(KdfParams::insecure_for_tests(1).new_pbkdf2_params(), wrapped);
        container
    }

    fn legacy_container(main_key: &MainKey, data: &PrivateData) -> EncryptedContainer {
        EncryptedContainer {
            main_key: None,
            password: Some(PasswordUnlock {
                pbkdf2: KdfParams::insecure_for_tests(1).new_pbkdf2_params(),
                main_key: WrappedMainKey::Symmetric {
                    wrapped_key: kw_wrap(&base_key(1), main_key).unwrap(),
                },
            }),
            prf_keys: Vec::new(),
            private_data: seal(main_key, data).unwrap(),
        }
    }

    #[test]
    fn test_asymmetric_unwrap_and_open() {
        let main_key = generate_main_key();
        let mut data = PrivateData::default();
        data.insert_keypair(sample_keypair(&main_key));
        let container = container_with_password(&main_key, &data);

        assert_eq!(container.shape(), ContainerShape::Asymmetric);
        let wrapped = &container.password.as_ref().unwrap().main_key;
        let recovered = container.unwrap_main_key(wrapped, &base_key(1)).unwrap();
        assert_eq!(*recovered, *main_key);
        assert_eq!(container.open(&recovered).unwrap(), data);
    }

    #[test]
    fn test_wrong_base_key_fails_unlock() {
        let main_key = generate_main_key();
        let container = container_with_password(&main_key, &PrivateData::default());
        let wrapped = &container.password.as_ref().unwrap().main_key;
        let result = container.unwrap_main_key(wrapped, &base_key(2));
        assert!(matches!(result, Err(KeystoreError::UnlockFailed(_))));
    }

    #[test]
    fn test_legacy_shape_and_migration() {
        let main_key = generate_main_key();
        let mut container = legacy_container(&main_key, &PrivateData::default());
        assert_eq!(container.shape(), ContainerShape::Symmetric);

        let wrapped = container.password.as_ref().unwrap().main_key.clone();
        let recovered = container.unwrap_main_key(&wrapped, &base_key(1)).unwrap();
        assert!(container.migrate_password(&base_key(1), &recovered).unwrap());
        assert_eq!(container.shape(), ContainerShape::Asymmetric);
        assert!(!container.migrate_password(&base_key(1), &recovered).unwrap());

        let wrapped = container.password.as_ref().unwrap().main_key.clone();
        let again = container.unwrap_main_key(&wrapped, &base_key(1)).unwrap();
        assert_eq!(*again, *main_key);
    }

    #[test]
    fn test_mixed_shape_blocks_rekey() {
        let main_key = generate_main_key();
        let mut container = legacy_container(&main_key, &PrivateData::default());
        let asym = container.wrap_for_method(&base_key(7), &main_key).unwrap();
        container.add_prf(PrfUnlock {
            credential_id: vec![7],
            transports: vec![],
            prf_salt: vec![0; 32],
            hkdf_salt: vec![0; 32],
            hkdf_info: b"eDiplomas PRF".to_vec(),
            main_key: asym,
        });
        assert_eq!(container.shape(), ContainerShape::Mixed);
        let result = container.rekey(&main_key, PrivateData::default());
        assert!(matches!(result, Err(KeystoreError::MigrationRequired)));
    }

    #[test]
    fn test_rekey_changes_main_key_and_keeps_methods() {
        let main_key = generate_main_key();
        let mut data = PrivateData::default();
        let keypair = sample_keypair(&main_key);
        let kid = keypair.kid.clone();
        data.insert_keypair(keypair);
        let container = container_with_password(&main_key, &data);

        let (next, new_main_key, new_data) = container.rekey(&main_key, data.clone()).unwrap();
        assert_ne!(*new_main_key, *main_key);
        assert_ne!(next.main_key, container.main_key);

        let wrapped = &next.password.as_ref().unwrap().main_key;
        let recovered = next.unwrap_main_key(wrapped, &base_key(1)).unwrap();
        assert_eq!(*recovered, *new_main_key);

        let opened = next.open(&recovered).unwrap();
        assert_eq!(opened, new_data);
        assert_eq!(opened.keypair(&kid).unwrap().public_key, data.keypair(&kid).unwrap().public_key);
        if let PrivateKeyRef::Wrapped { envelope: env } = &opened.keypair(&kid).unwrap().private_key {
            assert!(envelope::decrypt(&new_main_key, env).is_ok());
            assert!(envelope::decrypt(&main_key, env).is_err());
        } else {
            panic!("expected a wrapped private key");
        }
    }

    #[test]
    fn test_remove_last_method_rejected() {
        let main_key = generate_main_key();
        let mut container = container_with_password(&main_key, &PrivateData::default());
        assert!(matches!(
            container.remove_password(),
            Err(KeystoreError::LastUnlockMethod)
        ));
        assert!(matches!(
            container.remove_prf(&[1, 2]),
            Err(KeystoreError::UnlockMethodNotFound(_))
        ));
    }

    #[test]
    fn test_legacy_private_data_is_migrated() {
        let main_key = generate_main_key();
        let keypair = sample_keypair(&main_key);
        let PrivateKeyRef::Wrapped { envelope: env } = &keypair.private_key else {
            panic!("expected wrapped key");
        };
        let legacy = serde_json::json!({
            "publicKey": keypair.public_key,
            "did": keypair.did,
            "alg": "ES256",
            "verificationMethod": format!("{}#key-1", keypair.did),
            "wrappedPrivateKey": env,
        });
        let data = PrivateData::from_json(&serde_json::to_vec(&legacy).unwrap()).unwrap();
        assert_eq!(data.keypairs.len(), 1);
        assert_eq!(data.keypair(&keypair.kid).unwrap().private_key, keypair.private_key);
    }

    #[test]
    fn test_second_arkg_seed_rejected() {
        let seed = ArkgSeed {
            credential_id: vec![1],
            public_seed: ArkgPublicSeed {
                kid: None,
                pk_bl: vec![4; 65],
                pk_kem: vec![4; 65],
            },
        };
        let mut data = PrivateData::default();
        data.add_arkg_seed(seed.clone()).unwrap();
        assert!(matches!(
            data.add_arkg_seed(seed),
            Err(KeystoreError::ArkgSeedAlreadyPresent)
        ));
    }

    #[test]
    fn test_wrapped_main_key_is_tagged() {
        let json = serde_json::to_value(WrappedMainKey::Symmetric {
            wrapped_key: vec![0; 40],
        })
        .unwrap();
        assert_eq!(json["type"], "symmetric");
        assert!(json["wrappedKey"].is_string());
    }

    #[test]
    fn test_container_json_roundtrip() {
        let main_key = generate_main_key();
        let container = container_with_password(&main_key, &PrivateData::default());
        let json = serde_json::to_string(&container).unwrap();
        let back: EncryptedContainer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, container);
    }
}
