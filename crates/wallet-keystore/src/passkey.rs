//! WebAuthn authenticator seam: PRF-backed unlock and the `sign` extension.
//!
//! `Authenticator` abstracts the platform credential API (create/get with the
//! `prf` and `sign` extensions). Real backends live outside this crate;
//! `MockAuthenticator` is a software implementation for tests and tooling.

use crate::arkg::{self, ArkgSeedKeypair};
use crate::cose::{self, ArkgDerivedKeyRef};
use crate::error::{KeystoreError, KeystoreResult};
use async_trait::async_trait;
use ciborium::value::Value;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

pub const FLAG_USER_PRESENT: u8 = 0x01;
pub const FLAG_USER_VERIFIED: u8 = 0x04;
pub const FLAG_ATTESTED_DATA: u8 = 0x40;
pub const FLAG_EXTENSION_DATA: u8 = 0x80;

/// Key of the signature in the `sign` extension output map.
const SIGN_EXT_SIGNATURE: i64 = 6;

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// PRF extension output as reported by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrfOutputs {
    /// `None` when the client did not say whether PRF is supported.
    pub enabled: Option<bool>,
    pub first: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub rp_id: String,
    pub user_handle: Vec<u8>,
    pub user_name: String,
    pub prf_salt: Vec<u8>,
    /// Ask the authenticator to generate an ARKG seed (`sign.generateKey`).
    pub generate_arkg_seed: bool,
}

#[derive(Debug, Clone)]
pub struct RegistrationResponse {
    pub credential_id: Vec<u8>,
    pub transports: Vec<String>,
    pub prf: PrfOutputs,
    /// COSE-encoded ARKG public seed, if one was generated.
    pub arkg_seed: Option<Vec<u8>>,
}

/// `sign` extension input: key handle per allowed credential plus the prehashed data.
#[derive(Debug, Clone)]
pub struct SignRequest {
    pub key_handle_by_credential: BTreeMap<Vec<u8>, Vec<u8>>,
    pub ph_data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct AssertionRequest {
    pub rp_id: String,
    pub challenge: Vec<u8>,
    pub allow_credentials: Vec<Vec<u8>>,
    pub prf_eval_by_credential: BTreeMap<Vec<u8>, Vec<u8>>,
    pub sign: Option<SignRequest>,
}

impl AssertionRequest {
    pub fn new(rp_id: impl Into<String>) -> Self {
        let mut challenge = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut challenge);
        Self {
            rp_id: rp_id.into(),
            challenge,
            allow_credentials: Vec::new(),
            prf_eval_by_credential: BTreeMap::new(),
            sign: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssertionResponse {
    pub credential_id: Vec<u8>,
    pub authenticator_data: Vec<u8>,
    pub prf: PrfOutputs,
}

/// Platform credential API.
///
/// Implementations return `CanceledByUser` when the user dismisses the
/// ceremony, and `Authenticator` for every other failure.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn create(&self, request: RegistrationRequest) -> KeystoreResult<RegistrationResponse>;
    async fn get(&self, request: AssertionRequest) -> KeystoreResult<AssertionResponse>;
}

// ---------------------------------------------------------------------------
// Authenticator data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct AttestedCredential {
    pub aaguid: [u8; 16],
    pub credential_id: Vec<u8>,
    pub public_key: Value,
}

/// Parsed WebAuthn authenticator data.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatorData {
    pub rp_id_hash: [u8; 32],
    pub flags: u8,
    pub sign_count: u32,
    pub attested_credential: Option<AttestedCredential>,
    pub extensions: Option<Value>,
}

impl AuthenticatorData {
    pub fn parse(bytes: &[u8]) -> KeystoreResult<Self> {
        if bytes.len() < 37 {
            return Err(KeystoreError::Authenticator(format!(
                "authenticator data too short: {} bytes",
                bytes.len()
            )));
        }
        let mut rp_id_hash = [0u8; 32];
        rp_id_hash.copy_from_slice(&bytes[..32]);
        let flags = bytes[32];
        let sign_count = u32::from_be_bytes([bytes[33], bytes[34], bytes[35], bytes[36]]);
        let mut rest = &bytes[37..];

        let attested_credential = if flags & FLAG_ATTESTED_DATA != 0 {
            if rest.len() < 18 {
                return Err(KeystoreError::Authenticator(
                    "truncated attested credential data".into(),
                ));
            }
            let mut aaguid = [0u8; 16];
            aaguid.copy_from_slice(&rest[..16]);
            let id_len = u16::from_be_bytes([rest[16], rest[17]]) as usize;
            rest = &rest[18..];
            if rest.len() < id_len {
                return Err(KeystoreError::Authenticator("truncated credential id".into()));
            }
            let credential_id = rest[..id_len].to_vec();
            rest = &rest[id_len..];
            let public_key: Value = ciborium::de::from_reader(&mut rest)
                .map_err(|e| KeystoreError::Authenticator(format!("credential key: {}", e)))?;
            Some(AttestedCredential {
                aaguid,
                credential_id,
                public_key,
            })
        } else {
            None
        };

        let extensions = if flags & FLAG_EXTENSION_DATA != 0 {
            let value: Value = ciborium::de::from_reader(&mut rest)
                .map_err(|e| KeystoreError::Authenticator(format!("extension data: {}", e)))?;
            Some(value)
        } else {
            None
        };

        Ok(Self {
            rp_id_hash,
            flags,
            sign_count,
            attested_credential,
            extensions,
        })
    }

    pub fn encode(&self) -> KeystoreResult<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.rp_id_hash);
        out.push(self.flags);
        out.extend_from_slice(&self.sign_count.to_be_bytes());
        if let Some(attested) = &self.attested_credential {
            out.extend_from_slice(&attested.aaguid);
            out.extend_from_slice(&(attested.credential_id.len() as u16).to_be_bytes());
            out.extend_from_slice(&attested.credential_id);
            out.extend_from_slice(&cose::to_cbor_bytes(&attested.public_key)?);
        }
        if let Some(extensions) = &self.extensions {
            out.extend_from_slice(&cose::to_cbor_bytes(extensions)?);
        }
        Ok(out)
    }

    pub fn user_present(&self) -> bool {
        self.flags & FLAG_USER_PRESENT != 0
    }

    pub fn user_verified(&self) -> bool {
        self.flags & FLAG_USER_VERIFIED != 0
    }

    /// Signature bytes from the `sign` extension output, if present.
    pub fn sign_extension_signature(&self) -> Option<Vec<u8>> {
        let sign = cose::map_get_text(self.extensions.as_ref()?, "sign")?;
        match cose::map_get(sign, SIGN_EXT_SIGNATURE)? {
            Value::Bytes(sig) => Some(sig.clone()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// MockAuthenticator
// ---------------------------------------------------------------------------

/// Software authenticator for tests.
///
/// PRF outputs are HMAC-SHA256 over the credential id and salt under a fixed
/// device secret. ARKG seeds are generated on request and their derived keys
/// sign through the `sign` extension.
pub struct MockAuthenticator {
    device_secret: [u8; 32],
    supports_prf: bool,
    prf_on_create: bool,
    omit_prf_on_next_assertion: AtomicBool,
    omit_next_signature: AtomicBool,
    cancel_next: AtomicBool,
    assertions: AtomicUsize,
    credentials: Mutex<Vec<Vec<u8>>>,
    arkg_seeds: Mutex<BTreeMap<Vec<u8>, ArkgSeedKeypair>>,
}

impl MockAuthenticator {
    pub fn new(device_secret: [u8; 32]) -> Self {
        Self {
            device_secret,
            supports_prf: true,
            prf_on_create: true,
            omit_prf_on_next_assertion: AtomicBool::new(false),
            omit_next_signature: AtomicBool::new(false),
            cancel_next: AtomicBool::new(false),
            assertions: AtomicUsize::new(0),
            credentials: Mutex::new(Vec::new()),
            arkg_seeds: Mutex::new(BTreeMap::new()),
        }
    }

    /// Report PRF as unsupported.
    pub fn without_prf(mut self) -> Self {
        self.supports_prf = false;
        self
    }

    /// Report PRF as enabled at registration but only evaluate it on assertion.
    pub fn defer_prf_to_assertion(mut self) -> Self {
        self.prf_on_create = false;
        self
    }

    pub fn omit_prf_on_next_assertion(&self) {
        self.omit_prf_on_next_assertion.store(true, Ordering::SeqCst);
    }

    pub fn omit_next_signature(&self) {
        self.omit_next_signature.store(true, Ordering::SeqCst);
    }

    /// Simulate the user dismissing the next ceremony.
    pub fn cancel_next(&self) {
        self.cancel_next.store(true, Ordering::SeqCst);
    }

    pub fn assertion_count(&self) -> usize {
        self.assertions.load(Ordering::SeqCst)
    }

    fn prf(&self, credential_id: &[u8], salt: &[u8]) -> KeystoreResult<Vec<u8>> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.device_secret)
            .map_err(|e| KeystoreError::Authenticator(e.to_string()))?;
        mac.update(credential_id);
        mac.update(salt);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn take_cancel(&self) -> KeystoreResult<()> {
        if self.cancel_next.swap(false, Ordering::SeqCst) {
            Err(KeystoreError::CanceledByUser)
        } else {
            Ok(())
        }
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> KeystoreResult<std::sync::MutexGuard<'a, T>> {
        mutex
            .lock()
            .map_err(|e| KeystoreError::Authenticator(format!("lock poisoned: {}", e)))
    }

    fn sign_with_arkg(&self, credential_id: &[u8], key_ref: &[u8], ph_data: &[u8]) -> KeystoreResult<Vec<u8>> {
        use p256::ecdsa::signature::hazmat::PrehashSigner;
        use p256::ecdsa::{Signature, SigningKey};

        let key_ref = ArkgDerivedKeyRef::decode(key_ref)?;
        let seeds = Self::lock(&self.arkg_seeds)?;
        let seed = seeds
            .get(credential_id)
            .ok_or_else(|| KeystoreError::Authenticator("no ARKG seed for credential".into()))?;
        let secret =
            arkg::derive_private_key(&seed.sk_bl, &seed.sk_kem, &key_ref.key_handle, &key_ref.info)?;
        let signature: Signature = SigningKey::from(&secret)
            .sign_prehash(ph_data)
            .map_err(|e| KeystoreError::Signing(e.to_string()))?;
        Ok(signature.to_der().as_bytes().to_vec())
    }
}

#[async_trait]
impl Authenticator for MockAuthenticator {
    async fn create(&self, request: RegistrationRequest) -> KeystoreResult<RegistrationResponse> {
        self.take_cancel()?;
        let mut credential_id = vec![0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut credential_id);
        Self::lock(&self.credentials)?.push(credential_id.clone());

        let prf = if !self.supports_prf {
            PrfOutputs {
                enabled: Some(false),
                first: None,
            }
        } else if self.prf_on_create {
            PrfOutputs {
                enabled: Some(true),
                first: Some(self.prf(&credential_id, &request.prf_salt)?),
            }
        } else {
            PrfOutputs {
                enabled: Some(true),
                first: None,
            }
        };

        let arkg_seed = if request.generate_arkg_seed {
            let seed = ArkgSeedKeypair::generate();
            let public = seed.public_seed(Some(credential_id.clone()));
            Self::lock(&self.arkg_seeds)?.insert(credential_id.clone(), seed);
            Some(cose::to_cbor_bytes(&public.to_cose()?)?)
        } else {
            None
        };

        Ok(RegistrationResponse {
            credential_id,
            transports: vec!["internal".to_string()],
            prf,
            arkg_seed,
        })
    }

    async fn get(&self, request: AssertionRequest) -> KeystoreResult<AssertionResponse> {
        self.take_cancel()?;
        self.assertions.fetch_add(1, Ordering::SeqCst);

        let credential_id = {
            let known = Self::lock(&self.credentials)?;
            known
                .iter()
                .find(|c| request.allow_credentials.is_empty() || request.allow_credentials.contains(c))
                .cloned()
                .ok_or_else(|| KeystoreError::Authenticator("no matching credential".into()))?
        };

        let omit_prf = self.omit_prf_on_next_assertion.swap(false, Ordering::SeqCst);
        let prf = match request.prf_eval_by_credential.get(&credential_id) {
            Some(_) if !self.supports_prf => PrfOutputs {
                enabled: Some(false),
                first: None,
            },
            Some(_) if omit_prf => PrfOutputs::default(),
            Some(salt) => PrfOutputs {
                enabled: Some(true),
                first: Some(self.prf(&credential_id, salt)?),
            },
            None => PrfOutputs::default(),
        };

        let mut flags = FLAG_USER_PRESENT | FLAG_USER_VERIFIED;
        let mut extensions = None;
        if let Some(sign) = &request.sign {
            let omit_sig = self.omit_next_signature.swap(false, Ordering::SeqCst);
            if let Some(key_ref) = sign.key_handle_by_credential.get(&credential_id) {
                let mut sign_out = Vec::new();
                if !omit_sig {
                    let sig = self.sign_with_arkg(&credential_id, key_ref, &sign.ph_data)?;
                    sign_out.push((cose::int(SIGN_EXT_SIGNATURE), Value::Bytes(sig)));
                }
                extensions = Some(Value::Map(vec![(
                    Value::Text("sign".into()),
                    Value::Map(sign_out),
                )]));
                flags |= FLAG_EXTENSION_DATA;
            }
        }

        let authenticator_data = AuthenticatorData {
            rp_id_hash: wallet_core::sha256(request.rp_id.as_bytes()),
            flags,
            sign_count: 0,
            attested_credential: None,
            extensions,
        }
        .encode()?;

        Ok(AssertionResponse {
            credential_id,
            authenticator_data,
            prf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(generate_arkg_seed: bool) -> RegistrationRequest {
        RegistrationRequest {
            rp_id: "wallet.example".into(),
            user_handle: vec![1; 16],
            user_name: "holder".into(),
            prf_salt: vec![7; 32],
            generate_arkg_seed,
        }
    }

    #[test]
    fn test_parse_authenticator_data_with_sign_extension() {
        let data = AuthenticatorData {
            rp_id_hash: [9; 32],
            flags: FLAG_USER_PRESENT | FLAG_EXTENSION_DATA,
            sign_count: 42,
            attested_credential: None,
            extensions: Some(Value::Map(vec![(
                Value::Text("sign".into()),
                Value::Map(vec![(cose::int(6), Value::Bytes(vec![0xab; 70]))]),
            )])),
        };
        let parsed = AuthenticatorData::parse(&data.encode().unwrap()).unwrap();
        assert_eq!(parsed.sign_count, 42);
        assert!(parsed.user_present());
        assert!(!parsed.user_verified());
        assert_eq!(parsed.sign_extension_signature(), Some(vec![0xab; 70]));
    }

    #[test]
    fn test_parse_attested_credential_then_extensions() {
        let public_key = cose::encode_ec2_public_key(
            &crate::encapsulation::public_key_bytes(&crate::encapsulation::generate_secret_key()),
            Some(cose::COSE_ALG_ES256),
        )
        .unwrap();
        let data = AuthenticatorData {
            rp_id_hash: [0; 32],
            flags: FLAG_USER_PRESENT | FLAG_ATTESTED_DATA | FLAG_EXTENSION_DATA,
            sign_count: 0,
            attested_credential: Some(AttestedCredential {
                aaguid: [3; 16],
                credential_id: vec![5; 20],
                public_key,
            }),
            extensions: Some(Value::Map(vec![])),
        };
        let parsed = AuthenticatorData::parse(&data.encode().unwrap()).unwrap();
        assert_eq!(parsed, data);
        assert_eq!(parsed.sign_extension_signature(), None);
    }

    #[test]
    fn test_parse_rejects_short_data() {
        assert!(AuthenticatorData::parse(&[0; 36]).is_err());
    }

    #[tokio::test]
    async fn test_mock_prf_is_stable_per_credential_and_salt() {
        let auth = MockAuthenticator::new([1; 32]);
        let reg = auth.create(registration(false)).await.unwrap();
        let at_create = reg.prf.first.clone().unwrap();

        let mut req = AssertionRequest::new("wallet.example");
        req.allow_credentials = vec![reg.credential_id.clone()];
        req.prf_eval_by_credential
            .insert(reg.credential_id.clone(), vec![7; 32]);
        let assertion = auth.get(req).await.unwrap();
        assert_eq!(assertion.prf.first.unwrap(), at_create);
    }

    #[tokio::test]
    async fn test_mock_without_prf_reports_disabled() {
        let auth = MockAuthenticator::new([1; 32]).without_prf();
        let reg = auth.create(registration(false)).await.unwrap();
        assert_eq!(reg.prf.enabled, Some(false));
        assert!(reg.prf.first.is_none());
    }

    #[tokio::test]
    async fn test_mock_cancel() {
        let auth = MockAuthenticator::new([1; 32]);
        auth.cancel_next();
        let result = auth.create(registration(false)).await;
        assert!(matches!(result, Err(KeystoreError::CanceledByUser)));
        assert!(auth.create(registration(false)).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_arkg_sign_extension() {
        use p256::ecdsa::signature::hazmat::PrehashVerifier;
        use p256::ecdsa::{Signature, VerifyingKey};

        let auth = MockAuthenticator::new([1; 32]);
        let reg = auth.create(registration(true)).await.unwrap();
        let seed = crate::cose::ArkgPublicSeed::from_cose_bytes(&reg.arkg_seed.unwrap()).unwrap();
        let derived = arkg::derive_public_key(&seed, arkg::CREDENTIAL_INFO).unwrap();
        let key_ref = ArkgDerivedKeyRef {
            kid: seed.kid.clone().unwrap(),
            key_handle: derived.key_handle.clone(),
            info: arkg::CREDENTIAL_INFO.to_vec(),
        };

        let digest = wallet_core::sha256(b"header.payload");
        let mut req = AssertionRequest::new("wallet.example");
        req.allow_credentials = vec![reg.credential_id.clone()];
        req.sign = Some(SignRequest {
            key_handle_by_credential: BTreeMap::from([(
                reg.credential_id.clone(),
                key_ref.encode().unwrap(),
            )]),
            ph_data: digest.to_vec(),
        });
        let assertion = auth.get(req).await.unwrap();
        let data = AuthenticatorData::parse(&assertion.authenticator_data).unwrap();
        let der = data.sign_extension_signature().unwrap();

        let signature = Signature::from_der(&der).unwrap();
        let verifying_key = VerifyingKey::from(&derived.public_key);
        assert!(verifying_key.verify_prehash(&digest, &signature).is_ok());
    }
}
