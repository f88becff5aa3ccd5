use crate::error::{KeystoreError, KeystoreResult};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

/// OWASP PBKDF2-HMAC-SHA256 recommendation.
pub const MIN_PBKDF2_ITERATIONS: u32 = 600_000;

pub const SALT_LEN: usize = 32;

pub const DEFAULT_PRF_HKDF_INFO: &str = "eDiplomas PRF";

/// Key-derivation settings applied when new unlock methods are created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    pbkdf2_iterations: u32,
    prf_hkdf_info: Vec<u8>,
}

impl KdfParams {
    pub fn new(pbkdf2_iterations: u32, prf_hkdf_info: &str) -> KeystoreResult<Self> {
        if pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
            return Err(KeystoreError::KeyDerivation(format!(
                "pbkdf2 iterations must be at least {}, got {}",
                MIN_PBKDF2_ITERATIONS, pbkdf2_iterations
            )));
        }
        Ok(Self {
            pbkdf2_iterations,
            prf_hkdf_info: prf_hkdf_info.as_bytes().to_vec(),
        })
    }

    /// Reduced iteration count for test suites only.
    #[doc(hidden)]
    pub fn insecure_for_tests(pbkdf2_iterations: u32) -> Self {
        Self {
            pbkdf2_iterations,
            prf_hkdf_info: DEFAULT_PRF_HKDF_INFO.as_bytes().to_vec(),
        }
    }

    pub fn pbkdf2_iterations(&self) -> u32 {
        self.pbkdf2_iterations
    }

    pub fn prf_hkdf_info(&self) -> &[u8] {
        &self.prf_hkdf_info
    }

    /// Fresh PBKDF2 parameters with a random salt.
    pub fn new_pbkdf2_params(&self) -> Pbkdf2Params {
        Pbkdf2Params {
            salt: random_salt().to_vec(),
            iterations: self.pbkdf2_iterations,
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: MIN_PBKDF2_ITERATIONS,
            prf_hkdf_info: DEFAULT_PRF_HKDF_INFO.as_bytes().to_vec(),
        }
    }
}

/// PBKDF2 parameters persisted alongside a password unlock method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pbkdf2Params {
    #[serde(with = "wallet_core::b64u_bytes")]
    pub salt: Vec<u8>,
    pub iterations: u32,
}

pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// PBKDF2-HMAC-SHA256 over the password.
pub fn derive_password_key(password: &str, params: &Pbkdf2Params) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        &params.salt,
        params.iterations,
        &mut *key,
    );
    key
}

/// HKDF-SHA256 over an authenticator PRF output.
pub fn derive_prf_key(
    prf_output: &[u8],
    hkdf_salt: &[u8],
    hkdf_info: &[u8],
) -> KeystoreResult<Zeroizing<[u8; 32]>> {
    hkdf_derive(prf_output, hkdf_salt, hkdf_info)
}

/// HKDF-SHA256 key derivation with a 32-byte output.
pub fn hkdf_derive(ikm: &[u8], salt: &[u8], info: &[u8]) -> KeystoreResult<Zeroizing<[u8; 32]>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(info, &mut *okm)
        .map_err(|e| KeystoreError::KeyDerivation(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}
