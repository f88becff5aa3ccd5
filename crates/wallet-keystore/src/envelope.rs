use crate::error::{KeystoreError, KeystoreResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce as AesNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

// AES-256-GCM envelope encryption.
//
// Used for the private-data blob under the main key, for credential private
// keys under the main key, and for static encapsulation private keys under an
// unlock method's derived key. A fresh random nonce is stored with each
// ciphertext.

const NONCE_SIZE: usize = 12;

/// Encrypted envelope: nonce + ciphertext (includes GCM tag).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub nonce: [u8; NONCE_SIZE],
    #[serde(with = "wallet_core::b64u_bytes")]
    pub ciphertext: Vec<u8>,
}

pub fn encrypt(key: &Zeroizing<[u8; 32]>, plaintext: &[u8]) -> KeystoreResult<EncryptedEnvelope> {
    let cipher = Aes256Gcm::new_from_slice(&**key)
        .map_err(|e| KeystoreError::Encryption(format!("cipher init failed: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = AesNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| KeystoreError::Encryption(format!("encryption failed: {}", e)))?;

    Ok(EncryptedEnvelope {
        nonce: nonce_bytes,
        ciphertext,
    })
}

pub fn decrypt(
    key: &Zeroizing<[u8; 32]>,
    envelope: &EncryptedEnvelope,
) -> KeystoreResult<Zeroizing<Vec<u8>>> {
    let cipher = Aes256Gcm::new_from_slice(&**key)
        .map_err(|e| KeystoreError::Decryption(format!("cipher init failed: {}", e)))?;

    let nonce = AesNonce::from_slice(&envelope.nonce);

    cipher
        .decrypt(nonce, envelope.ciphertext.as_ref())
        .map(Zeroizing::new)
        .map_err(|e| KeystoreError::Decryption(format!("decryption failed: {}", e)))
}

pub fn encrypt_value<T: Serialize>(
    key: &Zeroizing<[u8; 32]>,
    value: &T,
) -> KeystoreResult<EncryptedEnvelope> {
    let plaintext = Zeroizing::new(
        serde_json::to_vec(value)
            .map_err(|e| KeystoreError::Serialization(format!("serialize failed: {}", e)))?,
    );
    encrypt(key, &plaintext)
}

pub fn decrypt_value<T: for<'de> Deserialize<'de>>(
    key: &Zeroizing<[u8; 32]>,
    envelope: &EncryptedEnvelope,
) -> KeystoreResult<T> {
    let plaintext = decrypt(key, envelope)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| KeystoreError::Serialization(format!("deserialize failed: {}", e)))
}
