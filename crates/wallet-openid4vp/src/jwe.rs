//! Compact JWE with ECDH-ES direct key agreement (RFC 7518 §4.6) and AES-GCM.

use crate::error::{Oid4vpError, Oid4vpResult};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use p256::SecretKey;
use rand::RngCore;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use wallet_core::{b64u_decode, b64u_encode, EcJwk};
use wallet_keystore::encapsulation::{generate_secret_key, parse_public_key, public_key_bytes};
use zeroize::Zeroizing;

pub const ALG_ECDH_ES: &str = "ECDH-ES";
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncryption {
    A128Gcm,
    A256Gcm,
}

impl ContentEncryption {
    pub fn parse(enc: &str) -> Oid4vpResult<Self> {
        match enc {
            "A128GCM" => Ok(Self::A128Gcm),
            "A256GCM" => Ok(Self::A256Gcm),
            other => Err(Oid4vpError::UnsupportedEncryption(format!("enc {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A128Gcm => "A128GCM",
            Self::A256Gcm => "A256GCM",
        }
    }

    fn key_len(&self) -> usize {
        match self {
            Self::A128Gcm => 16,
            Self::A256Gcm => 32,
        }
    }

    fn seal(&self, key: &[u8], iv: &[u8], plaintext: &[u8], aad: &[u8]) -> Oid4vpResult<Vec<u8>> {
        let payload = Payload { msg: plaintext, aad };
        let nonce = Nonce::from_slice(iv);
        let out = match self {
            Self::A128Gcm => Aes128Gcm::new_from_slice(key)
                .map_err(|e| Oid4vpError::Jwe(e.to_string()))?
                .encrypt(nonce, payload),
            Self::A256Gcm => Aes256Gcm::new_from_slice(key)
                .map_err(|e| Oid4vpError::Jwe(e.to_string()))?
                .encrypt(nonce, payload),
        };
        out.map_err(|_| Oid4vpError::Jwe("content encryption failed".into()))
    }

    fn open(&self, key: &[u8], iv: &[u8], ciphertext: &[u8], aad: &[u8]) -> Oid4vpResult<Vec<u8>> {
        let payload = Payload { msg: ciphertext, aad };
        let nonce = Nonce::from_slice(iv);
        let out = match self {
            Self::A128Gcm => Aes128Gcm::new_from_slice(key)
                .map_err(|e| Oid4vpError::Jwe(e.to_string()))?
                .decrypt(nonce, payload),
            Self::A256Gcm => Aes256Gcm::new_from_slice(key)
                .map_err(|e| Oid4vpError::Jwe(e.to_string()))?
                .decrypt(nonce, payload),
        };
        out.map_err(|_| Oid4vpError::Jwe("content decryption failed".into()))
    }
}

fn length_prefixed(data: &[u8]) -> Vec<u8> {
    let mut out = (data.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(data);
    out
}

/// Concat KDF (NIST SP 800-56A) with SHA-256 as profiled for ECDH-ES.
pub fn concat_kdf(
    shared_secret: &[u8],
    enc: ContentEncryption,
    apu: &[u8],
    apv: &[u8],
) -> Zeroizing<Vec<u8>> {
    let key_len = enc.key_len();
    let mut other_info = length_prefixed(enc.as_str().as_bytes());
    other_info.extend(length_prefixed(apu));
    other_info.extend(length_prefixed(apv));
    other_info.extend_from_slice(&((key_len * 8) as u32).to_be_bytes());

    let mut derived = Zeroizing::new(Vec::with_capacity(key_len + 32));
    let mut counter: u32 = 1;
    while derived.len() < key_len {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(shared_secret);
        hasher.update(&other_info);
        derived.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    derived.truncate(key_len);
    derived
}

fn ecdh(secret: &SecretKey, peer_sec1: &[u8]) -> Oid4vpResult<Zeroizing<Vec<u8>>> {
    let peer = parse_public_key(peer_sec1)?;
    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
}

/// Encrypt `plaintext` to the verifier key `recipient` (a P-256 JWK).
///
/// `apu`/`apv` are raw bytes and are base64url-encoded into the header.
pub fn encrypt(
    plaintext: &[u8],
    recipient: &Value,
    alg: &str,
    enc: &str,
    apu: Option<&[u8]>,
    apv: Option<&[u8]>,
) -> Oid4vpResult<String> {
    if alg != ALG_ECDH_ES {
        return Err(Oid4vpError::UnsupportedEncryption(format!("alg {}", alg)));
    }
    let enc = ContentEncryption::parse(enc)?;
    let recipient_jwk: EcJwk = serde_json::from_value(recipient.clone())
        .map_err(|e| Oid4vpError::UnsupportedEncryption(format!("recipient key: {}", e)))?;

    let ephemeral = generate_secret_key();
    let epk = EcJwk::from_sec1_uncompressed(&public_key_bytes(&ephemeral))?;
    let z = ecdh(&ephemeral, &recipient_jwk.to_sec1_uncompressed()?)?;
    let cek = concat_kdf(&z, enc, apu.unwrap_or_default(), apv.unwrap_or_default());

    let mut header = Map::new();
    header.insert("alg".into(), json!(ALG_ECDH_ES));
    header.insert("enc".into(), json!(enc.as_str()));
    if let Some(kid) = recipient.get("kid").and_then(Value::as_str) {
        header.insert("kid".into(), json!(kid));
    }
    header.insert("epk".into(), serde_json::to_value(&epk)?);
    if let Some(apu) = apu {
        header.insert("apu".into(), json!(b64u_encode(apu)));
    }
    if let Some(apv) = apv {
        header.insert("apv".into(), json!(b64u_encode(apv)));
    }
    let protected = b64u_encode(serde_json::to_vec(&Value::Object(header))?);

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let sealed = enc.seal(&cek, &iv, plaintext, protected.as_bytes())?;
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
    Ok(format!(
        "{}..{}.{}.{}",
        protected,
        b64u_encode(iv),
        b64u_encode(ciphertext),
        b64u_encode(tag)
    ))
}

/// Recipient side: returns the protected header and plaintext.
pub fn decrypt(jwe: &str, recipient: &SecretKey) -> Oid4vpResult<(Value, Vec<u8>)> {
    let parts: Vec<&str> = jwe.split('.').collect();
    let [protected, encrypted_key, iv, ciphertext, tag] = parts.as_slice() else {
        return Err(Oid4vpError::Jwe(format!("expected 5 segments, got {}", parts.len())));
    };
    if !encrypted_key.is_empty() {
        return Err(Oid4vpError::Jwe("ECDH-ES carries no encrypted key".into()));
    }
    let header: Value = serde_json::from_slice(&b64u_decode(protected)?)?;
    if header.get("alg").and_then(Value::as_str) != Some(ALG_ECDH_ES) {
        return Err(Oid4vpError::UnsupportedEncryption("alg".into()));
    }
    let enc = ContentEncryption::parse(header.get("enc").and_then(Value::as_str).unwrap_or_default())?;
    let epk: EcJwk = serde_json::from_value(
        header
            .get("epk")
            .cloned()
            .ok_or_else(|| Oid4vpError::Jwe("missing epk".into()))?,
    )?;
    let param = |name: &str| -> Oid4vpResult<Vec<u8>> {
        match header.get(name).and_then(Value::as_str) {
            Some(v) => Ok(b64u_decode(v)?),
            None => Ok(Vec::new()),
        }
    };
    let z = ecdh(recipient, &epk.to_sec1_uncompressed()?)?;
    let cek = concat_kdf(&z, enc, &param("apu")?, &param("apv")?);

    let mut sealed = b64u_decode(ciphertext)?;
    sealed.extend(b64u_decode(tag)?);
    let iv = b64u_decode(iv)?;
    if iv.len() != IV_LEN {
        return Err(Oid4vpError::Jwe("bad iv length".into()));
    }
    let plaintext = enc.open(&cek, &iv, &sealed, protected.as_bytes())?;
    Ok((header, plaintext))
}
