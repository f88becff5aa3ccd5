use crate::envelope::{self, EncryptedEnvelope};
use crate::error::{KeystoreError, KeystoreResult};
use aes_kw::KekAes256;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

// Key encapsulation.
//
// Every unlock method owns a static P-256 keypair whose private half is
// AES-GCM-wrapped under the method's derived key. The container owns one
// ephemeral public key per main-key generation. ECDH between the two yields
// an AES-KW key-encryption key that wraps the main key. Either side's private
// key plus the other side's public key reproduces the same KEK, so rotation
// can re-encapsulate for every method without knowing any method secret.

const KW_OVERHEAD: usize = 8;

/// Static keypair of one unlock method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticKeypair {
    /// Uncompressed SEC1 public key.
    #[serde(with = "wallet_core::b64u_bytes")]
    pub public_key: Vec<u8>,
    pub wrapped_private_key: EncryptedEnvelope,
}

pub fn generate_secret_key() -> SecretKey {
    SecretKey::random(&mut rand::rngs::OsRng)
}

pub fn public_key_bytes(secret: &SecretKey) -> Vec<u8> {
    secret.public_key().to_encoded_point(false).as_bytes().to_vec()
}

pub fn secret_key_bytes(secret: &SecretKey) -> Zeroizing<[u8; 32]> {
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&secret.to_bytes());
    out
}

pub fn secret_key_from_bytes(bytes: &[u8]) -> KeystoreResult<SecretKey> {
    SecretKey::from_slice(bytes)
        .map_err(|e| KeystoreError::InvalidKey(format!("bad P-256 private key: {}", e)))
}

pub fn parse_public_key(sec1: &[u8]) -> KeystoreResult<PublicKey> {
    PublicKey::from_sec1_bytes(sec1)
        .map_err(|e| KeystoreError::InvalidKey(format!("bad P-256 public key: {}", e)))
}

/// Generate a static keypair whose private key is wrapped under `base_key`.
pub fn generate_static_keypair(
    base_key: &Zeroizing<[u8; 32]>,
) -> KeystoreResult<(StaticKeypair, SecretKey)> {
    let secret = generate_secret_key();
    let wrapped_private_key = envelope::encrypt(base_key, &*secret_key_bytes(&secret))?;
    Ok((
        StaticKeypair {
            public_key: public_key_bytes(&secret),
            wrapped_private_key,
        },
        secret,
    ))
}

/// Recover a static private key. Fails with `UnlockFailed` under the wrong base key.
pub fn unwrap_static_private_key(
    base_key: &Zeroizing<[u8; 32]>,
    keypair: &StaticKeypair,
) -> KeystoreResult<SecretKey> {
    let bytes = envelope::decrypt(base_key, &keypair.wrapped_private_key)
        .map_err(|_| KeystoreError::UnlockFailed("could not unwrap encapsulation key".into()))?;
    secret_key_from_bytes(&bytes)
}

fn ecdh_kek(private: &SecretKey, peer_public: &[u8]) -> KeystoreResult<Zeroizing<[u8; 32]>> {
    let peer = parse_public_key(peer_public)?;
    let shared = p256::ecdh::diffie_hellman(private.to_nonzero_scalar(), peer.as_affine());
    let mut kek = Zeroizing::new([0u8; 32]);
    kek.copy_from_slice(shared.raw_secret_bytes());
    Ok(kek)
}

/// Wrap `key` under ECDH(private, peer_public).
pub fn encapsulate(private: &SecretKey, peer_public: &[u8], key: &[u8; 32]) -> KeystoreResult<Vec<u8>> {
    let kek = ecdh_kek(private, peer_public)?;
    kw_wrap(&kek, key)
}

/// Inverse of `encapsulate`, from the other side of the exchange.
pub fn decapsulate(
    private: &SecretKey,
    peer_public: &[u8],
    wrapped: &[u8],
) -> KeystoreResult<Zeroizing<[u8; 32]>> {
    let kek = ecdh_kek(private, peer_public)?;
    kw_unwrap(&kek, wrapped)
}

/// RFC 3394 AES-256 key wrap of a 256-bit key.
pub fn kw_wrap(kek: &[u8; 32], key: &[u8; 32]) -> KeystoreResult<Vec<u8>> {
    let kek = KekAes256::from(*kek);
    let mut out = vec![0u8; key.len() + KW_OVERHEAD];
    kek.wrap(key, &mut out)
        .map_err(|e| KeystoreError::Encryption(format!("key wrap failed: {}", e)))?;
    Ok(out)
}

pub fn kw_unwrap(kek: &[u8; 32], wrapped: &[u8]) -> KeystoreResult<Zeroizing<[u8; 32]>> {
    if wrapped.len() != 32 + KW_OVERHEAD {
        return Err(KeystoreError::ContainerCorrupted(format!(
            "wrapped key has {} bytes",
            wrapped.len()
        )));
    }
    let kek = KekAes256::from(*kek);
    let mut out = Zeroizing::new([0u8; 32]);
    kek.unwrap(wrapped, &mut *out)
        .map_err(|_| KeystoreError::UnlockFailed("key unwrap integrity check failed".into()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encapsulate_is_symmetric_across_sides() {
        let main_ephemeral = generate_secret_key();
        let method_static = generate_secret_key();
        let main_key = [0x5a; 32];

        // Rotation side: ephemeral private x static public
        let wrapped = encapsulate(&main_ephemeral, &public_key_bytes(&method_static), &main_key)
            .unwrap();
        // Unlock side: static private x ephemeral public
        let recovered =
            decapsulate(&method_static, &public_key_bytes(&main_ephemeral), &wrapped).unwrap();
        assert_eq!(*recovered, main_key);
    }

    #[test]
    fn test_decapsulate_with_wrong_key_fails() {
        let main_ephemeral = generate_secret_key();
        let method_static = generate_secret_key();
        let intruder = generate_secret_key();
        let wrapped =
            encapsulate(&main_ephemeral, &public_key_bytes(&method_static), &[1; 32]).unwrap();
        let result = decapsulate(&intruder, &public_key_bytes(&main_ephemeral), &wrapped);
        assert!(matches!(result, Err(KeystoreError::UnlockFailed(_))));
    }

    #[test]
    fn test_static_keypair_wrap_roundtrip() {
        let base = Zeroizing::new([0x33; 32]);
        let (keypair, secret) = generate_static_keypair(&base).unwrap();
        let recovered = unwrap_static_private_key(&base, &keypair).unwrap();
        assert_eq!(recovered.to_bytes(), secret.to_bytes());
        assert_eq!(keypair.public_key.len(), 65);
    }

    #[test]
    fn test_static_keypair_wrong_base_key() {
        let (keypair, _) = generate_static_keypair(&Zeroizing::new([0x33; 32])).unwrap();
        let result = unwrap_static_private_key(&Zeroizing::new([0x34; 32]), &keypair);
        assert!(matches!(result, Err(KeystoreError::UnlockFailed(_))));
    }

    #[test]
    fn test_kw_rfc3394_vector() {
        // RFC 3394 section 4.6: 256-bit key data with a 256-bit KEK
        let kek: [u8; 32] = core::array::from_fn(|i| i as u8);
        let data: [u8; 32] = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b,
            0x0c, 0x0d, 0x0e, 0x0f,
        ];
        let wrapped = kw_wrap(&kek, &data).unwrap();
        assert_eq!(wrapped.len(), 40);
        assert_eq!(
            &wrapped[..8],
            &[0x28, 0xc9, 0xf4, 0x04, 0xc4, 0xb8, 0x10, 0xf4]
        );
        assert_eq!(*kw_unwrap(&kek, &wrapped).unwrap(), data);
    }

    #[test]
    fn test_kw_unwrap_rejects_bad_length() {
        let result = kw_unwrap(&[0; 32], &[0; 12]);
        assert!(matches!(result, Err(KeystoreError::ContainerCorrupted(_))));
    }
}
