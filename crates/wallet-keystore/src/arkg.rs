//! ARKG-P256ADD-ECDH: asynchronous remote key generation over P-256.
//!
//! The wallet holds only the public seed `(pk_bl, pk_kem)`. Deriving a public
//! key encapsulates a fresh ECDH secret to `pk_kem`, turns it into a blinding
//! scalar `tau`, and returns `pk_bl + tau·G` together with the key handle (the
//! MAC-tagged encapsulation). Only the authenticator holding `sk_kem` and
//! `sk_bl` can recompute `sk_bl + tau` from the key handle.

use crate::cose::ArkgPublicSeed;
use crate::encapsulation::{generate_secret_key, parse_public_key, public_key_bytes};
use crate::error::{KeystoreError, KeystoreResult};
use crate::kdf::hkdf_derive;
use hmac::{Hmac, Mac};
use p256::elliptic_curve::group::Curve as _;
use p256::elliptic_curve::hash2curve::{ExpandMsgXmd, GroupDigest};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{NistP256, NonZeroScalar, ProjectivePoint, PublicKey, Scalar, SecretKey};
use sha2::Sha256;
use subtle::ConstantTimeEq;

pub const DST_EXT: &[u8] = b"ARKG-P256ADD-ECDH";

/// Info string bound into every credential key derived by this wallet.
pub const CREDENTIAL_INFO: &[u8] = b"wwwallet credential";

const CTX_BL_PREFIX: &[u8] = b"ARKG-Derive-Key-BL.";
const CTX_KEM_PREFIX: &[u8] = b"ARKG-Derive-Key-KEM.";
const DST_KEM_PREFIX: &[u8] = b"ARKG-ECDH.";
const DST_BL_PREFIX: &[u8] = b"ARKG-BL-EC.";
const KEM_MAC_INFO: &[u8] = b"ARKG-KEM-HMAC-mac.";
const KEM_SHARED_INFO: &[u8] = b"ARKG-KEM-HMAC-shared.";

const TAG_LEN: usize = 16;
const POINT_LEN: usize = 65;
pub const KEY_HANDLE_LEN: usize = TAG_LEN + POINT_LEN;

/// Result of a public-key derivation.
#[derive(Debug, Clone)]
pub struct DerivedPublicKey {
    pub public_key: PublicKey,
    pub key_handle: Vec<u8>,
}

impl DerivedPublicKey {
    pub fn sec1_uncompressed(&self) -> Vec<u8> {
        self.public_key.to_encoded_point(false).as_bytes().to_vec()
    }
}

fn concat(parts: &[&[u8]]) -> Vec<u8> {
    parts.iter().flat_map(|p| p.iter().copied()).collect()
}

fn kem_keys(shared_x: &[u8], ctx: &[u8]) -> KeystoreResult<([u8; 32], [u8; 32])> {
    let dst_kem = concat(&[DST_KEM_PREFIX, DST_EXT]);
    let mk = hkdf_derive(shared_x, &[], &concat(&[KEM_MAC_INFO, &dst_kem, ctx]))?;
    let k = hkdf_derive(shared_x, &[], &concat(&[KEM_SHARED_INFO, &dst_kem, ctx]))?;
    Ok((*mk, *k))
}

fn kem_tag(mk: &[u8; 32], ephemeral_point: &[u8]) -> KeystoreResult<[u8; TAG_LEN]> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(mk)
        .map_err(|e| KeystoreError::KeyDerivation(format!("hmac init failed: {}", e)))?;
    mac.update(ephemeral_point);
    let full = mac.finalize().into_bytes();
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&full[..TAG_LEN]);
    Ok(tag)
}

fn blinding_scalar(k: &[u8; 32], info: &[u8]) -> KeystoreResult<Scalar> {
    let dst = concat(&[DST_BL_PREFIX, DST_EXT, CTX_BL_PREFIX, info]);
    Ok(NistP256::hash_to_scalar::<ExpandMsgXmd<Sha256>>(
        &[k.as_slice()],
        &[dst.as_slice()],
    )?)
}

/// Derive a fresh public key and key handle from a public seed.
pub fn derive_public_key(seed: &ArkgPublicSeed, info: &[u8]) -> KeystoreResult<DerivedPublicKey> {
    let pk_bl = parse_public_key(&seed.pk_bl)?;
    let pk_kem = parse_public_key(&seed.pk_kem)?;

    let ephemeral = generate_secret_key();
    let shared = p256::ecdh::diffie_hellman(ephemeral.to_nonzero_scalar(), pk_kem.as_affine());
    let ephemeral_point = public_key_bytes(&ephemeral);

    let ctx_kem = concat(&[CTX_KEM_PREFIX, info]);
    let (mk, k) = kem_keys(shared.raw_secret_bytes(), &ctx_kem)?;
    let tag = kem_tag(&mk, &ephemeral_point)?;

    let tau = blinding_scalar(&k, info)?;
    let derived = ProjectivePoint::from(*pk_bl.as_affine()) + ProjectivePoint::GENERATOR * tau;
    let public_key = PublicKey::from_affine(derived.to_affine())?;

    Ok(DerivedPublicKey {
        public_key,
        key_handle: concat(&[&tag, &ephemeral_point]),
    })
}

/// Authenticator side: recover the derived private key from a key handle.
pub fn derive_private_key(
    sk_bl: &SecretKey,
    sk_kem: &SecretKey,
    key_handle: &[u8],
    info: &[u8],
) -> KeystoreResult<SecretKey> {
    if key_handle.len() != KEY_HANDLE_LEN {
        return Err(KeystoreError::InvalidKey(format!(
            "ARKG key handle must be {} bytes, got {}",
            KEY_HANDLE_LEN,
            key_handle.len()
        )));
    }
    let (tag, ephemeral_point) = key_handle.split_at(TAG_LEN);
    let ephemeral = parse_public_key(ephemeral_point)?;
    let shared = p256::ecdh::diffie_hellman(sk_kem.to_nonzero_scalar(), ephemeral.as_affine());

    let ctx_kem = concat(&[CTX_KEM_PREFIX, info]);
    let (mk, k) = kem_keys(shared.raw_secret_bytes(), &ctx_kem)?;
    let expected = kem_tag(&mk, ephemeral_point)?;
    if !bool::from(expected[..].ct_eq(tag)) {
        return Err(KeystoreError::InvalidKey("ARKG key handle MAC mismatch".into()));
    }

    let tau = blinding_scalar(&k, info)?;
    let scalar = *sk_bl.to_nonzero_scalar() + tau;
    let scalar = Option::<NonZeroScalar>::from(NonZeroScalar::new(scalar))
        .ok_or_else(|| KeystoreError::InvalidKey("derived ARKG private key is zero".into()))?;
    Ok(SecretKey::from(scalar))
}

/// Authenticator-side seed material, used by software authenticators.
pub struct ArkgSeedKeypair {
    pub sk_bl: SecretKey,
    pub sk_kem: SecretKey,
}

impl ArkgSeedKeypair {
    pub fn generate() -> Self {
        Self {
            sk_bl: generate_secret_key(),
            sk_kem: generate_secret_key(),
        }
    }

    pub fn public_seed(&self, kid: Option<Vec<u8>>) -> ArkgPublicSeed {
        ArkgPublicSeed {
            kid,
            pk_bl: public_key_bytes(&self.sk_bl),
            pk_kem: public_key_bytes(&self.sk_kem),
        }
    }
}
