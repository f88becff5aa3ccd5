use crate::error::{CoreError, CoreResult};
use crate::types::Kid;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// base64url (no padding), as used throughout JOSE and the mdoc URI form
// ---------------------------------------------------------------------------

pub fn b64u_encode(bytes: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64u_decode(encoded: &str) -> CoreResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| CoreError::Encoding(format!("invalid base64url: {}", e)))
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Serde adapter that stores byte vectors as base64url strings.
pub mod b64u_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::b64u_encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::b64u_decode(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// EcJwk: P-256 public key in JWK form
// ---------------------------------------------------------------------------

const P256_COORDINATE_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_ops: Option<Vec<String>>,
}

impl EcJwk {
    /// Build a JWK from an uncompressed SEC1 point (`0x04 ‖ x ‖ y`).
    pub fn from_sec1_uncompressed(point: &[u8]) -> CoreResult<Self> {
        if point.len() != 1 + 2 * P256_COORDINATE_LEN || point[0] != 0x04 {
            return Err(CoreError::InvalidKey(format!(
                "expected 65-byte uncompressed P-256 point, got {} bytes",
                point.len()
            )));
        }
        Ok(Self {
            kty: "EC".into(),
            crv: "P-256".into(),
            x: b64u_encode(&point[1..1 + P256_COORDINATE_LEN]),
            y: b64u_encode(&point[1 + P256_COORDINATE_LEN..]),
            kid: None,
            key_ops: None,
        })
    }

    pub fn to_sec1_uncompressed(&self) -> CoreResult<Vec<u8>> {
        if self.kty != "EC" || self.crv != "P-256" {
            return Err(CoreError::InvalidKey(format!(
                "unsupported key type {}/{}",
                self.kty, self.crv
            )));
        }
        let x = b64u_decode(&self.x)?;
        let y = b64u_decode(&self.y)?;
        if x.len() != P256_COORDINATE_LEN || y.len() != P256_COORDINATE_LEN {
            return Err(CoreError::InvalidKey("bad coordinate length".into()));
        }
        let mut out = Vec::with_capacity(65);
        out.push(0x04);
        out.extend_from_slice(&x);
        out.extend_from_slice(&y);
        Ok(out)
    }

    /// Compressed SEC1 form (`0x02|0x03 ‖ x`).
    pub fn to_sec1_compressed(&self) -> CoreResult<Vec<u8>> {
        let point = self.to_sec1_uncompressed()?;
        let y_is_odd = point[64] & 1 == 1;
        let mut out = Vec::with_capacity(33);
        out.push(if y_is_odd { 0x03 } else { 0x02 });
        out.extend_from_slice(&point[1..33]);
        Ok(out)
    }

    /// The required members in lexicographic order, no whitespace.
    /// This is both the RFC 7638 thumbprint input and the JCS form.
    pub fn canonical_json(&self) -> String {
        format!(
            r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
            self.crv, self.kty, self.x, self.y
        )
    }

    /// RFC 7638 JWK thumbprint, used as the key identifier.
    pub fn thumbprint(&self) -> Kid {
        Kid(b64u_encode(sha256(self.canonical_json().as_bytes())))
    }

    pub fn with_kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = Some(kid.into());
        self
    }

    pub fn with_key_ops(mut self, ops: &[&str]) -> Self {
        self.key_ops = Some(ops.iter().map(|s| s.to_string()).collect());
        self
    }
}

// ---------------------------------------------------------------------------
// did:key
// ---------------------------------------------------------------------------

const MULTICODEC_P256_PUB: [u8; 2] = [0x80, 0x24];
const MULTICODEC_JWK_JCS_PUB: [u8; 3] = [0xd1, 0xd6, 0x03];

/// Which `did:key` multicodec a freshly generated credential key is published under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DidKeyVersion {
    #[default]
    #[serde(rename = "p256-pub")]
    P256Pub,
    #[serde(rename = "jwk_jcs-pub")]
    JwkJcsPub,
}

pub fn did_key_from_jwk(jwk: &EcJwk, version: DidKeyVersion) -> CoreResult<String> {
    let mut bytes = Vec::new();
    match version {
        DidKeyVersion::P256Pub => {
            bytes.extend_from_slice(&MULTICODEC_P256_PUB);
            bytes.extend_from_slice(&jwk.to_sec1_compressed()?);
        }
        DidKeyVersion::JwkJcsPub => {
            bytes.extend_from_slice(&MULTICODEC_JWK_JCS_PUB);
            bytes.extend_from_slice(jwk.canonical_json().as_bytes());
        }
    }
    Ok(format!("did:key:z{}", bs58::encode(bytes).into_string()))
}
