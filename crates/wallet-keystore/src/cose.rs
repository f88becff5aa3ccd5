//! COSE_Key encoding for P-256 keys, ARKG public seeds and ARKG-derived key references.

use crate::error::{KeystoreError, KeystoreResult};
use ciborium::value::{Integer, Value};
use serde::{Deserialize, Serialize};

pub const COSE_KTY_EC2: i64 = 2;
pub const COSE_CRV_P256: i64 = 1;
pub const COSE_ALG_ES256: i64 = -7;
pub const COSE_ALG_ECDH_ES_HKDF_256: i64 = -25;

/// ARKG public seed key type.
pub const COSE_KTY_ARKG_PUB: i64 = -65537;
/// ARKG-derived key reference key type.
pub const COSE_KTY_ARKG_DERIVED: i64 = -65538;
pub const COSE_ALG_ARKG_P256ADD_ECDH: i64 = -60600;
pub const COSE_ALG_ESP256_ARKG: i64 = -65539;

const LABEL_KTY: i64 = 1;
const LABEL_KID: i64 = 2;
const LABEL_ALG: i64 = 3;
const LABEL_CRV: i64 = -1;
const LABEL_X: i64 = -2;
const LABEL_Y: i64 = -3;
const LABEL_ARKG_PK_BL: i64 = -1;
const LABEL_ARKG_PK_KEM: i64 = -2;
const LABEL_ARKG_KH: i64 = -1;
const LABEL_ARKG_INFO: i64 = -2;

// ---------------------------------------------------------------------------
// Generic map helpers
// ---------------------------------------------------------------------------

pub fn int(v: i64) -> Value {
    Value::Integer(Integer::from(v))
}

pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => i64::try_from(i128::from(*i)).ok(),
        _ => None,
    }
}

/// Look up an integer label in a CBOR map.
pub fn map_get(map: &Value, label: i64) -> Option<&Value> {
    match map {
        Value::Map(entries) => entries
            .iter()
            .find(|(k, _)| as_i64(k) == Some(label))
            .map(|(_, v)| v),
        _ => None,
    }
}

/// Look up a text key in a CBOR map.
pub fn map_get_text<'a>(map: &'a Value, key: &str) -> Option<&'a Value> {
    match map {
        Value::Map(entries) => entries
            .iter()
            .find(|(k, _)| matches!(k, Value::Text(t) if t == key))
            .map(|(_, v)| v),
        _ => None,
    }
}

fn bytes_at(map: &Value, label: i64, what: &str) -> KeystoreResult<Vec<u8>> {
    match map_get(map, label) {
        Some(Value::Bytes(b)) => Ok(b.clone()),
        Some(other) => Err(KeystoreError::Cose(format!(
            "{} ({}) has wrong type: {:?}",
            what, label, other
        ))),
        None => Err(KeystoreError::Cose(format!("missing {} ({})", what, label))),
    }
}

pub fn to_cbor_bytes(value: &Value) -> KeystoreResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out)
        .map_err(|e| KeystoreError::Cose(format!("cbor encode failed: {}", e)))?;
    Ok(out)
}

pub fn from_cbor_bytes(bytes: &[u8]) -> KeystoreResult<Value> {
    ciborium::de::from_reader(bytes)
        .map_err(|e| KeystoreError::Cose(format!("cbor decode failed: {}", e)))
}

// ---------------------------------------------------------------------------
// EC2 public keys
// ---------------------------------------------------------------------------

/// Encode an uncompressed SEC1 P-256 point as an EC2 COSE_Key.
pub fn encode_ec2_public_key(sec1: &[u8], alg: Option<i64>) -> KeystoreResult<Value> {
    if sec1.len() != 65 || sec1[0] != 0x04 {
        return Err(KeystoreError::InvalidKey(
            "expected uncompressed P-256 point".into(),
        ));
    }
    let mut entries = vec![(int(LABEL_KTY), int(COSE_KTY_EC2))];
    if let Some(alg) = alg {
        entries.push((int(LABEL_ALG), int(alg)));
    }
    entries.push((int(LABEL_CRV), int(COSE_CRV_P256)));
    entries.push((int(LABEL_X), Value::Bytes(sec1[1..33].to_vec())));
    entries.push((int(LABEL_Y), Value::Bytes(sec1[33..].to_vec())));
    Ok(Value::Map(entries))
}

/// Decode an EC2 P-256 COSE_Key to an uncompressed SEC1 point.
/// Short coordinates are left-padded to 32 bytes.
pub fn parse_ec2_public_key(cose: &Value) -> KeystoreResult<Vec<u8>> {
    let kty = map_get(cose, LABEL_KTY).and_then(as_i64);
    if kty != Some(COSE_KTY_EC2) {
        return Err(KeystoreError::Cose(format!(
            "unsupported COSE key type: {:?}",
            kty
        )));
    }
    if let Some(alg) = map_get(cose, LABEL_ALG).and_then(as_i64) {
        if alg != COSE_ALG_ES256 && alg != COSE_ALG_ECDH_ES_HKDF_256 {
            return Err(KeystoreError::Cose(format!(
                "unsupported COSE algorithm: {}",
                alg
            )));
        }
    }
    let crv = map_get(cose, LABEL_CRV).and_then(as_i64);
    if crv != Some(COSE_CRV_P256) {
        return Err(KeystoreError::Cose(format!(
            "unsupported COSE elliptic curve: {:?}",
            crv
        )));
    }
    let x = bytes_at(cose, LABEL_X, "x")?;
    let y = bytes_at(cose, LABEL_Y, "y")?;
    if x.len() > 32 || y.len() > 32 {
        return Err(KeystoreError::Cose("coordinate longer than 32 bytes".into()));
    }
    let mut out = Vec::with_capacity(65);
    out.push(0x04);
    out.extend(std::iter::repeat(0u8).take(32 - x.len()));
    out.extend_from_slice(&x);
    out.extend(std::iter::repeat(0u8).take(32 - y.len()));
    out.extend_from_slice(&y);
    Ok(out)
}

// ---------------------------------------------------------------------------
// ARKG public seed and derived key reference
// ---------------------------------------------------------------------------

/// ARKG public seed as produced by an authenticator's `sign.generateKey` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArkgPublicSeed {
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_b64u")]
    pub kid: Option<Vec<u8>>,
    /// Blinding public key, uncompressed SEC1.
    #[serde(with = "wallet_core::b64u_bytes")]
    pub pk_bl: Vec<u8>,
    /// KEM public key, uncompressed SEC1.
    #[serde(with = "wallet_core::b64u_bytes")]
    pub pk_kem: Vec<u8>,
}

impl ArkgPublicSeed {
    pub fn from_cose(cose: &Value) -> KeystoreResult<Self> {
        let kty = map_get(cose, LABEL_KTY).and_then(as_i64);
        if kty != Some(COSE_KTY_ARKG_PUB) {
            return Err(KeystoreError::Cose(format!(
                "unsupported COSE key type: {:?}",
                kty
            )));
        }
        let kid = match map_get(cose, LABEL_KID) {
            Some(Value::Bytes(b)) => Some(b.clone()),
            _ => None,
        };
        let pk_bl = map_get(cose, LABEL_ARKG_PK_BL)
            .ok_or_else(|| KeystoreError::Cose("missing pkBl (-1)".into()))
            .and_then(parse_ec2_public_key)?;
        let pk_kem = map_get(cose, LABEL_ARKG_PK_KEM)
            .ok_or_else(|| KeystoreError::Cose("missing pkKem (-2)".into()))
            .and_then(parse_ec2_public_key)?;
        Ok(Self { kid, pk_bl, pk_kem })
    }

    pub fn from_cose_bytes(bytes: &[u8]) -> KeystoreResult<Self> {
        Self::from_cose(&from_cbor_bytes(bytes)?)
    }

    pub fn to_cose(&self) -> KeystoreResult<Value> {
        let mut entries = vec![(int(LABEL_KTY), int(COSE_KTY_ARKG_PUB))];
        if let Some(kid) = &self.kid {
            entries.push((int(LABEL_KID), Value::Bytes(kid.clone())));
        }
        entries.push((int(LABEL_ALG), int(COSE_ALG_ARKG_P256ADD_ECDH)));
        entries.push((
            int(LABEL_ARKG_PK_BL),
            encode_ec2_public_key(&self.pk_bl, Some(COSE_ALG_ES256))?,
        ));
        entries.push((
            int(LABEL_ARKG_PK_KEM),
            encode_ec2_public_key(&self.pk_kem, Some(COSE_ALG_ECDH_ES_HKDF_256))?,
        ));
        Ok(Value::Map(entries))
    }
}

/// COSE_Key_Ref identifying an ARKG-derived private key held by an authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArkgDerivedKeyRef {
    pub kid: Vec<u8>,
    pub key_handle: Vec<u8>,
    pub info: Vec<u8>,
}

impl ArkgDerivedKeyRef {
    pub fn to_cose(&self) -> Value {
        Value::Map(vec![
            (int(LABEL_KTY), int(COSE_KTY_ARKG_DERIVED)),
            (int(LABEL_KID), Value::Bytes(self.kid.clone())),
            (int(LABEL_ALG), int(COSE_ALG_ESP256_ARKG)),
            (int(LABEL_ARKG_KH), Value::Bytes(self.key_handle.clone())),
            (int(LABEL_ARKG_INFO), Value::Bytes(self.info.clone())),
        ])
    }

    pub fn encode(&self) -> KeystoreResult<Vec<u8>> {
        to_cbor_bytes(&self.to_cose())
    }

    pub fn decode(bytes: &[u8]) -> KeystoreResult<Self> {
        let cose = from_cbor_bytes(bytes)?;
        let kty = map_get(&cose, LABEL_KTY).and_then(as_i64);
        if kty != Some(COSE_KTY_ARKG_DERIVED) {
            return Err(KeystoreError::Cose(format!(
                "unsupported COSE_Key_Ref type: {:?}",
                kty
            )));
        }
        Ok(Self {
            kid: bytes_at(&cose, LABEL_KID, "kid")?,
            key_handle: bytes_at(&cose, LABEL_ARKG_KH, "kh")?,
            info: match map_get(&cose, LABEL_ARKG_INFO) {
                Some(Value::Bytes(b)) => b.clone(),
                _ => Vec::new(),
            },
        })
    }
}

mod opt_b64u {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&wallet_core::b64u_encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| wallet_core::b64u_decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(fill_x: u8, fill_y: u8) -> Vec<u8> {
        let mut p = vec![0x04];
        p.extend_from_slice(&[fill_x; 32]);
        p.extend_from_slice(&[fill_y; 32]);
        p
    }

    #[test]
    fn test_ec2_key_encode_parse() {
        let cose = encode_ec2_public_key(&point(1, 2), Some(COSE_ALG_ES256)).unwrap();
        assert_eq!(map_get(&cose, 1).and_then(as_i64), Some(2));
        assert_eq!(parse_ec2_public_key(&cose).unwrap(), point(1, 2));
    }

    #[test]
    fn test_ec2_short_coordinates_are_padded() {
        let cose = Value::Map(vec![
            (int(1), int(2)),
            (int(-1), int(1)),
            (int(-2), Value::Bytes(vec![0xaa; 31])),
            (int(-3), Value::Bytes(vec![0xbb; 32])),
        ]);
        let sec1 = parse_ec2_public_key(&cose).unwrap();
        assert_eq!(sec1.len(), 65);
        assert_eq!(sec1[1], 0x00);
        assert_eq!(sec1[2], 0xaa);
    }

    #[test]
    fn test_ec2_rejects_other_curve() {
        let cose = Value::Map(vec![
            (int(1), int(2)),
            (int(-1), int(2)),
            (int(-2), Value::Bytes(vec![0; 32])),
            (int(-3), Value::Bytes(vec![0; 32])),
        ]);
        assert!(parse_ec2_public_key(&cose).is_err());
    }

    #[test]
    fn test_arkg_seed_cose_parse() {
        let seed = ArkgPublicSeed {
            kid: Some(vec![9, 9]),
            pk_bl: point(3, 4),
            pk_kem: point(5, 6),
        };
        let bytes = to_cbor_bytes(&seed.to_cose().unwrap()).unwrap();
        let parsed = ArkgPublicSeed::from_cose_bytes(&bytes).unwrap();
        assert_eq!(parsed, seed);
    }

    #[test]
    fn test_arkg_seed_rejects_wrong_kty() {
        let cose = encode_ec2_public_key(&point(1, 1), None).unwrap();
        assert!(ArkgPublicSeed::from_cose(&cose).is_err());
    }

    #[test]
    fn test_derived_key_ref_layout() {
        let key_ref = ArkgDerivedKeyRef {
            kid: vec![1],
            key_handle: vec![2; 81],
            info: b"wwwallet credential".to_vec(),
        };
        let value = key_ref.to_cose();
        assert_eq!(map_get(&value, 1).and_then(as_i64), Some(-65538));
        assert_eq!(map_get(&value, 3).and_then(as_i64), Some(-65539));
        let decoded = ArkgDerivedKeyRef::decode(&key_ref.encode().unwrap()).unwrap();
        assert_eq!(decoded, key_ref);
    }

    #[test]
    fn test_map_get_text() {
        let map = Value::Map(vec![(Value::Text("sign".into()), int(6))]);
        assert_eq!(map_get_text(&map, "sign").and_then(as_i64), Some(6));
        assert!(map_get_text(&map, "prf").is_none());
    }
}
