//! SD-JWT parsing, claim reconstruction and selective presentation.
//!
//! Compact form: `<issuer-jwt>~<disclosure>~...~<disclosure>~[<kb-jwt>]`.
//! A disclosure is `base64url(json([salt, name, value]))`, or
//! `[salt, value]` for an array element, committed to in the issuer JWT by
//! `base64url(SHA-256(disclosure))`.

use crate::error::{Oid4vpError, Oid4vpResult};
#[cfg(any(test, feature = "test-fixtures"))]
use p256::ecdsa::{signature::Signer as _, Signature, SigningKey};
use rand::RngCore;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use wallet_core::{b64u_decode, b64u_encode, sha256, EcJwk};
use wallet_keystore::jws::decode_payload_unverified;

const SD: &str = "_sd";
const SD_ALG: &str = "_sd_alg";
const ARRAY_ELEMENT: &str = "...";

#[derive(Debug, Clone, PartialEq)]
pub struct Disclosure {
    pub encoded: String,
    pub salt: String,
    /// `None` for array element disclosures.
    pub name: Option<String>,
    pub value: Value,
}

impl Disclosure {
    pub fn new(name: Option<&str>, value: Value) -> Oid4vpResult<Self> {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let salt = b64u_encode(salt);
        let array = match name {
            Some(name) => json!([salt, name, value]),
            None => json!([salt, value]),
        };
        Ok(Self {
            encoded: b64u_encode(serde_json::to_vec(&array)?),
            salt,
            name: name.map(str::to_string),
            value,
        })
    }

    pub fn parse(encoded: &str) -> Oid4vpResult<Self> {
        let bytes = b64u_decode(encoded)?;
        let array: Vec<Value> = serde_json::from_slice(&bytes)
            .map_err(|e| Oid4vpError::SdJwt(format!("disclosure is not a JSON array: {}", e)))?;
        let salt = |v: &Value| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| Oid4vpError::SdJwt("disclosure salt is not a string".into()))
        };
        match array.as_slice() {
            [s, name, value] => Ok(Self {
                encoded: encoded.to_string(),
                salt: salt(s)?,
                name: Some(
                    name.as_str()
                        .ok_or_else(|| Oid4vpError::SdJwt("claim name is not a string".into()))?
                        .to_string(),
                ),
                value: value.clone(),
            }),
            [s, value] => Ok(Self {
                encoded: encoded.to_string(),
                salt: salt(s)?,
                name: None,
                value: value.clone(),
            }),
            _ => Err(Oid4vpError::SdJwt(format!(
                "disclosure has {} elements",
                array.len()
            ))),
        }
    }

    pub fn digest(&self) -> String {
        b64u_encode(sha256(self.encoded.as_bytes()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SdJwt {
    pub issuer_jwt: String,
    pub disclosures: Vec<Disclosure>,
    pub key_binding_jwt: Option<String>,
}

impl SdJwt {
    pub fn parse(compact: &str) -> Oid4vpResult<Self> {
        let mut parts: Vec<&str> = compact.split('~').collect();
        let issuer_jwt = parts.first().copied().unwrap_or_default();
        if issuer_jwt.split('.').count() != 3 {
            return Err(Oid4vpError::SdJwt("issuer JWT is not a compact JWS".into()));
        }
        let has_key_binding = parts.len() > 1 && parts.last().is_some_and(|p| p.contains('.'));
        let key_binding_jwt = if has_key_binding {
            parts.pop().map(str::to_string)
        } else {
            None
        };
        let disclosures = parts
            .iter()
            .skip(1)
            .filter(|d| !d.is_empty())
            .map(|d| Disclosure::parse(d))
            .collect::<Oid4vpResult<Vec<_>>>()?;
        Ok(Self {
            issuer_jwt: issuer_jwt.to_string(),
            disclosures,
            key_binding_jwt,
        })
    }

    /// Issuer JWT payload as signed, digests unresolved.
    pub fn payload(&self) -> Oid4vpResult<Value> {
        decode_payload_unverified(&self.issuer_jwt)
            .map_err(|e| Oid4vpError::SdJwt(format!("issuer JWT payload: {}", e)))
    }

    fn by_digest(&self) -> HashMap<String, &Disclosure> {
        self.disclosures.iter().map(|d| (d.digest(), d)).collect()
    }

    /// The claim tree with every held disclosure substituted in.
    pub fn claims(&self) -> Oid4vpResult<Value> {
        Ok(reveal(&self.payload()?, &self.by_digest()))
    }

    /// Presentation revealing only the claims named by `frame`
    /// (`{"address": {"locality": true}}`), without a key-binding JWT.
    pub fn present(&self, frame: &Value) -> Oid4vpResult<String> {
        let payload = self.payload()?;
        let index: HashMap<String, usize> = self
            .disclosures
            .iter()
            .enumerate()
            .map(|(i, d)| (d.digest(), i))
            .collect();
        let mut selected = BTreeSet::new();
        select(&payload, frame, &self.disclosures, &index, &mut selected);

        let mut out = self.issuer_jwt.clone();
        out.push('~');
        for i in selected {
            out.push_str(&self.disclosures[i].encoded);
            out.push('~');
        }
        Ok(out)
    }
}

fn digests(object: &Map<String, Value>) -> impl Iterator<Item = &str> + '_ {
    object
        .get(SD)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

fn array_element_digest(value: &Value) -> Option<&str> {
    match value {
        Value::Object(obj) if obj.len() == 1 => obj.get(ARRAY_ELEMENT).and_then(Value::as_str),
        _ => None,
    }
}

fn reveal(value: &Value, by_digest: &HashMap<String, &Disclosure>) -> Value {
    match value {
        Value::Object(object) => {
            let mut out = Map::new();
            for (key, v) in object {
                if key != SD && key != SD_ALG {
                    out.insert(key.clone(), reveal(v, by_digest));
                }
            }
            for digest in digests(object) {
                if let Some(d) = by_digest.get(digest) {
                    if let Some(name) = &d.name {
                        out.insert(name.clone(), reveal(&d.value, by_digest));
                    }
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter_map(|item| match array_element_digest(item) {
                    Some(digest) => by_digest.get(digest).map(|d| reveal(&d.value, by_digest)),
                    None => Some(reveal(item, by_digest)),
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn select(
    value: &Value,
    frame: &Value,
    disclosures: &[Disclosure],
    index: &HashMap<String, usize>,
    selected: &mut BTreeSet<usize>,
) {
    match (value, frame) {
        (Value::Object(object), Value::Object(frame)) => {
            for (key, sub_frame) in frame {
                if let Some(child) = object.get(key).filter(|_| key != SD) {
                    select(child, sub_frame, disclosures, index, selected);
                    continue;
                }
                let found = digests(object)
                    .filter_map(|digest| index.get(digest).copied())
                    .find(|i| disclosures[*i].name.as_deref() == Some(key.as_str()));
                if let Some(i) = found {
                    selected.insert(i);
                    select(&disclosures[i].value, sub_frame, disclosures, index, selected);
                }
            }
        }
        // a selected array reveals its element disclosures
        (Value::Array(items), Value::Bool(true)) => {
            for item in items {
                if let Some(i) = array_element_digest(item).and_then(|d| index.get(d)) {
                    selected.insert(*i);
                }
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Issuance (test issuers and fixtures)
// ---------------------------------------------------------------------------

/// Issues ES256 SD-JWT VCs with top-level selectively disclosable claims.
///
/// Only built for tests and with the `test-fixtures` feature.
#[cfg(any(test, feature = "test-fixtures"))]
pub struct SdJwtIssuer {
    key: SigningKey,
}

#[cfg(any(test, feature = "test-fixtures"))]
impl SdJwtIssuer {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// `always_visible` must be a JSON object; each `(name, value)` in
    /// `disclosable` becomes one disclosure. The result ends in `~`.
    pub fn issue(
        &self,
        always_visible: Value,
        disclosable: &[(&str, Value)],
        holder: &EcJwk,
    ) -> Oid4vpResult<String> {
        let Value::Object(mut payload) = always_visible else {
            return Err(Oid4vpError::SdJwt("visible claims must be an object".into()));
        };
        let disclosures = disclosable
            .iter()
            .map(|(name, value)| Disclosure::new(Some(*name), value.clone()))
            .collect::<Oid4vpResult<Vec<_>>>()?;
        let mut sd: Vec<String> = disclosures.iter().map(Disclosure::digest).collect();
        sd.sort();
        payload.insert(SD.into(), json!(sd));
        payload.insert(SD_ALG.into(), json!("sha-256"));
        payload.insert("cnf".into(), json!({ "jwk": holder }));

        let header = json!({ "alg": "ES256", "typ": "vc+sd-jwt" });
        let signing_input = format!(
            "{}.{}",
            b64u_encode(serde_json::to_vec(&header)?),
            b64u_encode(serde_json::to_vec(&payload)?)
        );
        let signature: Signature = self.key.sign(signing_input.as_bytes());
        let mut out = format!("{}.{}~", signing_input, b64u_encode(signature.to_bytes()));
        for d in &disclosures {
            out.push_str(&d.encoded);
            out.push('~');
        }
        Ok(out)
    }
}
