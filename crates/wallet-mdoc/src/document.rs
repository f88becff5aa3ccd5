//! mdoc document model: issuer-signed data, device authentication and device responses.
//!
//! Issuer-signed items are kept together with their original encoding so that
//! restricting a document to requested elements never invalidates the
//! digests the issuer signed in the mobile security object (MSO).

use crate::cbor::{self, embed, embed_bytes, map_get, require, text};
use crate::error::{MdocError, MdocResult};
use ciborium::value::Value;
use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::{Signature, SigningKey};
use rand::RngCore;
use std::collections::{BTreeMap, BTreeSet};
use wallet_core::{b64u_decode, parse_path, sha256, EcJwk, InputDescriptor, PathSegment, Timestamp};
use wallet_keystore::cose::{encode_ec2_public_key, int, parse_ec2_public_key, COSE_ALG_ES256};
use wallet_keystore::signer::verify_es256;
use wallet_keystore::Signer;

pub const MDOC_VERSION: &str = "1.0";
pub const DEFAULT_DOC_TYPE: &str = "eu.europa.ec.eudi.pid.1";
const COSE_HEADER_ALG: i64 = 1;
const DEVICE_AUTHENTICATION: &str = "DeviceAuthentication";
const SIGNATURE1: &str = "Signature1";

/// Requested elements per namespace.
pub type ElementSelection = BTreeMap<String, BTreeSet<String>>;

// ---------------------------------------------------------------------------
// Issuer-signed items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct IssuerSignedItem {
    pub digest_id: u64,
    pub random: Vec<u8>,
    pub element_identifier: String,
    pub element_value: Value,
    encoded: Vec<u8>,
}

impl IssuerSignedItem {
    pub fn new(digest_id: u64, element_identifier: &str, element_value: Value) -> MdocResult<Self> {
        let mut random = vec![0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut random);
        let value = Value::Map(vec![
            (text("digestID"), Value::Integer(digest_id.into())),
            (text("random"), Value::Bytes(random.clone())),
            (text("elementIdentifier"), text(element_identifier)),
            (text("elementValue"), element_value.clone()),
        ]);
        Ok(Self {
            digest_id,
            random,
            element_identifier: element_identifier.to_string(),
            element_value,
            encoded: cbor::encode(&value)?,
        })
    }

    fn from_embedded(value: &Value) -> MdocResult<Self> {
        let encoded = cbor::embedded_bytes(value)?.to_vec();
        let item = cbor::decode(&encoded)?;
        let digest_id = match require(&item, "digestID")? {
            Value::Integer(i) => u64::try_from(i128::from(*i))
                .map_err(|_| MdocError::InvalidDocument("negative digestID".into()))?,
            _ => return Err(MdocError::InvalidDocument("digestID is not an integer".into())),
        };
        let element_identifier = cbor::as_text(require(&item, "elementIdentifier")?)
            .ok_or_else(|| MdocError::InvalidDocument("elementIdentifier is not text".into()))?
            .to_string();
        Ok(Self {
            digest_id,
            random: map_get(&item, "random")
                .and_then(cbor::as_bytes)
                .map(<[u8]>::to_vec)
                .unwrap_or_default(),
            element_identifier,
            element_value: require(&item, "elementValue")?.clone(),
            encoded,
        })
    }

    /// `IssuerSignedItemBytes`: the item as a tag-24 embedded data item.
    pub fn to_embedded(&self) -> Value {
        embed_bytes(self.encoded.clone())
    }

    /// SHA-256 over the encoded `IssuerSignedItemBytes`, as listed in the MSO.
    pub fn digest(&self) -> MdocResult<[u8; 32]> {
        Ok(sha256(&cbor::encode(&self.to_embedded())?))
    }
}

// ---------------------------------------------------------------------------
// IssuerSigned
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct IssuerSigned {
    pub name_spaces: BTreeMap<String, Vec<IssuerSignedItem>>,
    /// COSE_Sign1 over the tag-24 encoded MSO.
    pub issuer_auth: Value,
}

impl IssuerSigned {
    pub fn from_value(value: &Value) -> MdocResult<Self> {
        let mut name_spaces = BTreeMap::new();
        for (ns, items) in cbor::as_map(require(value, "nameSpaces")?)? {
            let ns = cbor::as_text(ns)
                .ok_or_else(|| MdocError::InvalidDocument("namespace is not text".into()))?;
            let items = cbor::as_array(items)?
                .iter()
                .map(IssuerSignedItem::from_embedded)
                .collect::<MdocResult<Vec<_>>>()?;
            name_spaces.insert(ns.to_string(), items);
        }
        Ok(Self {
            name_spaces,
            issuer_auth: require(value, "issuerAuth")?.clone(),
        })
    }

    pub fn parse(bytes: &[u8]) -> MdocResult<Self> {
        Self::from_value(&cbor::decode(bytes)?)
    }

    /// Parse the base64url form kept in the credential store.
    pub fn from_base64url(encoded: &str) -> MdocResult<Self> {
        Self::parse(&b64u_decode(encoded)?)
    }

    pub fn to_value(&self) -> Value {
        let name_spaces = self
            .name_spaces
            .iter()
            .map(|(ns, items)| {
                (
                    text(ns),
                    Value::Array(items.iter().map(IssuerSignedItem::to_embedded).collect()),
                )
            })
            .collect();
        Value::Map(vec![
            (text("nameSpaces"), Value::Map(name_spaces)),
            (text("issuerAuth"), self.issuer_auth.clone()),
        ])
    }

    pub fn encode(&self) -> MdocResult<Vec<u8>> {
        cbor::encode(&self.to_value())
    }

    /// The decoded mobile security object.
    pub fn mso(&self) -> MdocResult<Value> {
        let parts = cbor::as_array(&self.issuer_auth)?;
        let payload = parts
            .get(2)
            .and_then(cbor::as_bytes)
            .ok_or_else(|| MdocError::InvalidDocument("issuerAuth has no payload".into()))?;
        cbor::unembed(&cbor::decode(payload)?)
    }

    pub fn doc_type(&self) -> MdocResult<String> {
        let mso = self.mso()?;
        cbor::as_text(require(&mso, "docType")?)
            .map(str::to_string)
            .ok_or_else(|| MdocError::InvalidDocument("docType is not text".into()))
    }

    /// The holder's device key from the MSO.
    pub fn device_key(&self) -> MdocResult<EcJwk> {
        let mso = self.mso()?;
        let device_key = require(require(&mso, "deviceKeyInfo")?, "deviceKey")?;
        let sec1 = parse_ec2_public_key(device_key)?;
        Ok(EcJwk::from_sec1_uncompressed(&sec1)?)
    }

    /// Check every item against the digests listed in the MSO.
    pub fn verify_digests(&self) -> MdocResult<()> {
        let mso = self.mso()?;
        let value_digests = require(&mso, "valueDigests")?;
        for (ns, items) in &self.name_spaces {
            let listed = map_get(value_digests, ns)
                .ok_or_else(|| MdocError::InvalidDocument(format!("no digests for {}", ns)))?;
            for item in items {
                let expected = wallet_keystore::cose::map_get(listed, item.digest_id as i64)
                    .and_then(cbor::as_bytes)
                    .ok_or_else(|| {
                        MdocError::InvalidDocument(format!(
                            "no digest for {}/{}",
                            ns, item.element_identifier
                        ))
                    })?;
                if expected != item.digest()?.as_slice() {
                    return Err(MdocError::InvalidDocument(format!(
                        "digest mismatch for {}/{}",
                        ns, item.element_identifier
                    )));
                }
            }
        }
        Ok(())
    }

    /// `{namespace: {element: value}}` as JSON, the shape presentation paths address.
    pub fn claims(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        for (ns, items) in &self.name_spaces {
            let elements = items
                .iter()
                .map(|item| (item.element_identifier.clone(), cbor::to_json(&item.element_value)))
                .collect();
            out.insert(ns.clone(), serde_json::Value::Object(elements));
        }
        serde_json::Value::Object(out)
    }

    pub fn contains_all(&self, selection: &ElementSelection) -> bool {
        selection.iter().all(|(ns, elements)| {
            let present: BTreeSet<&str> = self
                .name_spaces
                .get(ns)
                .map(|items| items.iter().map(|i| i.element_identifier.as_str()).collect())
                .unwrap_or_default();
            elements.iter().all(|e| present.contains(e.as_str()))
        })
    }

    /// A copy holding only the selected elements. Namespaces left empty are dropped.
    pub fn restrict(&self, selection: &ElementSelection) -> IssuerSigned {
        let name_spaces = self
            .name_spaces
            .iter()
            .filter_map(|(ns, items)| {
                let wanted = selection.get(ns)?;
                let kept: Vec<_> = items
                    .iter()
                    .filter(|i| wanted.contains(&i.element_identifier))
                    .cloned()
                    .collect();
                (!kept.is_empty()).then(|| (ns.clone(), kept))
            })
            .collect();
        IssuerSigned {
            name_spaces,
            issuer_auth: self.issuer_auth.clone(),
        }
    }
}

/// Element selection from `$['namespace']['element']` paths. Other paths are ignored.
pub fn selection_from_paths<'a>(paths: impl IntoIterator<Item = &'a String>) -> ElementSelection {
    let mut selection = ElementSelection::new();
    for path in paths {
        if let Ok(segments) = parse_path(path) {
            if let [PathSegment::Key(ns), PathSegment::Key(element)] = segments.as_slice() {
                selection
                    .entry(ns.clone())
                    .or_default()
                    .insert(element.clone());
            }
        }
    }
    selection
}

/// Selection for every required field of `descriptor`.
pub fn selection_for_descriptor(descriptor: &InputDescriptor) -> ElementSelection {
    selection_from_paths(&descriptor.all_paths())
}

// ---------------------------------------------------------------------------
// Session transcripts
// ---------------------------------------------------------------------------

/// ISO 18013-7 OpenID4VP handover:
/// `[null, null, [SHA-256(cbor([client_id, mdoc_nonce])), SHA-256(cbor([response_uri, mdoc_nonce])), nonce]]`.
pub fn oid4vp_session_transcript(
    client_id: &str,
    response_uri: &str,
    nonce: &str,
    mdoc_generated_nonce: &str,
) -> MdocResult<Value> {
    let client_id_hash = sha256(&cbor::encode(&Value::Array(vec![
        text(client_id),
        text(mdoc_generated_nonce),
    ]))?);
    let response_uri_hash = sha256(&cbor::encode(&Value::Array(vec![
        text(response_uri),
        text(mdoc_generated_nonce),
    ]))?);
    Ok(Value::Array(vec![
        Value::Null,
        Value::Null,
        Value::Array(vec![
            Value::Bytes(client_id_hash.to_vec()),
            Value::Bytes(response_uri_hash.to_vec()),
            text(nonce),
        ]),
    ]))
}

// ---------------------------------------------------------------------------
// Device authentication
// ---------------------------------------------------------------------------

fn protected_es256() -> MdocResult<Vec<u8>> {
    cbor::encode(&Value::Map(vec![(int(COSE_HEADER_ALG), int(COSE_ALG_ES256))]))
}

fn sig_structure(protected: &[u8], payload: &[u8]) -> MdocResult<Vec<u8>> {
    cbor::encode(&Value::Array(vec![
        text(SIGNATURE1),
        Value::Bytes(protected.to_vec()),
        Value::Bytes(Vec::new()),
        Value::Bytes(payload.to_vec()),
    ]))
}

/// Encoded `DeviceAuthenticationBytes`, the detached payload of the device signature.
fn device_authentication_bytes(
    transcript: &Value,
    doc_type: &str,
    device_name_spaces: &Value,
) -> MdocResult<Vec<u8>> {
    let authentication = Value::Array(vec![
        text(DEVICE_AUTHENTICATION),
        transcript.clone(),
        text(doc_type),
        device_name_spaces.clone(),
    ]);
    cbor::encode(&embed(&authentication)?)
}

/// `DeviceSigned` with an ES256 device signature over the session transcript.
pub async fn device_signed(
    signer: &dyn Signer,
    issuer_signed: &IssuerSigned,
    transcript: &Value,
) -> MdocResult<Value> {
    let doc_type = issuer_signed.doc_type()?;
    let kid = issuer_signed.device_key()?.thumbprint();
    let device_name_spaces = embed(&Value::Map(Vec::new()))?;
    let protected = protected_es256()?;
    let payload = device_authentication_bytes(transcript, &doc_type, &device_name_spaces)?;
    let signature = signer
        .sign_es256(&kid, &sig_structure(&protected, &payload)?)
        .await?;
    tracing::debug!(kid = %kid, doc_type = %doc_type, "device authentication signed");

    let device_signature = Value::Array(vec![
        Value::Bytes(protected),
        Value::Map(Vec::new()),
        Value::Null,
        Value::Bytes(signature.to_vec()),
    ]);
    Ok(Value::Map(vec![
        (text("nameSpaces"), device_name_spaces),
        (
            text("deviceAuth"),
            Value::Map(vec![(text("deviceSignature"), device_signature)]),
        ),
    ]))
}

/// Encoded `DeviceResponse` holding one document bound to `transcript`.
pub async fn build_device_response(
    signer: &dyn Signer,
    issuer_signed: &IssuerSigned,
    transcript: &Value,
) -> MdocResult<Vec<u8>> {
    let device_signed = device_signed(signer, issuer_signed, transcript).await?;
    let document = Value::Map(vec![
        (text("docType"), text(&issuer_signed.doc_type()?)),
        (text("issuerSigned"), issuer_signed.to_value()),
        (text("deviceSigned"), device_signed),
    ]);
    cbor::encode(&Value::Map(vec![
        (text("version"), text(MDOC_VERSION)),
        (text("documents"), Value::Array(vec![document])),
        (text("status"), Value::Integer(0.into())),
    ]))
}

/// A parsed `DeviceResponse`, as a verifier would see it.
#[derive(Debug, Clone)]
pub struct DeviceResponse {
    pub documents: Vec<(IssuerSigned, Value)>,
    pub status: u64,
}

impl DeviceResponse {
    pub fn parse(bytes: &[u8]) -> MdocResult<Self> {
        let value = cbor::decode(bytes)?;
        let mut documents = Vec::new();
        for doc in cbor::as_array(require(&value, "documents")?)? {
            let issuer_signed = IssuerSigned::from_value(require(doc, "issuerSigned")?)?;
            documents.push((issuer_signed, require(doc, "deviceSigned")?.clone()));
        }
        let status = match map_get(&value, "status") {
            Some(Value::Integer(i)) => u64::try_from(i128::from(*i)).unwrap_or(u64::MAX),
            _ => 0,
        };
        Ok(Self { documents, status })
    }

    /// Verify each document's device signature against its MSO device key.
    pub fn verify_device_signatures(&self, transcript: &Value) -> MdocResult<bool> {
        for (issuer_signed, device_signed) in &self.documents {
            let device_name_spaces = require(device_signed, "nameSpaces")?;
            let cose = require(require(device_signed, "deviceAuth")?, "deviceSignature")?;
            let parts = cbor::as_array(cose)?;
            let (Some(protected), Some(signature)) = (
                parts.first().and_then(cbor::as_bytes),
                parts.get(3).and_then(cbor::as_bytes),
            ) else {
                return Err(MdocError::InvalidDocument("malformed deviceSignature".into()));
            };
            let payload = device_authentication_bytes(
                transcript,
                &issuer_signed.doc_type()?,
                device_name_spaces,
            )?;
            let message = sig_structure(protected, &payload)?;
            if !verify_es256(&issuer_signed.device_key()?, &message, signature) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Issuance (test issuers and fixtures)
// ---------------------------------------------------------------------------

/// Builds a signed `IssuerSigned` structure bound to a holder device key.
pub struct IssuerSignedBuilder {
    doc_type: String,
    device_key: Vec<u8>,
    name_spaces: BTreeMap<String, Vec<(String, Value)>>,
}

impl IssuerSignedBuilder {
    /// `device_key` is the holder's uncompressed SEC1 P-256 public key.
    pub fn new(doc_type: &str, device_key: Vec<u8>) -> Self {
        Self {
            doc_type: doc_type.to_string(),
            device_key,
            name_spaces: BTreeMap::new(),
        }
    }

    pub fn element(mut self, namespace: &str, identifier: &str, value: Value) -> Self {
        self.name_spaces
            .entry(namespace.to_string())
            .or_default()
            .push((identifier.to_string(), value));
        self
    }

    pub fn sign(self, issuer_key: &SigningKey) -> MdocResult<IssuerSigned> {
        let mut name_spaces = BTreeMap::new();
        let mut value_digests = Vec::new();
        let mut digest_id = 0u64;
        for (ns, elements) in self.name_spaces {
            let mut items = Vec::with_capacity(elements.len());
            let mut digests = Vec::with_capacity(elements.len());
            for (identifier, value) in elements {
                let item = IssuerSignedItem::new(digest_id, &identifier, value)?;
                digests.push((Value::Integer(digest_id.into()), Value::Bytes(item.digest()?.to_vec())));
                items.push(item);
                digest_id += 1;
            }
            value_digests.push((text(&ns), Value::Map(digests)));
            name_spaces.insert(ns, items);
        }

        let now = Timestamp::now();
        let until = Timestamp::from_seconds(now.seconds_since_epoch + 365 * 24 * 3600);
        let tdate = |t: &Timestamp| Value::Tag(0, Box::new(text(&t.to_rfc3339())));
        let mso = Value::Map(vec![
            (text("version"), text(MDOC_VERSION)),
            (text("digestAlgorithm"), text("SHA-256")),
            (text("valueDigests"), Value::Map(value_digests)),
            (
                text("deviceKeyInfo"),
                Value::Map(vec![(
                    text("deviceKey"),
                    encode_ec2_public_key(&self.device_key, None)?,
                )]),
            ),
            (text("docType"), text(&self.doc_type)),
            (
                text("validityInfo"),
                Value::Map(vec![
                    (text("signed"), tdate(&now)),
                    (text("validFrom"), tdate(&now)),
                    (text("validUntil"), tdate(&until)),
                ]),
            ),
        ]);

        let protected = protected_es256()?;
        let payload = cbor::encode(&embed(&mso)?)?;
        let signature: Signature = issuer_key.sign(&sig_structure(&protected, &payload)?);
        let issuer_auth = Value::Array(vec![
            Value::Bytes(protected),
            Value::Map(Vec::new()),
            Value::Bytes(payload),
            Value::Bytes(signature.to_bytes().to_vec()),
        ]);
        Ok(IssuerSigned {
            name_spaces,
            issuer_auth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use wallet_keystore::encapsulation::{generate_secret_key, public_key_bytes};
    use wallet_keystore::KeystoreResult;

    const NS: &str = "eu.europa.ec.eudi.pid.1";

    struct DeviceSigner(SigningKey);

    #[async_trait]
    impl Signer for DeviceSigner {
        async fn sign_es256(&self, _kid: &wallet_core::Kid, message: &[u8]) -> KeystoreResult<[u8; 64]> {
            let sig: Signature = self.0.sign(message);
            let mut out = [0u8; 64];
            out.copy_from_slice(&sig.to_bytes());
            Ok(out)
        }

        fn public_jwk(&self, _kid: &wallet_core::Kid) -> KeystoreResult<EcJwk> {
            let point = self.0.verifying_key().to_encoded_point(false);
            Ok(EcJwk::from_sec1_uncompressed(point.as_bytes())?)
        }
    }

    fn sample() -> (IssuerSigned, DeviceSigner) {
        let device = generate_secret_key();
        let issuer = SigningKey::from(&generate_secret_key());
        let doc = IssuerSignedBuilder::new(DEFAULT_DOC_TYPE, public_key_bytes(&device))
            .element(NS, "family_name", text("Doe"))
            .element(NS, "given_name", text("Jane"))
            .element(NS, "age_over_18", Value::Bool(true))
            .sign(&issuer)
            .unwrap();
        (doc, DeviceSigner(SigningKey::from(&device)))
    }

    fn selection(elements: &[&str]) -> ElementSelection {
        BTreeMap::from([(
            NS.to_string(),
            elements.iter().map(|e| e.to_string()).collect(),
        )])
    }

    #[test]
    fn test_parse_roundtrip_keeps_digests_valid() {
        let (doc, _) = sample();
        let parsed = IssuerSigned::parse(&doc.encode().unwrap()).unwrap();
        assert_eq!(parsed, doc);
        parsed.verify_digests().unwrap();
        assert_eq!(parsed.doc_type().unwrap(), DEFAULT_DOC_TYPE);
    }

    #[test]
    fn test_claims_shape() {
        let (doc, _) = sample();
        let claims = doc.claims();
        assert_eq!(claims[NS]["family_name"], "Doe");
        assert_eq!(claims[NS]["age_over_18"], true);
    }

    #[test]
    fn test_restrict_keeps_only_requested_and_stays_verifiable() {
        let (doc, _) = sample();
        let restricted = doc.restrict(&selection(&["family_name"]));
        let names: Vec<_> = restricted.name_spaces[NS]
            .iter()
            .map(|i| i.element_identifier.as_str())
            .collect();
        assert_eq!(names, vec!["family_name"]);
        restricted.verify_digests().unwrap();
    }

    #[test]
    fn test_contains_all() {
        let (doc, _) = sample();
        assert!(doc.contains_all(&selection(&["family_name", "given_name"])));
        assert!(!doc.contains_all(&selection(&["family_name", "birth_date"])));
    }

    #[test]
    fn test_tampered_item_fails_digest_check() {
        let (mut doc, _) = sample();
        let replacement = IssuerSignedItem::new(0, "family_name", text("Mallory")).unwrap();
        doc.name_spaces.get_mut(NS).unwrap()[0] = replacement;
        assert!(doc.verify_digests().is_err());
    }

    #[test]
    fn test_selection_from_paths() {
        let paths = vec![
            "$['eu.europa.ec.eudi.pid.1']['family_name']".to_string(),
            "$.vct".to_string(),
        ];
        let sel = selection_from_paths(&paths);
        assert_eq!(sel, selection(&["family_name"]));
    }

    #[tokio::test]
    async fn test_device_response_signature_verifies() {
        let (doc, signer) = sample();
        let transcript = oid4vp_session_transcript("client", "https://rp/cb", "n-1", "mdoc-n").unwrap();
        let bytes = build_device_response(&signer, &doc, &transcript).await.unwrap();

        let response = DeviceResponse::parse(&bytes).unwrap();
        assert_eq!(response.status, 0);
        assert!(response.verify_device_signatures(&transcript).unwrap());

        let other = oid4vp_session_transcript("client", "https://rp/cb", "n-2", "mdoc-n").unwrap();
        assert!(!response.verify_device_signatures(&other).unwrap());
    }

    #[test]
    fn test_oid4vp_transcript_shape() {
        let t = oid4vp_session_transcript("c", "r", "n", "m").unwrap();
        let parts = cbor::as_array(&t).unwrap();
        assert_eq!(parts[0], Value::Null);
        let handover = cbor::as_array(&parts[2]).unwrap();
        assert_eq!(handover.len(), 3);
        assert_eq!(handover[2], text("n"));
        assert_eq!(cbor::as_bytes(&handover[0]).unwrap().len(), 32);
    }
}
