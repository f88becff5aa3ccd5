//! Session encryption for proximity presentation.
//!
//! Both directions use AES-256-GCM with keys derived by HKDF-SHA256 from the
//! ECDH secret of the two ephemeral keys, salted with
//! `SHA-256(SessionTranscriptBytes)`. Each direction has its own key and a
//! 12-byte IV of an 8-byte identifier followed by a 4-byte big-endian
//! message counter starting at 1.

use crate::cbor::{self, embed, map_get, text};
use crate::error::{MdocError, MdocResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use ciborium::value::Value;
use p256::SecretKey;
use wallet_core::sha256;
use wallet_keystore::cose::parse_ec2_public_key;
use wallet_keystore::encapsulation::parse_public_key;
use wallet_keystore::kdf::hkdf_derive;
use zeroize::Zeroizing;

const INFO_SK_READER: &[u8] = b"SKReader";
const INFO_SK_DEVICE: &[u8] = b"SKDevice";
const READER_IDENTIFIER: [u8; 8] = [0, 0, 0, 0, 0, 0, 0, 0];
const DEVICE_IDENTIFIER: [u8; 8] = [0, 0, 0, 0, 0, 0, 0, 1];

/// Status code closing a session normally.
pub const STATUS_SESSION_TERMINATION: u64 = 20;
pub const STATUS_DECRYPTION_ERROR: u64 = 10;

/// `SessionTranscript = [DeviceEngagementBytes, EReaderKeyBytes, Handover]` with a null handover.
pub fn proximity_session_transcript(
    device_engagement: &[u8],
    e_reader_key_bytes: &Value,
) -> Value {
    Value::Array(vec![
        cbor::embed_bytes(device_engagement.to_vec()),
        e_reader_key_bytes.clone(),
        Value::Null,
    ])
}

fn iv(identifier: &[u8; 8], counter: u32) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[..8].copy_from_slice(identifier);
    iv[8..].copy_from_slice(&counter.to_be_bytes());
    iv
}

/// Directional keys and counters for one session.
pub struct SessionEncryption {
    sk_reader: Zeroizing<[u8; 32]>,
    sk_device: Zeroizing<[u8; 32]>,
    reader_counter: u32,
    device_counter: u32,
}

impl std::fmt::Debug for SessionEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEncryption")
            .field("reader_counter", &self.reader_counter)
            .field("device_counter", &self.device_counter)
            .finish_non_exhaustive()
    }
}

impl SessionEncryption {
    /// Derive both directional keys.
    ///
    /// `own_private` is this side's ephemeral key and `peer_public` the other
    /// side's uncompressed SEC1 point. Both sides derive the same pair.
    pub fn derive(
        own_private: &SecretKey,
        peer_public: &[u8],
        transcript: &Value,
    ) -> MdocResult<Self> {
        let peer = parse_public_key(peer_public)?;
        let shared = p256::ecdh::diffie_hellman(own_private.to_nonzero_scalar(), peer.as_affine());
        let salt = sha256(&cbor::encode(&embed(transcript)?)?);
        let ikm = shared.raw_secret_bytes();
        Ok(Self {
            sk_reader: hkdf_derive(ikm.as_slice(), &salt, INFO_SK_READER)?,
            sk_device: hkdf_derive(ikm.as_slice(), &salt, INFO_SK_DEVICE)?,
            reader_counter: 0,
            device_counter: 0,
        })
    }

    fn seal(key: &[u8; 32], identifier: &[u8; 8], counter: &mut u32, plaintext: &[u8]) -> MdocResult<Vec<u8>> {
        *counter = counter
            .checked_add(1)
            .ok_or_else(|| MdocError::ProtocolError("message counter exhausted".into()))?;
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| MdocError::ProtocolError(format!("invalid session key: {}", e)))?;
        cipher
            .encrypt(Nonce::from_slice(&iv(identifier, *counter)), plaintext)
            .map_err(|_| MdocError::ProtocolError("session encryption failed".into()))
    }

    fn open(key: &[u8; 32], identifier: &[u8; 8], counter: &mut u32, ciphertext: &[u8]) -> MdocResult<Vec<u8>> {
        let next = counter
            .checked_add(1)
            .ok_or_else(|| MdocError::ProtocolError("message counter exhausted".into()))?;
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| MdocError::ProtocolError(format!("invalid session key: {}", e)))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv(identifier, next)), ciphertext)
            .map_err(|_| MdocError::ProtocolError("session decryption failed".into()))?;
        *counter = next;
        Ok(plaintext)
    }

    /// Device side: decrypt a reader → device message (SKReader).
    pub fn decrypt_from_reader(&mut self, ciphertext: &[u8]) -> MdocResult<Vec<u8>> {
        Self::open(&self.sk_reader, &READER_IDENTIFIER, &mut self.reader_counter, ciphertext)
    }

    /// Device side: encrypt a device → reader message (SKDevice).
    pub fn encrypt_to_reader(&mut self, plaintext: &[u8]) -> MdocResult<Vec<u8>> {
        Self::seal(&self.sk_device, &DEVICE_IDENTIFIER, &mut self.device_counter, plaintext)
    }

    /// Reader side: encrypt a reader → device message.
    pub fn encrypt_to_device(&mut self, plaintext: &[u8]) -> MdocResult<Vec<u8>> {
        Self::seal(&self.sk_reader, &READER_IDENTIFIER, &mut self.reader_counter, plaintext)
    }

    /// Reader side: decrypt a device → reader message.
    pub fn decrypt_from_device(&mut self, ciphertext: &[u8]) -> MdocResult<Vec<u8>> {
        Self::open(&self.sk_device, &DEVICE_IDENTIFIER, &mut self.device_counter, ciphertext)
    }
}

// ---------------------------------------------------------------------------
// Session messages
// ---------------------------------------------------------------------------

/// First reader message: `{eReaderKey: #6.24(COSE_Key), data: bstr}`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEstablishment {
    /// `EReaderKeyBytes` exactly as received; it is part of the transcript.
    pub e_reader_key_bytes: Value,
    pub data: Vec<u8>,
}

impl SessionEstablishment {
    pub fn new(e_reader_key: &[u8], data: Vec<u8>) -> MdocResult<Self> {
        let cose = wallet_keystore::cose::encode_ec2_public_key(e_reader_key, None)?;
        Ok(Self {
            e_reader_key_bytes: embed(&cose)?,
            data,
        })
    }

    pub fn parse(bytes: &[u8]) -> MdocResult<Self> {
        let value = cbor::decode(bytes)
            .map_err(|e| MdocError::MalformedEnvelope(format!("session establishment: {}", e)))?;
        let e_reader_key_bytes = map_get(&value, "eReaderKey")
            .ok_or_else(|| MdocError::MalformedEnvelope("missing eReaderKey".into()))?
            .clone();
        let data = map_get(&value, "data")
            .and_then(cbor::as_bytes)
            .ok_or_else(|| MdocError::MalformedEnvelope("missing data".into()))?
            .to_vec();
        Ok(Self {
            e_reader_key_bytes,
            data,
        })
    }

    /// Reader's ephemeral public key, uncompressed SEC1.
    pub fn e_reader_key(&self) -> MdocResult<Vec<u8>> {
        let cose = cbor::unembed(&self.e_reader_key_bytes)
            .map_err(|e| MdocError::MalformedEnvelope(format!("eReaderKey: {}", e)))?;
        Ok(parse_ec2_public_key(&cose)?)
    }

    pub fn encode(&self) -> MdocResult<Vec<u8>> {
        cbor::encode(&Value::Map(vec![
            (text("eReaderKey"), self.e_reader_key_bytes.clone()),
            (text("data"), Value::Bytes(self.data.clone())),
        ]))
    }
}

/// Subsequent messages: `{? data: bstr, ? status: uint}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionData {
    pub data: Option<Vec<u8>>,
    pub status: Option<u64>,
}

impl SessionData {
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Some(data),
            status: None,
        }
    }

    pub fn with_status(status: u64) -> Self {
        Self {
            data: None,
            status: Some(status),
        }
    }

    pub fn encode(&self) -> MdocResult<Vec<u8>> {
        let mut entries = Vec::new();
        if let Some(data) = &self.data {
            entries.push((text("data"), Value::Bytes(data.clone())));
        }
        if let Some(status) = self.status {
            entries.push((text("status"), Value::Integer(status.into())));
        }
        cbor::encode(&Value::Map(entries))
    }

    pub fn parse(bytes: &[u8]) -> MdocResult<Self> {
        let value = cbor::decode(bytes)
            .map_err(|e| MdocError::MalformedEnvelope(format!("session data: {}", e)))?;
        let status = match map_get(&value, "status") {
            Some(Value::Integer(i)) => u64::try_from(i128::from(*i)).ok(),
            _ => None,
        };
        Ok(Self {
            data: map_get(&value, "data").and_then(cbor::as_bytes).map(<[u8]>::to_vec),
            status,
        })
    }
}
