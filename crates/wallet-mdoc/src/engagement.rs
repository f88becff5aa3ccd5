//! Device engagement: the QR-code message that bootstraps a proximity session.
//!
//! ```text
//! DeviceEngagement = {
//!   0: "1.0",
//!   1: [1, #6.24(bstr .cbor COSE_Key)],          ; cipher suite, EDeviceKeyBytes
//!   2: [[2, 1, {0: false, 1: true, 11: uuid}]]   ; BLE, central client mode
//! }
//! ```

use crate::cbor::{self, embed, text};
use crate::error::{MdocError, MdocResult};
use ciborium::value::Value;
use uuid::Uuid;
use wallet_core::{b64u_decode, b64u_encode};
use wallet_keystore::cose::{encode_ec2_public_key, int, map_get, parse_ec2_public_key};

pub const URI_SCHEME: &str = "mdoc:";
const CIPHER_SUITE_1: i64 = 1;
const RETRIEVAL_BLE: i64 = 2;
const RETRIEVAL_VERSION: i64 = 1;
const BLE_PERIPHERAL_SERVER_MODE: i64 = 0;
const BLE_CENTRAL_CLIENT_MODE: i64 = 1;
const BLE_CENTRAL_CLIENT_UUID: i64 = 11;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEngagement {
    /// Ephemeral device public key, uncompressed SEC1.
    pub e_device_key: Vec<u8>,
    pub ble_uuid: Uuid,
}

impl DeviceEngagement {
    pub fn new(e_device_key: Vec<u8>, ble_uuid: Uuid) -> Self {
        Self {
            e_device_key,
            ble_uuid,
        }
    }

    pub fn to_value(&self) -> MdocResult<Value> {
        let cose_key = encode_ec2_public_key(&self.e_device_key, None)?;
        let ble_options = Value::Map(vec![
            (int(BLE_PERIPHERAL_SERVER_MODE), Value::Bool(false)),
            (int(BLE_CENTRAL_CLIENT_MODE), Value::Bool(true)),
            (
                int(BLE_CENTRAL_CLIENT_UUID),
                Value::Bytes(self.ble_uuid.as_bytes().to_vec()),
            ),
        ]);
        Ok(Value::Map(vec![
            (int(0), text("1.0")),
            (
                int(1),
                Value::Array(vec![int(CIPHER_SUITE_1), embed(&cose_key)?]),
            ),
            (
                int(2),
                Value::Array(vec![Value::Array(vec![
                    int(RETRIEVAL_BLE),
                    int(RETRIEVAL_VERSION),
                    ble_options,
                ])]),
            ),
        ]))
    }

    pub fn encode(&self) -> MdocResult<Vec<u8>> {
        cbor::encode(&self.to_value()?)
    }

    /// `mdoc:<base64url(cbor)>`, the content of the engagement QR code.
    pub fn to_uri(&self) -> MdocResult<String> {
        Ok(format!("{}{}", URI_SCHEME, b64u_encode(self.encode()?)))
    }

    pub fn parse(bytes: &[u8]) -> MdocResult<Self> {
        let value = cbor::decode(bytes)?;
        let security = map_get(&value, 1)
            .ok_or_else(|| MdocError::MalformedEnvelope("engagement has no security".into()))?;
        let key_item = cbor::as_array(security)?
            .get(1)
            .ok_or_else(|| MdocError::MalformedEnvelope("engagement has no device key".into()))?;
        let e_device_key = parse_ec2_public_key(&cbor::unembed(key_item)?)?;

        let methods = map_get(&value, 2)
            .ok_or_else(|| MdocError::MalformedEnvelope("engagement has no retrieval methods".into()))?;
        let ble_uuid = cbor::as_array(methods)?
            .iter()
            .filter_map(|m| cbor::as_array(m).ok())
            .filter(|m| m.first() == Some(&int(RETRIEVAL_BLE)))
            .find_map(|m| m.get(2))
            .and_then(|options| map_get(options, BLE_CENTRAL_CLIENT_UUID))
            .and_then(cbor::as_bytes)
            .and_then(|b| Uuid::from_slice(b).ok())
            .ok_or_else(|| MdocError::MalformedEnvelope("engagement has no BLE uuid".into()))?;
        Ok(Self {
            e_device_key,
            ble_uuid,
        })
    }

    pub fn parse_uri(uri: &str) -> MdocResult<Self> {
        let encoded = uri
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| MdocError::MalformedEnvelope("not an mdoc: URI".into()))?;
        Self::parse(&b64u_decode(encoded)?)
    }
}
