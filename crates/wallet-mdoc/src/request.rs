//! Reader requests (`DeviceRequest`) and their presentation-definition equivalent.

use crate::cbor::{self, embed, map_get, require, text};
use crate::document::ElementSelection;
use crate::error::{MdocError, MdocResult};
use ciborium::value::Value;
use serde_json::json;
use std::collections::BTreeMap;
use wallet_core::PresentationDefinition;

/// One `ItemsRequest`: requested elements with their intent-to-retain flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemsRequest {
    pub doc_type: String,
    pub name_spaces: BTreeMap<String, BTreeMap<String, bool>>,
}

impl ItemsRequest {
    pub fn selection(&self) -> ElementSelection {
        self.name_spaces
            .iter()
            .map(|(ns, elements)| (ns.clone(), elements.keys().cloned().collect()))
            .collect()
    }

    fn from_value(value: &Value) -> MdocResult<Self> {
        let doc_type = cbor::as_text(require(value, "docType")?)
            .ok_or_else(|| MdocError::ProtocolError("docType is not text".into()))?
            .to_string();
        let mut name_spaces = BTreeMap::new();
        for (ns, elements) in cbor::as_map(require(value, "nameSpaces")?)? {
            let ns = cbor::as_text(ns)
                .ok_or_else(|| MdocError::ProtocolError("namespace is not text".into()))?;
            let mut requested = BTreeMap::new();
            for (element, retain) in cbor::as_map(elements)? {
                let element = cbor::as_text(element)
                    .ok_or_else(|| MdocError::ProtocolError("element is not text".into()))?;
                requested.insert(element.to_string(), matches!(retain, Value::Bool(true)));
            }
            name_spaces.insert(ns.to_string(), requested);
        }
        Ok(Self {
            doc_type,
            name_spaces,
        })
    }

    fn to_value(&self) -> Value {
        let name_spaces = self
            .name_spaces
            .iter()
            .map(|(ns, elements)| {
                (
                    text(ns),
                    Value::Map(
                        elements
                            .iter()
                            .map(|(e, retain)| (text(e), Value::Bool(*retain)))
                            .collect(),
                    ),
                )
            })
            .collect();
        Value::Map(vec![
            (text("docType"), text(&self.doc_type)),
            (text("nameSpaces"), Value::Map(name_spaces)),
        ])
    }

    /// Single-descriptor presentation definition asking for the same elements,
    /// with paths of the form `$['namespace']['element']`.
    pub fn to_presentation_definition(&self) -> MdocResult<PresentationDefinition> {
        let fields: Vec<_> = self
            .name_spaces
            .iter()
            .flat_map(|(ns, elements)| {
                elements.iter().map(move |(element, retain)| {
                    json!({
                        "name": element,
                        "path": [format!("$['{}']['{}']", ns, element)],
                        "intent_to_retain": retain,
                    })
                })
            })
            .collect();
        let definition = json!({
            "id": self.doc_type,
            "input_descriptors": [{
                "id": self.doc_type,
                "format": { "mso_mdoc": { "alg": ["ES256"] } },
                "constraints": {
                    "limit_disclosure": "required",
                    "fields": fields,
                },
            }],
        });
        Ok(serde_json::from_value(definition).map_err(wallet_core::CoreError::from)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    pub version: String,
    pub doc_requests: Vec<ItemsRequest>,
}

impl DeviceRequest {
    pub fn new(doc_requests: Vec<ItemsRequest>) -> Self {
        Self {
            version: "1.0".to_string(),
            doc_requests,
        }
    }

    pub fn parse(bytes: &[u8]) -> MdocResult<Self> {
        let value = cbor::decode(bytes)
            .map_err(|e| MdocError::ProtocolError(format!("device request: {}", e)))?;
        let version = map_get(&value, "version")
            .and_then(cbor::as_text)
            .unwrap_or("1.0")
            .to_string();
        let doc_requests = cbor::as_array(require(&value, "docRequests")?)?
            .iter()
            .map(|doc| ItemsRequest::from_value(&cbor::unembed(require(doc, "itemsRequest")?)?))
            .collect::<MdocResult<Vec<_>>>()?;
        Ok(Self {
            version,
            doc_requests,
        })
    }

    pub fn encode(&self) -> MdocResult<Vec<u8>> {
        let doc_requests = self
            .doc_requests
            .iter()
            .map(|items| {
                Ok(Value::Map(vec![(
                    text("itemsRequest"),
                    embed(&items.to_value())?,
                )]))
            })
            .collect::<MdocResult<Vec<_>>>()?;
        cbor::encode(&Value::Map(vec![
            (text("version"), text(&self.version)),
            (text("docRequests"), Value::Array(doc_requests)),
        ]))
    }

    /// The request for `doc_type`, or the first one when `doc_type` is `None`.
    pub fn items_for(&self, doc_type: Option<&str>) -> MdocResult<&ItemsRequest> {
        self.doc_requests
            .iter()
            .find(|r| doc_type.map_or(true, |d| r.doc_type == d))
            .ok_or_else(|| MdocError::ProtocolError("no matching document request".into()))
    }
}
