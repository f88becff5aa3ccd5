//! Authorization request parameters, by value or from a request object.

use crate::error::{Oid4vpError, Oid4vpResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use wallet_core::PresentationDefinition;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Jwks {
    #[serde(default)]
    pub keys: Vec<Value>,
}

/// The subset of verifier metadata the wallet acts on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_encrypted_response_alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_encrypted_response_enc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks: Option<Jwks>,
}

impl ClientMetadata {
    /// The verifier's response encryption key, when it asked for an encrypted response.
    pub fn encryption_key(&self) -> Option<&Value> {
        self.authorization_encrypted_response_alg.as_ref()?;
        self.jwks.as_ref()?.keys.first()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthorizationRequest {
    pub client_id: Option<String>,
    pub response_uri: Option<String>,
    pub nonce: Option<String>,
    pub state: Option<String>,
    pub presentation_definition: Option<PresentationDefinition>,
    pub presentation_definition_uri: Option<String>,
    pub client_metadata: Option<ClientMetadata>,
    pub request_uri: Option<String>,
}

impl AuthorizationRequest {
    /// Parse the query of an `openid4vp://` (or any scheme) authorization URL.
    pub fn from_url(url: &str) -> Oid4vpResult<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| Oid4vpError::InvalidRequest(format!("{}: {}", url, e)))?;
        let mut request = AuthorizationRequest::default();
        let mut redirect_uri = None;
        for (key, value) in parsed.query_pairs() {
            let value = value.into_owned();
            match key.as_ref() {
                "client_id" => request.client_id = Some(value),
                "response_uri" => request.response_uri = Some(value),
                "redirect_uri" => redirect_uri = Some(value),
                "nonce" => request.nonce = Some(value),
                "state" => request.state = Some(value),
                "presentation_definition" => {
                    request.presentation_definition = Some(serde_json::from_str(&value).map_err(
                        |e| Oid4vpError::InvalidRequest(format!("presentation_definition: {}", e)),
                    )?)
                }
                "presentation_definition_uri" => request.presentation_definition_uri = Some(value),
                "client_metadata" => {
                    request.client_metadata = Some(serde_json::from_str(&value).map_err(|e| {
                        Oid4vpError::InvalidRequest(format!("client_metadata: {}", e))
                    })?)
                }
                "request_uri" => request.request_uri = Some(value),
                _ => {}
            }
        }
        request.response_uri = request
            .response_uri
            .or(redirect_uri)
            .map(|uri| normalize_response_uri(&uri));
        Ok(request)
    }

    /// Build from the verified payload of a request object.
    pub fn from_request_object(payload: &Value) -> Oid4vpResult<Self> {
        let text = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);
        let presentation_definition = match payload.get("presentation_definition") {
            Some(Value::Null) | None => None,
            Some(pd) => Some(serde_json::from_value(pd.clone()).map_err(|e| {
                Oid4vpError::InvalidRequest(format!("presentation_definition: {}", e))
            })?),
        };
        let client_metadata = match payload.get("client_metadata") {
            Some(Value::Null) | None => None,
            Some(cm) => Some(serde_json::from_value(cm.clone()).map_err(|e| {
                Oid4vpError::InvalidRequest(format!("client_metadata: {}", e))
            })?),
        };
        Ok(AuthorizationRequest {
            client_id: text("client_id"),
            response_uri: text("response_uri")
                .or_else(|| text("redirect_uri"))
                .map(|uri| normalize_response_uri(&uri)),
            nonce: text("nonce"),
            state: text("state"),
            presentation_definition,
            presentation_definition_uri: text("presentation_definition_uri"),
            client_metadata,
            request_uri: None,
        })
    }

    pub fn require_client_id(&self) -> Oid4vpResult<&str> {
        self.client_id
            .as_deref()
            .ok_or_else(|| Oid4vpError::InvalidRequest("missing client_id".into()))
    }

    pub fn require_response_uri(&self) -> Oid4vpResult<&str> {
        self.response_uri
            .as_deref()
            .ok_or_else(|| Oid4vpError::InvalidRequest("missing response_uri".into()))
    }

    pub fn require_nonce(&self) -> Oid4vpResult<&str> {
        self.nonce
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Oid4vpError::InvalidRequest("missing nonce".into()))
    }
}

/// Prefix `https://` onto a response URI given without a scheme.
pub fn normalize_response_uri(uri: &str) -> String {
    if uri.starts_with("http") {
        uri.to_string()
    } else {
        format!("https://{}", uri)
    }
}

pub fn hostname(uri: &str) -> Oid4vpResult<String> {
    Url::parse(uri)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .ok_or_else(|| Oid4vpError::InvalidRequest(format!("no hostname in {}", uri)))
}

/// Name shown to the holder: the host of a URL `client_id`, else the id itself.
pub fn verifier_domain(client_id: &str) -> String {
    if client_id.contains("http") {
        if let Ok(host) = hostname(client_id) {
            return host;
        }
    }
    client_id.to_string()
}
