//! Verifier trust: request-object signatures, hostname binding, SAN and TLS pinning.

use crate::error::{Oid4vpError, Oid4vpResult};
use crate::request::hostname;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use wallet_core::HttpClient;
use x509_parser::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustPolicy {
    /// Require the response host among the signer certificate's SAN dNSNames.
    pub san_dns_check: bool,
    /// Require the live TLS certificate of the request host to equal `x5c[0]`.
    pub tls_cert_check: bool,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            san_dns_check: true,
            tls_cert_check: false,
        }
    }
}

/// A request object whose RS256 signature checked out against its `x5c` leaf.
#[derive(Debug, Clone)]
pub struct VerifiedRequestObject {
    pub payload: Value,
    /// Base64 (standard, padded) DER certificates as they appeared in the header.
    pub x5c: Vec<String>,
    pub leaf_der: Vec<u8>,
}

fn untrusted(reason: impl Into<String>) -> Oid4vpError {
    Oid4vpError::NontrustedVerifier(reason.into())
}

fn parse_certificate(der: &[u8]) -> Oid4vpResult<X509Certificate<'_>> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|e| untrusted(format!("signer certificate: {}", e)))
}

pub fn verify_request_object(jwt: &str) -> Oid4vpResult<VerifiedRequestObject> {
    let header = decode_header(jwt).map_err(|e| untrusted(format!("request object: {}", e)))?;
    if header.alg != Algorithm::RS256 {
        return Err(untrusted(format!("unsupported request object alg {:?}", header.alg)));
    }
    let x5c = header
        .x5c
        .filter(|chain| !chain.is_empty())
        .ok_or_else(|| untrusted("request object has no x5c"))?;
    let leaf_der = STANDARD
        .decode(&x5c[0])
        .map_err(|e| untrusted(format!("x5c[0] is not base64: {}", e)))?;

    let payload = {
        let cert = parse_certificate(&leaf_der)?;
        let key = DecodingKey::from_rsa_der(&cert.public_key().subject_public_key.data);
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        decode::<Value>(jwt, &key, &validation)
            .map_err(|e| untrusted(format!("request object signature: {}", e)))?
            .claims
    };
    Ok(VerifiedRequestObject {
        payload,
        x5c,
        leaf_der,
    })
}

/// dNSName entries of the certificate's subjectAltName extension.
pub fn san_dns_names(der: &[u8]) -> Oid4vpResult<Vec<String>> {
    let cert = parse_certificate(der)?;
    let san = cert
        .subject_alternative_name()
        .map_err(|e| untrusted(format!("subjectAltName: {}", e)))?;
    Ok(san
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default())
}

// ---------------------------------------------------------------------------
// TLS certificate pinning
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TlsCertificateSource: Send + Sync {
    /// The `x5c` chain served on the TLS endpoint of `url`.
    async fn certificate_chain(&self, url: &str) -> Oid4vpResult<Vec<String>>;
}

/// Looks certificates up through a backend helper endpoint
/// (`POST {"url": ...}` answering `{"x5c": [...]}`).
pub struct HelperTlsCertificateSource {
    http: Arc<dyn HttpClient>,
    helper_url: String,
    timeout: Duration,
}

impl HelperTlsCertificateSource {
    pub fn new(http: Arc<dyn HttpClient>, helper_url: impl Into<String>) -> Self {
        Self {
            http,
            helper_url: helper_url.into(),
            timeout: Duration::from_millis(2500),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl TlsCertificateSource for HelperTlsCertificateSource {
    async fn certificate_chain(&self, url: &str) -> Oid4vpResult<Vec<String>> {
        let body = json!({ "url": url });
        let response = tokio::time::timeout(self.timeout, self.http.post_json(&self.helper_url, &body))
            .await
            .map_err(|_| Oid4vpError::TlsCertificate(format!("helper timed out for {}", url)))??
            .error_for_status(&self.helper_url)?;
        let chain = response.json()?;
        chain
            .get("x5c")
            .and_then(Value::as_array)
            .map(|certs| {
                certs
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .ok_or_else(|| Oid4vpError::TlsCertificate("helper response has no x5c".into()))
    }
}

/// Enforce the trust rules for a request fetched from `request_uri`.
pub async fn check_verifier_trust(
    request_uri: &str,
    response_uri: &str,
    object: &VerifiedRequestObject,
    policy: &TrustPolicy,
    tls: Option<&dyn TlsCertificateSource>,
) -> Oid4vpResult<()> {
    let request_host = hostname(request_uri)?;
    let response_host = hostname(response_uri)?;
    if request_host != response_host {
        warn!(request_host = %request_host, response_host = %response_host, "request_uri and response_uri hosts differ");
        return Err(untrusted(format!(
            "request_uri host {} differs from response_uri host {}",
            request_host, response_host
        )));
    }

    if policy.san_dns_check {
        let names = san_dns_names(&object.leaf_der)?;
        if names.is_empty() {
            warn!(host = %response_host, "signer certificate has no SAN dNSName");
            return Err(untrusted("signer certificate has no SAN dNSName"));
        }
        if !names.iter().any(|n| n.eq_ignore_ascii_case(&response_host)) {
            warn!(host = %response_host, san = ?names, "host not in signer SAN");
            return Err(untrusted(format!("{} is not in the signer SAN list", response_host)));
        }
    }

    if policy.tls_cert_check {
        let source = tls.ok_or_else(|| {
            Oid4vpError::TlsCertificate("no TLS certificate source configured".into())
        })?;
        let chain = source.certificate_chain(request_uri).await?;
        if chain.first() != object.x5c.first() {
            warn!(host = %request_host, "TLS certificate does not match request signer");
            return Err(untrusted("TLS certificate does not match request signer"));
        }
    }

    debug!(host = %response_host, "verifier trusted");
    Ok(())
}
