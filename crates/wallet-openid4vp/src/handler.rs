//! Wallet side of an OpenID4VP presentation: one verified request, one response.

use crate::error::{Oid4vpError, Oid4vpResult};
use crate::flow::{Consumed, FlowGeneration, FlowPhase, FlowState, FlowStore};
use crate::jwe;
use crate::log::{PresentationLog, PresentationRecord};
use crate::request::{verifier_domain, AuthorizationRequest};
use crate::sdjwt::SdJwt;
use crate::trust::{check_verifier_trust, verify_request_object, TlsCertificateSource, TrustPolicy};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wallet_core::{
    b64u_encode, presentation_frame, CredentialFormat, CredentialId, CredentialStore,
    DescriptorMapEntry, HttpClient, InputDescriptor, PresentationDefinition,
    PresentationSubmission, StorableCredential, Timestamp,
};
use wallet_keystore::jws::{key_binding_jwt, kid_from_sd_jwt_cnf};
use wallet_keystore::Signer;
use wallet_mdoc::{
    build_device_response, oid4vp_session_transcript, selection_for_descriptor, IssuerSigned,
};

const MDOC_NONCE_LEN: usize = 8;
const DEFAULT_RESPONSE_ENC: &str = "A256GCM";

/// Credentials that satisfy the request's only input descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorMatch {
    pub descriptor_id: String,
    pub credential_ids: Vec<CredentialId>,
    /// Field `name`, else its first path, in descriptor order.
    pub requested_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationMatch {
    pub descriptor: DescriptorMatch,
    pub verifier_domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    Sent { redirect_uri: Option<String> },
    /// The flow's nonce was already used; nothing was transmitted.
    AlreadySent,
}

struct BuiltPresentation {
    vp_token: String,
    format: CredentialFormat,
    credential_id: CredentialId,
    submission: PresentationSubmission,
    /// `apu`/`apv` for an encrypted response.
    party_info: Option<(Vec<u8>, Vec<u8>)>,
}

pub struct OpenId4VpHandler {
    http: Arc<dyn HttpClient>,
    credentials: Arc<dyn CredentialStore>,
    policy: TrustPolicy,
    tls: Option<Arc<dyn TlsCertificateSource>>,
    log: Option<Arc<dyn PresentationLog>>,
    flows: FlowStore,
}

impl OpenId4VpHandler {
    pub fn new(http: Arc<dyn HttpClient>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            http,
            credentials,
            policy: TrustPolicy::default(),
            tls: None,
            log: None,
            flows: FlowStore::new(),
        }
    }

    pub fn with_policy(mut self, policy: TrustPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_tls_source(mut self, source: Arc<dyn TlsCertificateSource>) -> Self {
        self.tls = Some(source);
        self
    }

    pub fn with_presentation_log(mut self, log: Arc<dyn PresentationLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn phase(&self) -> FlowPhase {
        self.flows.phase()
    }

    pub fn active_flow(&self) -> Option<FlowState> {
        self.flows.active()
    }

    // -----------------------------------------------------------------------
    // Request
    // -----------------------------------------------------------------------

    /// Parse, verify and match an authorization request.
    ///
    /// Replaces any active flow. On failure no flow is left active. When
    /// calls overlap, the most recently started one owns the flow and the
    /// others fail with `Superseded`.
    pub async fn handle_authorization_request(&self, url: &str) -> Oid4vpResult<AuthorizationMatch> {
        let generation = self.flows.begin()?;
        let result = self.process_request(url, generation).await;
        if let Err(e) = &result {
            warn!(error = %e, "authorization request rejected");
            self.flows.abandon(generation);
        }
        result
    }

    async fn process_request(
        &self,
        url: &str,
        generation: FlowGeneration,
    ) -> Oid4vpResult<AuthorizationMatch> {
        let mut request = AuthorizationRequest::from_url(url)?;

        if let Some(request_uri) = request.request_uri.clone() {
            let jwt = self
                .http
                .get(&request_uri)
                .await?
                .error_for_status(&request_uri)?
                .text()?;
            let object = verify_request_object(jwt.trim())?;
            // only the signed payload speaks for the verifier
            request = AuthorizationRequest {
                request_uri: Some(request_uri.clone()),
                ..AuthorizationRequest::from_request_object(&object.payload)?
            };
            check_verifier_trust(
                &request_uri,
                request.require_response_uri()?,
                &object,
                &self.policy,
                self.tls.as_deref(),
            )
            .await?;
        }
        self.flows.advance(generation, FlowPhase::Verified)?;

        let nonce = request.require_nonce()?.to_string();
        if let Err(e) = self.flows.check_nonce(&nonce) {
            warn!(nonce = %nonce, "nonce replayed");
            return Err(e);
        }

        let definition = self.presentation_definition(&request).await?;
        let descriptor = match definition.input_descriptors.as_slice() {
            [] => return Err(Oid4vpError::InsufficientCredentials),
            [descriptor] => descriptor.clone(),
            _ => return Err(Oid4vpError::OnlyOneInputDescriptorSupported),
        };

        let client_id = request.require_client_id()?.to_string();
        self.flows.store(
            generation,
            FlowState {
                presentation_definition: definition,
                nonce,
                response_uri: request.require_response_uri()?.to_string(),
                client_id: client_id.clone(),
                state: request.state.clone(),
                client_metadata: request.client_metadata.clone(),
            },
        )?;

        let mut credential_ids = Vec::new();
        for credential in self.credentials.list().await? {
            if conforms(&descriptor, &credential) {
                credential_ids.push(credential.id);
            }
        }
        if credential_ids.is_empty() {
            return Err(Oid4vpError::InsufficientCredentials);
        }
        self.flows.advance(generation, FlowPhase::Matched)?;
        info!(
            descriptor = %descriptor.id,
            conformant = credential_ids.len(),
            client_id = %client_id,
            "authorization request matched"
        );

        Ok(AuthorizationMatch {
            descriptor: DescriptorMatch {
                descriptor_id: descriptor.id.clone(),
                credential_ids,
                requested_fields: descriptor.requested_field_names(),
            },
            verifier_domain: verifier_domain(&client_id),
        })
    }

    async fn presentation_definition(
        &self,
        request: &AuthorizationRequest,
    ) -> Oid4vpResult<PresentationDefinition> {
        if let Some(definition) = &request.presentation_definition {
            return Ok(definition.clone());
        }
        let Some(uri) = &request.presentation_definition_uri else {
            return Err(Oid4vpError::MissingPresentationDefinition);
        };
        let body = self.http.get(uri).await?.error_for_status(uri)?.json()?;
        debug!(uri = %uri, "presentation definition fetched");
        serde_json::from_value(body)
            .map_err(|e| Oid4vpError::InvalidRequest(format!("presentation_definition_uri: {}", e)))
    }

    // -----------------------------------------------------------------------
    // Response
    // -----------------------------------------------------------------------

    /// Present the selected credential to the verifier of the active flow.
    ///
    /// `selection` maps the descriptor id to the chosen credential. The flow's
    /// nonce is consumed before anything is sent, so a second call for the same
    /// flow returns `AlreadySent` without transmitting.
    pub async fn send_authorization_response(
        &self,
        selection: &BTreeMap<String, CredentialId>,
        signer: &dyn Signer,
    ) -> Oid4vpResult<ResponseOutcome> {
        let flow = self.flows.active().ok_or(Oid4vpError::NoActiveFlow)?;
        if flow.nonce.is_empty() || self.flows.last_used_nonce().as_deref() == Some(flow.nonce.as_str()) {
            debug!("response already sent for this nonce");
            return Ok(ResponseOutcome::AlreadySent);
        }

        let built = self.build_presentation(&flow, selection, signer).await?;
        let fields = response_fields(&flow, &built)?;

        let flow = match self.flows.consume(&flow.nonce)? {
            Consumed::Flow(flow) => flow,
            Consumed::AlreadySent => return Ok(ResponseOutcome::AlreadySent),
        };

        let response = self
            .http
            .post_form(&flow.response_uri, &fields)
            .await?
            .error_for_status(&flow.response_uri)?;
        info!(
            client_id = %flow.client_id,
            format = %built.format,
            credential = %built.credential_id,
            "authorization response sent"
        );

        if let Some(log) = &self.log {
            log.record(PresentationRecord {
                presentation: built.vp_token,
                format: built.format,
                credential_ids: vec![built.credential_id],
                submission: built.submission,
                audience: flow.client_id.clone(),
                presented_at: Timestamp::now(),
            })
            .await?;
        }

        let redirect_uri = response
            .json()
            .ok()
            .and_then(|body| body.get("redirect_uri").and_then(Value::as_str).map(str::to_string));
        Ok(ResponseOutcome::Sent { redirect_uri })
    }

    async fn build_presentation(
        &self,
        flow: &FlowState,
        selection: &BTreeMap<String, CredentialId>,
        signer: &dyn Signer,
    ) -> Oid4vpResult<BuiltPresentation> {
        let entries: Vec<_> = selection.iter().collect();
        let [(descriptor_id, credential_id)] = entries.as_slice() else {
            return Err(Oid4vpError::InvalidSelection(format!(
                "expected one selected credential, got {}",
                selection.len()
            )));
        };
        let descriptor = flow
            .presentation_definition
            .input_descriptors
            .iter()
            .find(|d| d.id.as_str() == descriptor_id.as_str())
            .ok_or_else(|| Oid4vpError::InvalidSelection(format!("unknown descriptor {}", descriptor_id)))?;
        let credential = self
            .credentials
            .get(credential_id)
            .await?
            .ok_or_else(|| Oid4vpError::InvalidSelection(format!("unknown credential {}", credential_id)))?;

        let (vp_token, party_info) = match credential.format {
            CredentialFormat::SdJwtVc => {
                (present_sd_jwt(flow, descriptor, &credential, signer).await?, None)
            }
            CredentialFormat::MsoMdoc => {
                let mdoc_nonce: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(MDOC_NONCE_LEN)
                    .map(char::from)
                    .collect();
                let token = present_mdoc(flow, descriptor, &credential, &mdoc_nonce, signer).await?;
                (
                    token,
                    Some((mdoc_nonce.into_bytes(), flow.nonce.as_bytes().to_vec())),
                )
            }
        };

        let submission = PresentationSubmission {
            id: uuid::Uuid::new_v4().to_string(),
            definition_id: flow.presentation_definition.id.clone(),
            descriptor_map: vec![DescriptorMapEntry {
                id: descriptor.id.clone(),
                format: credential.format.as_str().to_string(),
                path: "$".into(),
            }],
        };
        Ok(BuiltPresentation {
            vp_token,
            format: credential.format,
            credential_id: credential.id,
            submission,
            party_info,
        })
    }
}

fn format_accepted(descriptor: &InputDescriptor, format: CredentialFormat) -> bool {
    if descriptor.format.is_empty() {
        return true;
    }
    match format {
        CredentialFormat::SdJwtVc => {
            descriptor.accepts_format("vc+sd-jwt") || descriptor.accepts_format("dc+sd-jwt")
        }
        CredentialFormat::MsoMdoc => descriptor.accepts_format(format.as_str()),
    }
}

/// Whether `credential` discloses every required field of `descriptor`.
/// Credentials that fail to parse never conform.
fn conforms(descriptor: &InputDescriptor, credential: &StorableCredential) -> bool {
    if !format_accepted(descriptor, credential.format) {
        return false;
    }
    let claims = match credential.format {
        CredentialFormat::SdJwtVc => SdJwt::parse(&credential.credential).and_then(|sd| sd.claims()),
        CredentialFormat::MsoMdoc => IssuerSigned::from_base64url(&credential.credential)
            .map(|doc| doc.claims())
            .map_err(Oid4vpError::from),
    };
    match claims {
        Ok(claims) => descriptor.is_satisfied_by(&claims),
        Err(e) => {
            debug!(credential = %credential.id, error = %e, "credential skipped");
            false
        }
    }
}

async fn present_sd_jwt(
    flow: &FlowState,
    descriptor: &InputDescriptor,
    credential: &StorableCredential,
    signer: &dyn Signer,
) -> Oid4vpResult<String> {
    let sd_jwt = SdJwt::parse(&credential.credential)?;
    let presentation = sd_jwt.present(&presentation_frame(&descriptor.all_paths()))?;
    let kid = kid_from_sd_jwt_cnf(&credential.credential)?;
    let kb_jwt = key_binding_jwt(
        signer,
        &kid,
        &presentation,
        &flow.nonce,
        &flow.client_id,
        Timestamp::now().seconds_since_epoch as i64,
    )
    .await?;
    Ok(format!("{}{}", presentation, kb_jwt))
}

async fn present_mdoc(
    flow: &FlowState,
    descriptor: &InputDescriptor,
    credential: &StorableCredential,
    mdoc_nonce: &str,
    signer: &dyn Signer,
) -> Oid4vpResult<String> {
    let issuer_signed = IssuerSigned::from_base64url(&credential.credential)?;
    let selection = selection_for_descriptor(descriptor);
    if !issuer_signed.contains_all(&selection) {
        return Err(Oid4vpError::InsufficientCredentials);
    }
    let transcript =
        oid4vp_session_transcript(&flow.client_id, &flow.response_uri, &flow.nonce, mdoc_nonce)?;
    let device_response =
        build_device_response(signer, &issuer_signed.restrict(&selection), &transcript).await?;
    Ok(b64u_encode(device_response))
}

/// Form fields for the POST: plain, or a single `response` JWE when the
/// verifier published an encryption key.
fn response_fields(flow: &FlowState, built: &BuiltPresentation) -> Oid4vpResult<Vec<(String, String)>> {
    let submission = serde_json::to_string(&built.submission)?;
    let metadata = flow.client_metadata.as_ref();
    if let Some((metadata, key)) = metadata.and_then(|m| m.encryption_key().map(|k| (m, k))) {
        let alg = metadata
            .authorization_encrypted_response_alg
            .as_deref()
            .unwrap_or_default();
        let enc = metadata
            .authorization_encrypted_response_enc
            .as_deref()
            .unwrap_or(DEFAULT_RESPONSE_ENC);
        let mut payload = json!({
            "vp_token": built.vp_token,
            "presentation_submission": built.submission,
        });
        if let Some(state) = &flow.state {
            payload["state"] = json!(state);
        }
        let (apu, apv) = match &built.party_info {
            Some((apu, apv)) => (Some(apu.as_slice()), Some(apv.as_slice())),
            None => (None, None),
        };
        let response = jwe::encrypt(&serde_json::to_vec(&payload)?, key, alg, enc, apu, apv)?;
        debug!(alg = %alg, enc = %enc, "response encrypted");
        return Ok(vec![("response".into(), response)]);
    }

    let mut fields = vec![
        ("vp_token".to_string(), built.vp_token.clone()),
        ("presentation_submission".to_string(), submission),
    ];
    if let Some(state) = &flow.state {
        fields.push(("state".into(), state.clone()));
    }
    Ok(fields)
}
