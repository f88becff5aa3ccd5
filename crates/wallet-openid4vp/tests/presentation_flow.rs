//! Wallet/verifier presentation exchanges against a recording HTTP client.

use async_trait::async_trait;
use ciborium::value::Value as Cbor;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use p256::ecdsa::SigningKey;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use url::Url;
use wallet_core::{
    b64u_decode, b64u_encode, CoreResult, CredentialFormat, CredentialId, EcJwk, HttpClient,
    HttpResponse, InMemoryCredentialStore, StorableCredential, Timestamp,
};
use wallet_keystore::encapsulation::{generate_secret_key, public_key_bytes};
use wallet_keystore::jws::decode_payload_unverified;
use wallet_keystore::kdf::KdfParams;
use wallet_keystore::signer::verify_es256;
use wallet_keystore::{
    AutoConfirm, CredentialSigner, InMemoryContainerStore, KeyCustodyStore, KeystoreSettings,
    MockAuthenticator, Signer,
};
use wallet_mdoc::{oid4vp_session_transcript, DeviceResponse, IssuerSignedBuilder, DEFAULT_DOC_TYPE};
use wallet_openid4vp::{
    jwe, FlowPhase, InMemoryPresentationLog, Oid4vpError, OpenId4VpHandler, ResponseOutcome,
    SdJwt, SdJwtIssuer, TrustPolicy,
};

const VERIFIER_KEY: &str = include_str!("fixtures/verifier.key.pem");
const VERIFIER_CERT: &str = include_str!("fixtures/verifier.cert.pem");
const OTHER_KEY: &str = include_str!("fixtures/other.key.pem");
const OTHER_CERT: &str = include_str!("fixtures/other.cert.pem");

const NS: &str = "eu.europa.ec.eudi.pid.1";
const CLIENT_ID: &str = "https://verifier.example";
const RESPONSE_URI: &str = "https://verifier.example/cb";
const REQUEST_URI: &str = "https://verifier.example/request/1";

// ---------------------------------------------------------------------------
// Verifier side
// ---------------------------------------------------------------------------

/// Serves fixed GET bodies and records every form POST.
#[derive(Default)]
struct VerifierHttp {
    pages: Mutex<HashMap<String, String>>,
    posts: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl VerifierHttp {
    fn serve(&self, url: &str, body: impl Into<String>) {
        self.pages.lock().unwrap().insert(url.to_string(), body.into());
    }

    fn posts(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.posts.lock().unwrap().clone()
    }

    fn last_fields(&self) -> HashMap<String, String> {
        self.posts().last().unwrap().1.iter().cloned().collect()
    }
}

#[async_trait]
impl HttpClient for VerifierHttp {
    async fn get(&self, url: &str) -> CoreResult<HttpResponse> {
        let body = self.pages.lock().unwrap().get(url).cloned();
        Ok(match body {
            Some(body) => HttpResponse {
                status: 200,
                content_type: None,
                body: body.into_bytes(),
            },
            None => HttpResponse {
                status: 404,
                content_type: None,
                body: vec![],
            },
        })
    }

    async fn post_form(&self, url: &str, fields: &[(String, String)]) -> CoreResult<HttpResponse> {
        self.posts
            .lock()
            .unwrap()
            .push((url.to_string(), fields.to_vec()));
        Ok(HttpResponse {
            status: 200,
            content_type: Some("application/json".into()),
            body: br#"{"redirect_uri":"https://verifier.example/done"}"#.to_vec(),
        })
    }

    async fn post_json(&self, _url: &str, _body: &Value) -> CoreResult<HttpResponse> {
        Ok(HttpResponse {
            status: 404,
            content_type: None,
            body: vec![],
        })
    }
}

fn cert_b64(pem: &str) -> String {
    pem.lines().filter(|l| !l.starts_with("-----")).collect()
}

fn request_object(key_pem: &str, cert_pem: &str, payload: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.x5c = Some(vec![cert_b64(cert_pem)]);
    encode(
        &header,
        payload,
        &EncodingKey::from_rsa_pem(key_pem.as_bytes()).unwrap(),
    )
    .unwrap()
}

fn sd_jwt_definition() -> Value {
    json!({
        "id": "pid-request",
        "input_descriptors": [{
            "id": "pid",
            "format": { "vc+sd-jwt": {} },
            "constraints": {
                "limit_disclosure": "required",
                "fields": [
                    { "path": ["$.family_name"], "name": "Family name" },
                    { "path": ["$.age_over_18"] }
                ]
            }
        }]
    })
}

fn mdoc_definition() -> Value {
    json!({
        "id": "mdl-request",
        "input_descriptors": [{
            "id": DEFAULT_DOC_TYPE,
            "format": { "mso_mdoc": { "alg": ["ES256"] } },
            "constraints": {
                "limit_disclosure": "required",
                "fields": [{ "path": [format!("$['{}']['family_name']", NS)], "intent_to_retain": false }]
            }
        }]
    })
}

fn by_value_url(definition: &Value, nonce: &str, client_metadata: Option<&Value>) -> String {
    let mut url = Url::parse("openid4vp://authorize").unwrap();
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("client_id", CLIENT_ID)
            .append_pair("response_uri", RESPONSE_URI)
            .append_pair("nonce", nonce)
            .append_pair("state", "state-1")
            .append_pair("presentation_definition", &definition.to_string());
        if let Some(metadata) = client_metadata {
            query.append_pair("client_metadata", &metadata.to_string());
        }
    }
    url.to_string()
}

fn by_reference_url() -> String {
    let mut url = Url::parse("openid4vp://authorize").unwrap();
    url.query_pairs_mut()
        .append_pair("client_id", "verifier.example")
        .append_pair("request_uri", REQUEST_URI);
    url.to_string()
}

// ---------------------------------------------------------------------------
// Holder side
// ---------------------------------------------------------------------------

struct Holder {
    signer: CredentialSigner,
    holder_jwk: EcJwk,
    credentials: Arc<InMemoryCredentialStore>,
}

async fn holder() -> Holder {
    let store = Arc::new(InMemoryContainerStore::new());
    let settings = KeystoreSettings {
        rp_id: "wallet.example".into(),
        kdf: KdfParams::insecure_for_tests(10),
        ..KeystoreSettings::default()
    };
    let keystore = KeyCustodyStore::new(
        store.clone(),
        Arc::new(MockAuthenticator::new([3; 32])),
        settings,
    );
    let (unlocked, commit) = keystore.init_password("pw").await.unwrap();
    commit.apply(store.as_ref()).await.unwrap();
    let (unlocked, _, kids) = keystore.generate_credential_keypairs(&unlocked, 1).unwrap();
    let signer = keystore.signer(&unlocked, Arc::new(AutoConfirm));
    let holder_jwk = signer.public_jwk(&kids[0]).unwrap();

    let issuer = SigningKey::from(&generate_secret_key());
    let sd_jwt = SdJwtIssuer::new(issuer.clone())
        .issue(
            json!({ "iss": "https://issuer.example", "vct": "urn:eu.europa.ec.eudi:pid:1" }),
            &[
                ("family_name", json!("Doe")),
                ("given_name", json!("Jane")),
                ("birth_date", json!("1990-01-01")),
                ("age_over_18", json!(true)),
            ],
            &holder_jwk,
        )
        .unwrap();
    let mdoc = IssuerSignedBuilder::new(DEFAULT_DOC_TYPE, holder_jwk.to_sec1_uncompressed().unwrap())
        .element(NS, "family_name", Cbor::Text("Doe".into()))
        .element(NS, "given_name", Cbor::Text("Jane".into()))
        .element(NS, "age_over_18", Cbor::Bool(true))
        .sign(&issuer)
        .unwrap();

    let credentials = Arc::new(InMemoryCredentialStore::with_credentials(vec![
        StorableCredential {
            id: CredentialId::new("pid-sd-jwt"),
            format: CredentialFormat::SdJwtVc,
            credential: sd_jwt,
            issuance_date: Timestamp::now(),
        },
        StorableCredential {
            id: CredentialId::new("pid-mdoc"),
            format: CredentialFormat::MsoMdoc,
            credential: b64u_encode(mdoc.encode().unwrap()),
            issuance_date: Timestamp::now(),
        },
    ]));
    Holder {
        signer,
        holder_jwk,
        credentials,
    }
}

fn handler(http: &Arc<VerifierHttp>, holder: &Holder) -> OpenId4VpHandler {
    OpenId4VpHandler::new(http.clone(), holder.credentials.clone())
}

fn select(descriptor: &str, credential: &str) -> BTreeMap<String, CredentialId> {
    BTreeMap::from([(descriptor.to_string(), CredentialId::new(credential))])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_by_value_request_presents_minimal_sd_jwt() {
    let holder = holder().await;
    let http = Arc::new(VerifierHttp::default());
    let handler = handler(&http, &holder);

    let matched = handler
        .handle_authorization_request(&by_value_url(&sd_jwt_definition(), "n-1", None))
        .await
        .unwrap();
    assert_eq!(matched.descriptor.descriptor_id, "pid");
    assert_eq!(matched.descriptor.credential_ids, vec![CredentialId::new("pid-sd-jwt")]);
    assert_eq!(
        matched.descriptor.requested_fields,
        vec!["Family name".to_string(), "$.age_over_18".to_string()]
    );
    assert_eq!(matched.verifier_domain, "verifier.example");
    assert_eq!(handler.phase(), FlowPhase::Matched);

    let outcome = handler
        .send_authorization_response(&select("pid", "pid-sd-jwt"), &holder.signer)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ResponseOutcome::Sent {
            redirect_uri: Some("https://verifier.example/done".into())
        }
    );

    let posts = http.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].0, RESPONSE_URI);
    let fields = http.last_fields();
    assert_eq!(fields["state"], "state-1");
    let submission: Value = serde_json::from_str(&fields["presentation_submission"]).unwrap();
    assert_eq!(submission["definition_id"], "pid-request");
    assert_eq!(submission["descriptor_map"][0]["id"], "pid");
    assert_eq!(submission["descriptor_map"][0]["format"], "vc+sd-jwt");
    assert_eq!(submission["descriptor_map"][0]["path"], "$");

    // only the requested claims are disclosed
    let vp = SdJwt::parse(&fields["vp_token"]).unwrap();
    let mut names: Vec<_> = vp.disclosures.iter().filter_map(|d| d.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["age_over_18", "family_name"]);
    let claims = vp.claims().unwrap();
    assert!(claims.get("given_name").is_none());

    // key binding over the presentation, for this verifier and nonce
    let kb_jwt = vp.key_binding_jwt.clone().unwrap();
    let kb = decode_payload_unverified(&kb_jwt).unwrap();
    assert_eq!(kb["nonce"], "n-1");
    assert_eq!(kb["aud"], CLIENT_ID);
    let (signing_input, signature) = kb_jwt.rsplit_once('.').unwrap();
    assert!(verify_es256(
        &holder.holder_jwk,
        signing_input.as_bytes(),
        &b64u_decode(signature).unwrap()
    ));
}

#[tokio::test]
async fn test_response_is_sent_exactly_once() {
    let holder = holder().await;
    let http = Arc::new(VerifierHttp::default());
    let handler = handler(&http, &holder);
    handler
        .handle_authorization_request(&by_value_url(&sd_jwt_definition(), "n-once", None))
        .await
        .unwrap();

    let selection = select("pid", "pid-sd-jwt");
    let first = handler
        .send_authorization_response(&selection, &holder.signer)
        .await
        .unwrap();
    assert!(matches!(first, ResponseOutcome::Sent { .. }));
    let second = handler
        .send_authorization_response(&selection, &holder.signer)
        .await
        .unwrap();
    assert_eq!(second, ResponseOutcome::AlreadySent);
    assert_eq!(http.posts().len(), 1);
    assert_eq!(handler.phase(), FlowPhase::ResponseSent);
}

#[tokio::test]
async fn test_replayed_nonce_is_rejected() {
    let holder = holder().await;
    let http = Arc::new(VerifierHttp::default());
    let handler = handler(&http, &holder);
    let url = by_value_url(&sd_jwt_definition(), "n-replay", None);
    handler.handle_authorization_request(&url).await.unwrap();
    handler
        .send_authorization_response(&select("pid", "pid-sd-jwt"), &holder.signer)
        .await
        .unwrap();

    assert!(matches!(
        handler.handle_authorization_request(&url).await,
        Err(Oid4vpError::NonceReplay)
    ));
    assert!(handler.active_flow().is_none());

    // a fresh nonce starts a new flow
    handler
        .handle_authorization_request(&by_value_url(&sd_jwt_definition(), "n-fresh", None))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_signed_request_from_listed_host_is_trusted() {
    let holder = holder().await;
    let http = Arc::new(VerifierHttp::default());
    http.serve(
        REQUEST_URI,
        request_object(
            VERIFIER_KEY,
            VERIFIER_CERT,
            &json!({
                "client_id": "verifier.example",
                "response_uri": "verifier.example/cb",
                "nonce": "n-signed",
                "presentation_definition": sd_jwt_definition(),
            }),
        ),
    );
    let handler = handler(&http, &holder);

    let matched = handler
        .handle_authorization_request(&by_reference_url())
        .await
        .unwrap();
    assert_eq!(matched.verifier_domain, "verifier.example");
    let flow = handler.active_flow().unwrap();
    assert_eq!(flow.response_uri, RESPONSE_URI);
    assert_eq!(flow.nonce, "n-signed");
}

#[tokio::test]
async fn test_certificate_without_host_in_san() {
    let holder = holder().await;
    let http = Arc::new(VerifierHttp::default());
    http.serve(
        REQUEST_URI,
        request_object(
            OTHER_KEY,
            OTHER_CERT,
            &json!({
                "client_id": "verifier.example",
                "response_uri": RESPONSE_URI,
                "nonce": "n-san",
                "presentation_definition": sd_jwt_definition(),
            }),
        ),
    );

    let checked = handler(&http, &holder);
    assert!(matches!(
        checked.handle_authorization_request(&by_reference_url()).await,
        Err(Oid4vpError::NontrustedVerifier(_))
    ));
    assert_eq!(checked.phase(), FlowPhase::Idle);
    assert!(http.posts().is_empty());

    let unchecked = handler(&http, &holder).with_policy(TrustPolicy {
        san_dns_check: false,
        tls_cert_check: false,
    });
    unchecked
        .handle_authorization_request(&by_reference_url())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_response_host_must_match_request_host() {
    let holder = holder().await;
    let http = Arc::new(VerifierHttp::default());
    http.serve(
        REQUEST_URI,
        request_object(
            VERIFIER_KEY,
            VERIFIER_CERT,
            &json!({
                "client_id": "verifier.example",
                "response_uri": "https://collector.example/cb",
                "nonce": "n-host",
                "presentation_definition": sd_jwt_definition(),
            }),
        ),
    );
    let handler = handler(&http, &holder).with_policy(TrustPolicy {
        san_dns_check: false,
        tls_cert_check: false,
    });
    assert!(matches!(
        handler.handle_authorization_request(&by_reference_url()).await,
        Err(Oid4vpError::NontrustedVerifier(_))
    ));
}

#[tokio::test]
async fn test_tampered_request_object_is_untrusted() {
    let holder = holder().await;
    let http = Arc::new(VerifierHttp::default());
    let jwt = request_object(
        VERIFIER_KEY,
        VERIFIER_CERT,
        &json!({ "client_id": "verifier.example", "response_uri": RESPONSE_URI, "nonce": "n" }),
    );
    let mut parts: Vec<String> = jwt.split('.').map(str::to_string).collect();
    parts[1] = b64u_encode(
        json!({ "client_id": "verifier.example", "response_uri": RESPONSE_URI, "nonce": "other" })
            .to_string(),
    );
    http.serve(REQUEST_URI, parts.join("."));

    assert!(matches!(
        handler(&http, &holder)
            .handle_authorization_request(&by_reference_url())
            .await,
        Err(Oid4vpError::NontrustedVerifier(_))
    ));
}

fn by_reference_url_with(extra: &[(&str, String)]) -> String {
    let mut url = Url::parse(&by_reference_url()).unwrap();
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in extra {
            query.append_pair(key, value);
        }
    }
    url.to_string()
}

#[tokio::test]
async fn test_query_cannot_supply_what_the_request_object_omits() {
    let holder = holder().await;
    let http = Arc::new(VerifierHttp::default());
    http.serve(
        REQUEST_URI,
        request_object(
            VERIFIER_KEY,
            VERIFIER_CERT,
            &json!({
                "client_id": "verifier.example",
                "response_uri": RESPONSE_URI,
                "nonce": "n-omitted",
            }),
        ),
    );
    let handler = handler(&http, &holder);

    let url = by_reference_url_with(&[
        ("presentation_definition", sd_jwt_definition().to_string()),
        ("state", "unsigned-state".into()),
    ]);
    assert!(matches!(
        handler.handle_authorization_request(&url).await,
        Err(Oid4vpError::MissingPresentationDefinition)
    ));
    assert!(handler.active_flow().is_none());
    assert_eq!(handler.phase(), FlowPhase::Idle);
}

#[tokio::test]
async fn test_signed_request_ignores_unsigned_query_values() {
    let holder = holder().await;
    let http = Arc::new(VerifierHttp::default());
    http.serve(
        REQUEST_URI,
        request_object(
            VERIFIER_KEY,
            VERIFIER_CERT,
            &json!({
                "client_id": "verifier.example",
                "response_uri": RESPONSE_URI,
                "nonce": "n-signed-only",
                "presentation_definition": sd_jwt_definition(),
            }),
        ),
    );
    let handler = handler(&http, &holder);

    let metadata = json!({
        "authorization_encrypted_response_alg": "ECDH-ES",
        "jwks": { "keys": [{ "kty": "EC", "crv": "P-256", "x": "AA", "y": "AA" }] }
    });
    let url = by_reference_url_with(&[
        ("state", "unsigned-state".into()),
        ("nonce", "unsigned-nonce".into()),
        ("client_metadata", metadata.to_string()),
    ]);
    handler.handle_authorization_request(&url).await.unwrap();

    let flow = handler.active_flow().unwrap();
    assert_eq!(flow.nonce, "n-signed-only");
    assert_eq!(flow.state, None);
    assert_eq!(flow.client_metadata, None);
    assert_eq!(flow.presentation_definition.id, "pid-request");
}

/// Holds every GET until released.
struct GatedHttp {
    inner: Arc<VerifierHttp>,
    gate: tokio::sync::Notify,
}

#[async_trait]
impl HttpClient for GatedHttp {
    async fn get(&self, url: &str) -> CoreResult<HttpResponse> {
        self.gate.notified().await;
        self.inner.get(url).await
    }

    async fn post_form(&self, url: &str, fields: &[(String, String)]) -> CoreResult<HttpResponse> {
        self.inner.post_form(url, fields).await
    }

    async fn post_json(&self, url: &str, body: &Value) -> CoreResult<HttpResponse> {
        self.inner.post_json(url, body).await
    }
}

#[tokio::test]
async fn test_overlapping_requests_latest_owns_the_flow() {
    let holder = holder().await;
    let inner = Arc::new(VerifierHttp::default());
    inner.serve(
        REQUEST_URI,
        request_object(
            VERIFIER_KEY,
            VERIFIER_CERT,
            &json!({
                "client_id": "verifier.example",
                "response_uri": RESPONSE_URI,
                "nonce": "n-first",
                "presentation_definition": sd_jwt_definition(),
            }),
        ),
    );
    let http = Arc::new(GatedHttp {
        inner: inner.clone(),
        gate: tokio::sync::Notify::new(),
    });
    let handler = OpenId4VpHandler::new(http.clone(), holder.credentials.clone());

    let first_url = by_reference_url();
    let (first, second) = tokio::join!(
        handler.handle_authorization_request(&first_url),
        async {
            let second = handler
                .handle_authorization_request(&by_value_url(&sd_jwt_definition(), "n-second", None))
                .await;
            http.gate.notify_one();
            second
        }
    );
    assert!(matches!(first, Err(Oid4vpError::Superseded)));
    second.unwrap();

    let flow = handler.active_flow().unwrap();
    assert_eq!(flow.nonce, "n-second");
    assert_eq!(handler.phase(), FlowPhase::Matched);
}

#[tokio::test]
async fn test_definition_fetched_by_reference() {
    let holder = holder().await;
    let http = Arc::new(VerifierHttp::default());
    http.serve("https://verifier.example/pd/1", sd_jwt_definition().to_string());
    let mut url = Url::parse("openid4vp://authorize").unwrap();
    url.query_pairs_mut()
        .append_pair("client_id", "verifier.example")
        .append_pair("response_uri", RESPONSE_URI)
        .append_pair("nonce", "n-pd")
        .append_pair("presentation_definition_uri", "https://verifier.example/pd/1");

    let matched = handler(&http, &holder)
        .handle_authorization_request(url.as_str())
        .await
        .unwrap();
    assert_eq!(matched.descriptor.descriptor_id, "pid");
    assert_eq!(matched.verifier_domain, "verifier.example");
}

#[tokio::test]
async fn test_request_shape_errors() {
    let holder = holder().await;
    let http = Arc::new(VerifierHttp::default());
    let handler = handler(&http, &holder);

    let mut url = Url::parse("openid4vp://authorize").unwrap();
    url.query_pairs_mut()
        .append_pair("client_id", CLIENT_ID)
        .append_pair("response_uri", RESPONSE_URI)
        .append_pair("nonce", "n-nopd");
    assert!(matches!(
        handler.handle_authorization_request(url.as_str()).await,
        Err(Oid4vpError::MissingPresentationDefinition)
    ));

    let mut two = sd_jwt_definition();
    let second = two["input_descriptors"][0].clone();
    two["input_descriptors"].as_array_mut().unwrap().push(second);
    assert!(matches!(
        handler
            .handle_authorization_request(&by_value_url(&two, "n-two", None))
            .await,
        Err(Oid4vpError::OnlyOneInputDescriptorSupported)
    ));

    let mut unmet = sd_jwt_definition();
    unmet["input_descriptors"][0]["constraints"]["fields"][1]["path"] = json!(["$.nationality"]);
    assert!(matches!(
        handler
            .handle_authorization_request(&by_value_url(&unmet, "n-unmet", None))
            .await,
        Err(Oid4vpError::InsufficientCredentials)
    ));
    assert!(handler.active_flow().is_none());
    assert!(matches!(
        handler
            .send_authorization_response(&select("pid", "pid-sd-jwt"), &holder.signer)
            .await,
        Err(Oid4vpError::NoActiveFlow)
    ));
}

#[tokio::test]
async fn test_unknown_selection_sends_nothing() {
    let holder = holder().await;
    let http = Arc::new(VerifierHttp::default());
    let handler = handler(&http, &holder);
    handler
        .handle_authorization_request(&by_value_url(&sd_jwt_definition(), "n-sel", None))
        .await
        .unwrap();

    assert!(matches!(
        handler
            .send_authorization_response(&select("pid", "missing"), &holder.signer)
            .await,
        Err(Oid4vpError::InvalidSelection(_))
    ));
    assert!(http.posts().is_empty());

    // the flow is still open for a valid selection
    handler
        .send_authorization_response(&select("pid", "pid-sd-jwt"), &holder.signer)
        .await
        .unwrap();
    assert_eq!(http.posts().len(), 1);
}

#[tokio::test]
async fn test_encrypted_mdoc_response() {
    let holder = holder().await;
    let http = Arc::new(VerifierHttp::default());
    let log = Arc::new(InMemoryPresentationLog::new());
    let handler = handler(&http, &holder).with_presentation_log(log.clone());

    let verifier_secret = generate_secret_key();
    let verifier_jwk = EcJwk::from_sec1_uncompressed(&public_key_bytes(&verifier_secret))
        .unwrap()
        .with_kid("enc-1");
    let metadata = json!({
        "authorization_encrypted_response_alg": "ECDH-ES",
        "authorization_encrypted_response_enc": "A256GCM",
        "jwks": { "keys": [verifier_jwk] },
    });

    let matched = handler
        .handle_authorization_request(&by_value_url(&mdoc_definition(), "n-mdoc", Some(&metadata)))
        .await
        .unwrap();
    assert_eq!(matched.descriptor.credential_ids, vec![CredentialId::new("pid-mdoc")]);

    handler
        .send_authorization_response(&select(DEFAULT_DOC_TYPE, "pid-mdoc"), &holder.signer)
        .await
        .unwrap();

    let fields = http.last_fields();
    assert_eq!(fields.len(), 1);
    let (header, plaintext) = jwe::decrypt(&fields["response"], &verifier_secret).unwrap();
    assert_eq!(header["kid"], "enc-1");
    assert_eq!(header["apv"], b64u_encode("n-mdoc"));
    let mdoc_nonce = String::from_utf8(b64u_decode(header["apu"].as_str().unwrap()).unwrap()).unwrap();
    assert_eq!(mdoc_nonce.len(), 8);

    let body: Value = serde_json::from_slice(&plaintext).unwrap();
    assert_eq!(body["state"], "state-1");
    assert_eq!(body["presentation_submission"]["descriptor_map"][0]["format"], "mso_mdoc");

    let response =
        DeviceResponse::parse(&b64u_decode(body["vp_token"].as_str().unwrap()).unwrap()).unwrap();
    let transcript = oid4vp_session_transcript(CLIENT_ID, RESPONSE_URI, "n-mdoc", &mdoc_nonce).unwrap();
    assert!(response.verify_device_signatures(&transcript).unwrap());
    let (disclosed, _) = &response.documents[0];
    disclosed.verify_digests().unwrap();
    let claims = disclosed.claims();
    assert_eq!(claims[NS]["family_name"], "Doe");
    assert!(claims[NS].get("given_name").is_none());

    let records = log.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].format, CredentialFormat::MsoMdoc);
    assert_eq!(records[0].audience, CLIENT_ID);
    assert_eq!(records[0].credential_ids, vec![CredentialId::new("pid-mdoc")]);
}
