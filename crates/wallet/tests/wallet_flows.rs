//! Wallet orchestration against a container file in a scratch directory.

use async_trait::async_trait;
use p256::ecdsa::SigningKey;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;
use wallet::{NoPlatformAuthenticator, RootError, Wallet, WalletConfig};
use wallet_core::{
    CoreResult, CredentialFormat, CredentialId, HttpClient, HttpResponse, InMemoryCredentialStore,
    StorableCredential, Timestamp,
};
use wallet_keystore::encapsulation::generate_secret_key;
use wallet_keystore::jws::decode_payload_unverified;
use wallet_keystore::kdf::KdfParams;
use wallet_keystore::{KeystoreError, KeystoreSettings, Signer, UnlockMethodInfo};
use wallet_mdoc::{LoopbackTransport, MdocError, ProximityState};
use wallet_openid4vp::{ResponseOutcome, SdJwt, SdJwtIssuer};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

struct Scratch(PathBuf);

impl Scratch {
    fn new() -> Self {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("wallet-flows-{}-{}", std::process::id(), n));
        std::fs::create_dir_all(&dir).unwrap();
        Self(dir)
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn wallet(scratch: &Scratch) -> Wallet {
    let mut config = WalletConfig::default();
    config.keystore.container_path = scratch.0.join("container.json");
    let settings = KeystoreSettings {
        rp_id: "wallet.example".into(),
        kdf: KdfParams::insecure_for_tests(10),
        ..KeystoreSettings::default()
    };
    Wallet::with_parts(config, settings, Arc::new(NoPlatformAuthenticator))
}

#[tokio::test]
async fn test_init_then_unlock_from_file() {
    let scratch = Scratch::new();
    let wallet = wallet(&scratch);
    wallet.init_password("hunter2").await.unwrap();
    assert!(scratch.0.join("container.json").exists());

    // a second handle over the same file sees the committed container
    let reopened = self::wallet(&scratch);
    let unlocked = reopened.unlock("hunter2").await.unwrap();
    assert_eq!(unlocked.unlock_methods(), vec![UnlockMethodInfo::Password]);
    assert!(unlocked.kids().is_empty());
}

#[tokio::test]
async fn test_wrong_password_is_keystore_error() {
    let scratch = Scratch::new();
    let wallet = wallet(&scratch);
    wallet.init_password("right").await.unwrap();

    let err = wallet.unlock("wrong").await.unwrap_err();
    assert!(matches!(err, RootError::Keystore(KeystoreError::UnlockFailed(_))));
}

#[tokio::test]
async fn test_init_twice_fails() {
    let scratch = Scratch::new();
    let wallet = wallet(&scratch);
    wallet.init_password("pw").await.unwrap();
    assert!(matches!(
        wallet.init_password("pw").await,
        Err(RootError::Keystore(_))
    ));
}

#[tokio::test]
async fn test_new_keys_persist() {
    let scratch = Scratch::new();
    let wallet = wallet(&scratch);
    wallet.init_password("pw").await.unwrap();

    let kids = wallet.new_keys("pw", 2).await.unwrap();
    assert_eq!(kids.len(), 2);

    let unlocked = wallet.unlock("pw").await.unwrap();
    let mut stored = unlocked.kids();
    stored.sort();
    let mut expected = kids.clone();
    expected.sort();
    assert_eq!(stored, expected);
    for kid in &kids {
        let keypair = unlocked.keypair(kid).unwrap();
        assert!(keypair.did.starts_with("did:key:"));
        assert_eq!(keypair.alg, "ES256");
    }
}

#[tokio::test]
async fn test_rotate_keeps_credential_keys() {
    let scratch = Scratch::new();
    let wallet = wallet(&scratch);
    wallet.init_password("pw").await.unwrap();
    let kids = wallet.new_keys("pw", 3).await.unwrap();

    let carried = wallet.rotate("pw").await.unwrap();
    assert_eq!(carried, 3);

    let unlocked = wallet.unlock("pw").await.unwrap();
    for kid in &kids {
        unlocked.keypair(kid).unwrap();
    }
    let proofs = wallet
        .openid4vci_proofs("pw", "n", "https://issuer.example", "wallet-client", 1)
        .await
        .unwrap();
    assert_eq!(proofs.len(), 1);
}

#[tokio::test]
async fn test_openid4vci_proof_binds_nonce_and_audience() {
    let scratch = Scratch::new();
    let wallet = wallet(&scratch);
    wallet.init_password("pw").await.unwrap();

    let proofs = wallet
        .openid4vci_proofs("pw", "c-nonce-1", "https://issuer.example", "wallet-client", 1)
        .await
        .unwrap();
    assert_eq!(proofs.len(), 1);

    let payload = decode_payload_unverified(&proofs[0]).unwrap();
    assert_eq!(payload["nonce"], "c-nonce-1");
    assert_eq!(payload["aud"], "https://issuer.example");
    assert_eq!(payload["iss"], "wallet-client");

    let header_b64 = proofs[0].split('.').next().unwrap();
    let header: Value =
        serde_json::from_slice(&wallet_core::b64u_decode(header_b64).unwrap()).unwrap();
    assert_eq!(header["typ"], "openid4vci-proof+jwt");
    assert_eq!(header["alg"], "ES256");
    assert_eq!(header["jwk"]["kty"], "EC");

    // the proof key was stored alongside the container
    assert_eq!(wallet.unlock("pw").await.unwrap().kids().len(), 1);
}

#[tokio::test]
async fn test_proximity_session_engages_over_loopback() {
    let scratch = Scratch::new();
    let wallet = wallet(&scratch);
    let (transport, _reader) = LoopbackTransport::pair();
    let mut session = wallet.proximity_session(Arc::new(transport));

    let uri = session.engage().await.unwrap();
    assert!(uri.starts_with("mdoc:"));
    assert_eq!(session.state(), ProximityState::Engaged);
}

#[tokio::test]
async fn test_proximity_session_reports_unavailable_transport() {
    let scratch = Scratch::new();
    let wallet = wallet(&scratch);
    let mut session = wallet.proximity_session(Arc::new(LoopbackTransport::unavailable()));
    assert!(matches!(
        session.engage().await,
        Err(MdocError::ProximityUnavailable)
    ));
}

// ---------------------------------------------------------------------------
// Presentation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingVerifier {
    posts: Mutex<Vec<Vec<(String, String)>>>,
}

#[async_trait]
impl HttpClient for RecordingVerifier {
    async fn get(&self, _url: &str) -> CoreResult<HttpResponse> {
        Ok(HttpResponse {
            status: 404,
            content_type: None,
            body: vec![],
        })
    }

    async fn post_form(&self, _url: &str, fields: &[(String, String)]) -> CoreResult<HttpResponse> {
        self.posts.lock().unwrap().push(fields.to_vec());
        Ok(HttpResponse {
            status: 200,
            content_type: Some("application/json".into()),
            body: b"{}".to_vec(),
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

fn request_url(nonce: &str) -> String {
    let definition = json!({
        "id": "age-check",
        "input_descriptors": [{
            "id": "pid",
            "format": { "dc+sd-jwt": {} },
            "constraints": { "fields": [{ "path": ["$.age_over_18"] }] }
        }]
    });
    let mut url = Url::parse("openid4vp://authorize").unwrap();
    url.query_pairs_mut()
        .append_pair("client_id", "https://verifier.example")
        .append_pair("response_uri", "https://verifier.example/cb")
        .append_pair("nonce", nonce)
        .append_pair("presentation_definition", &definition.to_string());
    url.to_string()
}

#[tokio::test]
async fn test_present_discloses_requested_claim() {
    let scratch = Scratch::new();
    let wallet = wallet(&scratch);
    wallet.init_password("pw").await.unwrap();
    let kids = wallet.new_keys("pw", 1).await.unwrap();
    let unlocked = wallet.unlock("pw").await.unwrap();
    let holder_jwk = wallet.signer(&unlocked).public_jwk(&kids[0]).unwrap();

    let issuer = SdJwtIssuer::new(SigningKey::from(&generate_secret_key()));
    let sd_jwt = issuer
        .issue(
            json!({ "iss": "https://issuer.example", "vct": "urn:eu.europa.ec.eudi:pid:1" }),
            &[("family_name", json!("Doe")), ("age_over_18", json!(true))],
            &holder_jwk,
        )
        .unwrap();
    let credentials = Arc::new(InMemoryCredentialStore::with_credentials(vec![
        StorableCredential {
            id: CredentialId::new("pid"),
            format: CredentialFormat::SdJwtVc,
            credential: sd_jwt,
            issuance_date: Timestamp::now(),
        },
    ]));
    let http = Arc::new(RecordingVerifier::default());

    let (matched, outcome) = wallet
        .present("pw", &request_url("n-1"), None, http.clone(), credentials)
        .await
        .unwrap();
    assert_eq!(matched.verifier_domain, "verifier.example");
    assert_eq!(matched.descriptor.credential_ids, vec![CredentialId::new("pid")]);
    assert_eq!(outcome, ResponseOutcome::Sent { redirect_uri: None });

    let posts = http.posts.lock().unwrap().clone();
    assert_eq!(posts.len(), 1);
    let vp_token = posts[0]
        .iter()
        .find(|(k, _)| k == "vp_token")
        .map(|(_, v)| v.clone())
        .unwrap();
    let vp = SdJwt::parse(&vp_token).unwrap();
    let names: Vec<_> = vp.disclosures.iter().filter_map(|d| d.name.clone()).collect();
    assert_eq!(names, vec!["age_over_18"]);
}

#[tokio::test]
async fn test_present_without_conformant_credential_fails() {
    let scratch = Scratch::new();
    let wallet = wallet(&scratch);
    wallet.init_password("pw").await.unwrap();
    let http = Arc::new(RecordingVerifier::default());

    let err = wallet
        .present(
            "pw",
            &request_url("n-2"),
            None,
            http.clone(),
            Arc::new(InMemoryCredentialStore::new()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RootError::OpenId4Vp(_)));
    assert!(http.posts.lock().unwrap().is_empty());
}
