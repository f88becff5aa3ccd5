//! Compact JWS production for key-binding and OpenID4VCI proof JWTs.

use crate::error::{KeystoreError, KeystoreResult};
use crate::signer::{Signer, ALG_ES256};
use serde_json::{json, Value};
use wallet_core::{b64u_decode, b64u_encode, sha256, EcJwk, Kid};

pub const TYP_KB_JWT: &str = "kb+jwt";
pub const TYP_OPENID4VCI_PROOF: &str = "openid4vci-proof+jwt";

fn segment(value: &Value) -> KeystoreResult<String> {
    Ok(b64u_encode(serde_json::to_vec(value)?))
}

/// Sign `header.payload` and return the compact serialization.
pub async fn sign_compact(
    signer: &dyn Signer,
    kid: &Kid,
    header: &Value,
    payload: &Value,
) -> KeystoreResult<String> {
    let signing_input = format!("{}.{}", segment(header)?, segment(payload)?);
    let signature = signer.sign_es256(kid, signing_input.as_bytes()).await?;
    Ok(format!("{}.{}", signing_input, b64u_encode(signature)))
}

/// Key-binding JWT over an SD-JWT presentation (`<issuer-jwt>~<disclosures>~`).
pub async fn key_binding_jwt(
    signer: &dyn Signer,
    kid: &Kid,
    presentation: &str,
    nonce: &str,
    audience: &str,
    issued_at: i64,
) -> KeystoreResult<String> {
    let header = json!({ "typ": TYP_KB_JWT, "alg": ALG_ES256 });
    let payload = json!({
        "nonce": nonce,
        "aud": audience,
        "sd_hash": b64u_encode(sha256(presentation.as_bytes())),
        "iat": issued_at,
    });
    sign_compact(signer, kid, &header, &payload).await
}

/// Proof of possession for credential issuance, embedding the public JWK.
pub async fn openid4vci_proof(
    signer: &dyn Signer,
    kid: &Kid,
    nonce: &str,
    audience: &str,
    issuer: &str,
    issued_at: i64,
) -> KeystoreResult<String> {
    let jwk = signer.public_jwk(kid)?.with_key_ops(&["verify"]);
    let header = json!({
        "alg": ALG_ES256,
        "typ": TYP_OPENID4VCI_PROOF,
        "jwk": jwk,
    });
    let payload = json!({
        "nonce": nonce,
        "aud": audience,
        "iss": issuer,
        "iat": issued_at,
    });
    sign_compact(signer, kid, &header, &payload).await
}

/// Decode the payload of a compact JWS without verifying it.
pub fn decode_payload_unverified(jws: &str) -> KeystoreResult<Value> {
    let payload = jws
        .split('.')
        .nth(1)
        .ok_or_else(|| KeystoreError::Serialization("not a compact JWS".into()))?;
    Ok(serde_json::from_slice(&b64u_decode(payload)?)?)
}

/// The holder key id an SD-JWT is bound to: thumbprint of `cnf.jwk` in the issuer JWT.
pub fn kid_from_sd_jwt_cnf(sd_jwt: &str) -> KeystoreResult<Kid> {
    let issuer_jwt = sd_jwt.split('~').next().unwrap_or_default();
    let payload = decode_payload_unverified(issuer_jwt)?;
    let jwk = payload
        .get("cnf")
        .and_then(|cnf| cnf.get("jwk"))
        .cloned()
        .ok_or_else(|| KeystoreError::KeyNotFound("SD-JWT has no cnf.jwk".into()))?;
    let jwk: EcJwk = serde_json::from_value(jwk)?;
    Ok(jwk.thumbprint())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use p256::ecdsa::signature::Signer as _;
    use p256::ecdsa::{Signature, SigningKey};

    struct FixedSigner {
        key: SigningKey,
        jwk: EcJwk,
    }

    impl FixedSigner {
        fn new() -> Self {
            let secret = crate::encapsulation::generate_secret_key();
            let jwk = EcJwk::from_sec1_uncompressed(&crate::encapsulation::public_key_bytes(&secret))
                .unwrap();
            Self {
                key: SigningKey::from(&secret),
                jwk,
            }
        }
    }

    #[async_trait]
    impl Signer for FixedSigner {
        async fn sign_es256(&self, _kid: &Kid, message: &[u8]) -> KeystoreResult<[u8; 64]> {
            let sig: Signature = self.key.sign(message);
            let mut out = [0u8; 64];
            out.copy_from_slice(&sig.to_bytes());
            Ok(out)
        }

        fn public_jwk(&self, _kid: &Kid) -> KeystoreResult<EcJwk> {
            Ok(self.jwk.clone())
        }
    }

    fn verify_compact(jwk: &EcJwk, jws: &str) -> bool {
        let (input, sig) = jws.rsplit_once('.').unwrap();
        crate::signer::verify_es256(jwk, input.as_bytes(), &b64u_decode(sig).unwrap())
    }

    #[tokio::test]
    async fn test_key_binding_jwt() {
        let signer = FixedSigner::new();
        let kid = signer.jwk.thumbprint();
        let jwt = key_binding_jwt(&signer, &kid, "a.b.c~d1~", "n-1", "https://rp", 1700000000)
            .await
            .unwrap();
        let header: Value =
            serde_json::from_slice(&b64u_decode(jwt.split('.').next().unwrap()).unwrap()).unwrap();
        assert_eq!(header["typ"], "kb+jwt");
        let payload = decode_payload_unverified(&jwt).unwrap();
        assert_eq!(payload["nonce"], "n-1");
        assert_eq!(payload["aud"], "https://rp");
        assert_eq!(payload["sd_hash"], b64u_encode(sha256(b"a.b.c~d1~")));
        assert!(verify_compact(&signer.jwk, &jwt));
    }

    #[tokio::test]
    async fn test_openid4vci_proof_embeds_jwk() {
        let signer = FixedSigner::new();
        let kid = signer.jwk.thumbprint();
        let jwt = openid4vci_proof(&signer, &kid, "c-nonce", "https://issuer", "wallet", 1)
            .await
            .unwrap();
        let header: Value =
            serde_json::from_slice(&b64u_decode(jwt.split('.').next().unwrap()).unwrap()).unwrap();
        assert_eq!(header["typ"], "openid4vci-proof+jwt");
        assert_eq!(header["jwk"]["key_ops"], json!(["verify"]));
        assert_eq!(header["jwk"]["x"], json!(signer.jwk.x));
        assert!(verify_compact(&signer.jwk, &jwt));
    }

    #[test]
    fn test_kid_from_cnf() {
        let signer = FixedSigner::new();
        let payload = json!({ "iss": "x", "cnf": { "jwk": signer.jwk } });
        let issuer_jwt = format!(
            "{}.{}.sig",
            b64u_encode(b"{}"),
            b64u_encode(serde_json::to_vec(&payload).unwrap())
        );
        let sd_jwt = format!("{}~disc~", issuer_jwt);
        assert_eq!(kid_from_sd_jwt_cnf(&sd_jwt).unwrap(), signer.jwk.thumbprint());
    }

    #[test]
    fn test_kid_from_cnf_missing() {
        let issuer_jwt = format!("{}.{}.sig", b64u_encode(b"{}"), b64u_encode(b"{}"));
        assert!(matches!(
            kid_from_sd_jwt_cnf(&issuer_jwt),
            Err(KeystoreError::KeyNotFound(_))
        ));
    }
}
