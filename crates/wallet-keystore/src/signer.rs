use crate::ceremony::{CeremonyEvent, CeremonyStep, SignCeremony, SignInteraction};
use crate::container::{CredentialKeyPair, MainKey, PrivateKeyRef};
use crate::encapsulation::secret_key_from_bytes;
use crate::envelope;
use crate::error::{KeystoreError, KeystoreResult};
use crate::passkey::{AssertionRequest, Authenticator, AuthenticatorData, SignRequest};
use async_trait::async_trait;
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use std::collections::BTreeMap;
use std::sync::Arc;
use wallet_core::{Cancellation, EcJwk, Kid};

pub const ALG_ES256: &str = "ES256";

/// ES256 signing by key id.
///
/// Signatures are always returned in the fixed-width `r ‖ s` form used by JWS
/// and COSE, whatever the key custody behind `kid`.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign_es256(&self, kid: &Kid, message: &[u8]) -> KeystoreResult<[u8; 64]>;

    fn public_jwk(&self, kid: &Kid) -> KeystoreResult<EcJwk>;
}

/// Signer over the credential keys of an unlocked keystore.
pub struct CredentialSigner {
    main_key: MainKey,
    keypairs: BTreeMap<Kid, CredentialKeyPair>,
    authenticator: Arc<dyn Authenticator>,
    interaction: Arc<dyn SignInteraction>,
    rp_id: String,
    cancellation: Cancellation,
}

impl CredentialSigner {
    pub(crate) fn new(
        main_key: MainKey,
        keypairs: BTreeMap<Kid, CredentialKeyPair>,
        authenticator: Arc<dyn Authenticator>,
        interaction: Arc<dyn SignInteraction>,
        rp_id: String,
        cancellation: Cancellation,
    ) -> Self {
        Self {
            main_key,
            keypairs,
            authenticator,
            interaction,
            rp_id,
            cancellation,
        }
    }

    pub fn kids(&self) -> impl Iterator<Item = &Kid> {
        self.keypairs.keys()
    }

    fn keypair(&self, kid: &Kid) -> KeystoreResult<&CredentialKeyPair> {
        self.keypairs
            .get(kid)
            .ok_or_else(|| KeystoreError::KeyNotFound(kid.to_string()))
    }

    fn sign_local(&self, envelope: &envelope::EncryptedEnvelope, message: &[u8]) -> KeystoreResult<[u8; 64]> {
        let scalar = envelope::decrypt(&self.main_key, envelope)?;
        let secret = secret_key_from_bytes(&scalar)?;
        let signature: Signature = SigningKey::from(&secret).sign(message);
        Ok(signature_bytes(&signature))
    }

    /// Drive the hardware-sign ceremony for an authenticator-held key.
    async fn sign_external(
        &self,
        credential_id: &[u8],
        key_ref: &[u8],
        message: &[u8],
    ) -> KeystoreResult<[u8; 64]> {
        let ph_data = wallet_core::sha256(message).to_vec();
        let mut ceremony = SignCeremony::new();
        let mut step = ceremony.step(CeremonyEvent::Start);
        loop {
            step = match step {
                CeremonyStep::Render(prompt) => {
                    tracing::debug!(prompt = prompt.name(), "sign ceremony prompt");
                    let response = self.interaction.render(&prompt).await;
                    ceremony.step(CeremonyEvent::User(response))
                }
                CeremonyStep::RequestAssertion => {
                    let mut request = AssertionRequest::new(self.rp_id.clone());
                    request.allow_credentials = vec![credential_id.to_vec()];
                    request.sign = Some(SignRequest {
                        key_handle_by_credential: BTreeMap::from([(
                            credential_id.to_vec(),
                            key_ref.to_vec(),
                        )]),
                        ph_data: ph_data.clone(),
                    });
                    let outcome = self.cancellation.run(self.authenticator.get(request)).await;
                    let event = match outcome {
                        None | Some(Err(KeystoreError::CanceledByUser)) => {
                            CeremonyEvent::User(crate::ceremony::UserResponse::Cancel)
                        }
                        Some(Err(e)) => CeremonyEvent::AssertionFailed(e.to_string()),
                        Some(Ok(response)) => {
                            match AuthenticatorData::parse(&response.authenticator_data)?
                                .sign_extension_signature()
                            {
                                Some(der) => CeremonyEvent::Signed(der),
                                None => CeremonyEvent::SignatureMissing,
                            }
                        }
                    };
                    ceremony.step(event)
                }
                CeremonyStep::Complete(der) => return der_to_raw(&der),
                CeremonyStep::Abort(e) => {
                    tracing::warn!(error = %e, "sign ceremony aborted");
                    return Err(e);
                }
            };
        }
    }
}

#[async_trait]
impl Signer for CredentialSigner {
    async fn sign_es256(&self, kid: &Kid, message: &[u8]) -> KeystoreResult<[u8; 64]> {
        let keypair = self.keypair(kid)?;
        if keypair.alg != ALG_ES256 {
            return Err(KeystoreError::Signing(format!(
                "unsupported algorithm {} for {}",
                keypair.alg, kid
            )));
        }
        match &keypair.private_key {
            PrivateKeyRef::Wrapped { envelope } => self.sign_local(envelope, message),
            PrivateKeyRef::External {
                credential_id,
                key_ref,
            } => self.sign_external(credential_id, key_ref, message).await,
        }
    }

    fn public_jwk(&self, kid: &Kid) -> KeystoreResult<EcJwk> {
        Ok(self.keypair(kid)?.public_key.clone())
    }
}

fn signature_bytes(signature: &Signature) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&signature.to_bytes());
    out
}

/// Convert an ASN.1 DER ECDSA signature into fixed-width `r ‖ s`.
pub fn der_to_raw(der: &[u8]) -> KeystoreResult<[u8; 64]> {
    let signature = Signature::from_der(der)
        .map_err(|e| KeystoreError::Signing(format!("malformed DER signature: {}", e)))?;
    Ok(signature_bytes(&signature))
}

/// Verify a raw `r ‖ s` ES256 signature.
pub fn verify_es256(jwk: &EcJwk, message: &[u8], signature: &[u8]) -> bool {
    let Ok(sec1) = jwk.to_sec1_uncompressed() else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_sec1_bytes(&sec1) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}
