//! Holder side of an in-person mdoc presentation.
//!
//! ```text
//! Init -> Engaged -> Connected -> RequestReceived -> SessionEstablished -> ResponseReady -> Terminated
//! ```
//!
//! Every failure after engagement releases the transport and drops the
//! ephemeral key material before the error is returned.

use crate::document::{build_device_response, IssuerSigned};
use crate::engagement::DeviceEngagement;
use crate::error::{MdocError, MdocResult};
use crate::framing::{fragment, Reassembler, MAX_MESSAGE_SIZE};
use crate::request::{DeviceRequest, ItemsRequest};
use crate::session::{
    proximity_session_transcript, SessionData, SessionEncryption, SessionEstablishment,
    STATUS_SESSION_TERMINATION,
};
use crate::transport::{ProximityTransport, TransportStatus};
use async_trait::async_trait;
use ciborium::value::Value;
use p256::SecretKey;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wallet_core::{Cancellation, PresentationDefinition};
use wallet_keystore::encapsulation::{generate_secret_key, public_key_bytes};
use wallet_keystore::Signer;

/// Payload bytes per transport unit when the link reports no measurement.
pub const DEFAULT_ASSUMED_CHUNK_SIZE: usize = 185;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProximityState {
    Init,
    Engaged,
    Connected,
    RequestReceived,
    SessionEstablished,
    ResponseReady,
    Terminated,
}

impl ProximityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Engaged => "engaged",
            Self::Connected => "connected",
            Self::RequestReceived => "request_received",
            Self::SessionEstablished => "session_established",
            Self::ResponseReady => "response_ready",
            Self::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MdocSettings {
    /// Upper bound for payload bytes per unit; the measured link limit wins when smaller.
    pub assumed_chunk_size: usize,
    /// Largest reassembled inbound message.
    pub max_message_size: usize,
    /// Document type to answer for. `None` answers the first request.
    pub doc_type: Option<String>,
    /// Only elements in this namespace are disclosed.
    pub namespace: Option<String>,
}

impl Default for MdocSettings {
    fn default() -> Self {
        Self {
            assumed_chunk_size: DEFAULT_ASSUMED_CHUNK_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
            doc_type: None,
            namespace: None,
        }
    }
}

/// What the reader asked for, in both its native and presentation-exchange form.
#[derive(Debug, Clone, PartialEq)]
pub struct ProximityRequest {
    pub items: ItemsRequest,
    pub presentation_definition: PresentationDefinition,
}

/// Asks the holder whether to disclose the requested elements.
#[async_trait]
pub trait ProximityConsent: Send + Sync {
    async fn confirm(&self, request: &ProximityRequest) -> bool;
}

/// Consents to everything. For tests and unattended demos.
pub struct AlwaysConsent;

#[async_trait]
impl ProximityConsent for AlwaysConsent {
    async fn confirm(&self, _request: &ProximityRequest) -> bool {
        true
    }
}

struct Engagement {
    e_device_key: SecretKey,
    service_uuid: Uuid,
    bytes: Vec<u8>,
}

struct Established {
    encryption: SessionEncryption,
    transcript: Value,
    request: ProximityRequest,
}

pub struct MdocProximitySession {
    transport: Arc<dyn ProximityTransport>,
    settings: MdocSettings,
    cancellation: Cancellation,
    state: ProximityState,
    engagement: Option<Engagement>,
    established: Option<Established>,
    response: Option<Vec<u8>>,
}

impl MdocProximitySession {
    pub fn new(transport: Arc<dyn ProximityTransport>, settings: MdocSettings) -> Self {
        Self {
            transport,
            settings,
            cancellation: Cancellation::new(),
            state: ProximityState::Init,
            engagement: None,
            established: None,
            response: None,
        }
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Handle that aborts a pending receive from another task.
    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }

    pub fn state(&self) -> ProximityState {
        self.state
    }

    /// The request decoded by `receive_request`, while the session holds it.
    pub fn request(&self) -> Option<&ProximityRequest> {
        self.established.as_ref().map(|e| &e.request)
    }

    fn require_state(&self, expected: ProximityState) -> MdocResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(MdocError::InvalidState {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            })
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Generate the ephemeral key and session UUID and return the
    /// `mdoc:` engagement URI for the QR code.
    ///
    /// Calling this on a live session terminates it first.
    pub async fn engage(&mut self) -> MdocResult<String> {
        if !matches!(self.state, ProximityState::Init | ProximityState::Terminated) {
            warn!(state = self.state.as_str(), "superseding active mdoc session");
            if let Err(e) = self.shutdown(true).await {
                warn!(error = %e, "previous session did not terminate cleanly");
            }
        }
        if !self.transport.is_available().await {
            warn!("proximity transport unavailable");
            return Err(MdocError::ProximityUnavailable);
        }

        let e_device_key = generate_secret_key();
        let service_uuid = Uuid::new_v4();
        let engagement = DeviceEngagement::new(public_key_bytes(&e_device_key), service_uuid);
        let bytes = engagement.encode()?;
        let uri = engagement.to_uri()?;

        self.established = None;
        self.response = None;
        self.engagement = Some(Engagement {
            e_device_key,
            service_uuid,
            bytes,
        });
        self.state = ProximityState::Engaged;
        info!(service_uuid = %service_uuid, "device engagement created");
        Ok(uri)
    }

    pub async fn connect(&mut self) -> MdocResult<()> {
        self.require_state(ProximityState::Engaged)?;
        let service_uuid = match &self.engagement {
            Some(engagement) => engagement.service_uuid,
            None => return Err(self.abort(missing("engagement")).await),
        };
        let connected = match self.cancellation.run(self.transport.create_client(service_uuid)).await {
            Some(Ok(connected)) => connected,
            Some(Err(e)) => return Err(self.abort(e).await),
            None => return Err(self.abort(MdocError::CanceledByUser).await),
        };
        if !connected {
            return Err(self.abort(MdocError::ProximityUnavailable).await);
        }
        self.state = ProximityState::Connected;
        debug!(service_uuid = %service_uuid, "proximity client connected");
        Ok(())
    }

    /// Wait for the reader's `SessionEstablishment`, derive the session keys
    /// and decrypt the `DeviceRequest` it carries.
    pub async fn receive_request(&mut self) -> MdocResult<ProximityRequest> {
        self.require_state(ProximityState::Connected)?;
        let message = match self.cancellation.run(self.read_message()).await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(self.abort(e).await),
            None => {
                info!("mdoc receive cancelled");
                return Err(self.abort(MdocError::CanceledByUser).await);
            }
        };
        self.state = ProximityState::RequestReceived;

        match self.establish(&message) {
            Ok(established) => {
                let request = established.request.clone();
                info!(
                    doc_type = %request.items.doc_type,
                    elements = request.items.selection().values().map(|s| s.len()).sum::<usize>(),
                    "device request received"
                );
                self.established = Some(established);
                self.state = ProximityState::SessionEstablished;
                Ok(request)
            }
            Err(e) => {
                warn!(error = %e, "session establishment failed");
                Err(self.abort(e).await)
            }
        }
    }

    /// Ask for consent, then sign and encrypt a response restricted to the
    /// requested elements.
    pub async fn prepare_response(
        &mut self,
        credential: &IssuerSigned,
        signer: &dyn Signer,
        consent: &dyn ProximityConsent,
    ) -> MdocResult<()> {
        self.require_state(ProximityState::SessionEstablished)?;
        match self.build_response(credential, signer, consent).await {
            Ok(response) => {
                self.response = Some(response);
                self.state = ProximityState::ResponseReady;
                Ok(())
            }
            Err(e) => Err(self.abort(e).await),
        }
    }

    /// Transmit the prepared response and close the session.
    pub async fn send_response(&mut self) -> MdocResult<()> {
        self.require_state(ProximityState::ResponseReady)?;
        let response = match self.response.take() {
            Some(response) => response,
            None => return Err(self.abort(missing("response")).await),
        };
        if let Err(e) = self.send_message(&response).await {
            return Err(self.abort(e).await);
        }
        info!(bytes = response.len(), "device response sent");
        self.shutdown(true).await
    }

    pub async fn respond(
        &mut self,
        credential: &IssuerSigned,
        signer: &dyn Signer,
        consent: &dyn ProximityConsent,
    ) -> MdocResult<()> {
        self.prepare_response(credential, signer, consent).await?;
        self.send_response().await
    }

    /// Close the session. Sends a termination status to the reader when the
    /// session was established and the link is still up.
    pub async fn terminate(&mut self) -> MdocResult<()> {
        self.shutdown(true).await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn read_message(&self) -> MdocResult<Vec<u8>> {
        let mut reassembler = Reassembler::with_max_size(self.settings.max_message_size);
        loop {
            let unit = self.transport.receive().await?;
            if let Some(message) = reassembler.push(&unit)? {
                return Ok(message);
            }
        }
    }

    fn chunk_size(&self) -> usize {
        let assumed = self.settings.assumed_chunk_size.max(1);
        self.transport
            .max_unit_payload()
            .map_or(assumed, |measured| measured.min(assumed))
            .max(1)
    }

    async fn send_message(&self, message: &[u8]) -> MdocResult<()> {
        let chunk_size = self.chunk_size();
        let units = fragment(message, chunk_size)?;
        debug!(units = units.len(), chunk_size, "sending framed message");
        for unit in units {
            self.transport.send(&unit).await?;
        }
        Ok(())
    }

    fn establish(&self, message: &[u8]) -> MdocResult<Established> {
        let engagement = self.engagement.as_ref().ok_or_else(|| missing("engagement"))?;
        let establishment = SessionEstablishment::parse(message)?;
        let reader_key = establishment.e_reader_key()?;
        let transcript =
            proximity_session_transcript(&engagement.bytes, &establishment.e_reader_key_bytes);
        let mut encryption =
            SessionEncryption::derive(&engagement.e_device_key, &reader_key, &transcript)?;
        let plaintext = encryption.decrypt_from_reader(&establishment.data)?;

        let device_request = DeviceRequest::parse(&plaintext)?;
        let mut items = device_request
            .items_for(self.settings.doc_type.as_deref())?
            .clone();
        if let Some(namespace) = &self.settings.namespace {
            items.name_spaces.retain(|ns, _| ns == namespace);
            if items.name_spaces.is_empty() {
                return Err(MdocError::ProtocolError(format!(
                    "request names no element in {}",
                    namespace
                )));
            }
        }
        let presentation_definition = items.to_presentation_definition()?;
        Ok(Established {
            encryption,
            transcript,
            request: ProximityRequest {
                items,
                presentation_definition,
            },
        })
    }

    async fn build_response(
        &mut self,
        credential: &IssuerSigned,
        signer: &dyn Signer,
        consent: &dyn ProximityConsent,
    ) -> MdocResult<Vec<u8>> {
        let established = self.established.as_mut().ok_or_else(|| missing("session keys"))?;
        let selection = established.request.items.selection();
        if credential.doc_type()? != established.request.items.doc_type
            || !credential.contains_all(&selection)
        {
            info!(doc_type = %established.request.items.doc_type, "held document cannot satisfy request");
            return Err(MdocError::InsufficientCredentials);
        }
        if !consent.confirm(&established.request).await {
            info!("holder declined mdoc disclosure");
            return Err(MdocError::CanceledByUser);
        }

        let restricted = credential.restrict(&selection);
        let response =
            build_device_response(signer, &restricted, &established.transcript).await?;
        let encrypted = established.encryption.encrypt_to_reader(&response)?;
        SessionData::with_data(encrypted).encode()
    }

    /// Failure exit: no status message, transport released, keys dropped.
    async fn abort(&mut self, err: MdocError) -> MdocError {
        if let Err(e) = self.shutdown(false).await {
            warn!(error = %e, "transport release failed");
        }
        err
    }

    async fn shutdown(&mut self, notify: bool) -> MdocResult<()> {
        if self.state == ProximityState::Terminated {
            return Ok(());
        }
        let touched_transport = self.state != ProximityState::Init;
        let was_established = self.established.take().is_some();
        self.engagement = None;
        self.response = None;

        let mut result = Ok(());
        if notify && was_established && self.transport.status() == TransportStatus::Connected {
            result = match SessionData::with_status(STATUS_SESSION_TERMINATION).encode() {
                Ok(bytes) => self.send_message(&bytes).await,
                Err(e) => Err(e),
            };
        }
        if touched_transport {
            let released = self.transport.terminate().await;
            result = result.and(released);
        }
        debug!(from = self.state.as_str(), "mdoc session terminated");
        self.state = ProximityState::Terminated;
        result
    }
}

fn missing(what: &str) -> MdocError {
    MdocError::ProtocolError(format!("session has no {}", what))
}
