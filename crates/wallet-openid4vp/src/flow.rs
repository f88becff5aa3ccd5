use crate::error::{Oid4vpError, Oid4vpResult};
use crate::request::ClientMetadata;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use wallet_core::PresentationDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowPhase {
    Idle,
    RequestReceived,
    Verified,
    Matched,
    ResponseSent,
}

impl FlowPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowPhase::Idle => "idle",
            FlowPhase::RequestReceived => "request_received",
            FlowPhase::Verified => "verified",
            FlowPhase::Matched => "matched",
            FlowPhase::ResponseSent => "response_sent",
        }
    }
}

/// Everything the response step needs from a verified request.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowState {
    pub presentation_definition: PresentationDefinition,
    pub nonce: String,
    pub response_uri: String,
    pub client_id: String,
    pub state: Option<String>,
    pub client_metadata: Option<ClientMetadata>,
}

/// Result of claiming the active flow for sending.
#[derive(Debug, Clone, PartialEq)]
pub enum Consumed {
    Flow(FlowState),
    /// The flow's nonce was already consumed by an earlier send.
    AlreadySent,
}

/// Identifies one `begin`..`store` pass over the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowGeneration(u64);

#[derive(Debug)]
struct Inner {
    generation: u64,
    phase: FlowPhase,
    active: Option<FlowState>,
    last_used_nonce: Option<String>,
}

/// The single active presentation flow and the replay guard.
///
/// Starting a flow replaces whatever flow was active, and writes made on
/// behalf of the replaced flow are refused with `Superseded`. The last
/// consumed nonce outlives the flow that used it.
#[derive(Debug)]
pub struct FlowStore {
    inner: Mutex<Inner>,
}

impl Default for FlowStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                generation: 0,
                phase: FlowPhase::Idle,
                active: None,
                last_used_nonce: None,
            }),
        }
    }
}

impl FlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Oid4vpResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| Oid4vpError::InvalidRequest(format!("flow state lock poisoned: {}", e)))
    }

    pub fn phase(&self) -> FlowPhase {
        self.lock().map(|i| i.phase).unwrap_or(FlowPhase::Idle)
    }

    /// Start a new flow, dropping the previous one.
    pub fn begin(&self) -> Oid4vpResult<FlowGeneration> {
        let mut inner = self.lock()?;
        inner.generation += 1;
        inner.active = None;
        debug!(
            from = inner.phase.as_str(),
            generation = inner.generation,
            "presentation flow started"
        );
        inner.phase = FlowPhase::RequestReceived;
        Ok(FlowGeneration(inner.generation))
    }

    fn current(inner: &Inner, generation: FlowGeneration) -> Oid4vpResult<()> {
        if inner.generation != generation.0 {
            debug!(stale = generation.0, current = inner.generation, "flow superseded");
            return Err(Oid4vpError::Superseded);
        }
        Ok(())
    }

    pub fn advance(&self, generation: FlowGeneration, phase: FlowPhase) -> Oid4vpResult<()> {
        let mut inner = self.lock()?;
        Self::current(&inner, generation)?;
        debug!(from = inner.phase.as_str(), to = phase.as_str(), "presentation flow");
        inner.phase = phase;
        Ok(())
    }

    /// Reset after a failed step; the replay guard is kept. A superseded
    /// generation leaves the newer flow alone.
    pub fn abandon(&self, generation: FlowGeneration) {
        if let Ok(mut inner) = self.lock() {
            if inner.generation == generation.0 {
                inner.active = None;
                inner.phase = FlowPhase::Idle;
            }
        }
    }

    pub fn check_nonce(&self, nonce: &str) -> Oid4vpResult<()> {
        let inner = self.lock()?;
        if inner.last_used_nonce.as_deref() == Some(nonce) {
            return Err(Oid4vpError::NonceReplay);
        }
        Ok(())
    }

    pub fn store(&self, generation: FlowGeneration, flow: FlowState) -> Oid4vpResult<()> {
        let mut inner = self.lock()?;
        Self::current(&inner, generation)?;
        inner.active = Some(flow);
        Ok(())
    }

    pub fn active(&self) -> Option<FlowState> {
        self.lock().ok().and_then(|i| i.active.clone())
    }

    pub fn last_used_nonce(&self) -> Option<String> {
        self.lock().ok().and_then(|i| i.last_used_nonce.clone())
    }

    /// Claim the active flow and mark its nonce used in one step.
    ///
    /// `nonce` is the nonce the caller built its response for; a flow that
    /// has since been replaced is `NoActiveFlow`.
    pub fn consume(&self, nonce: &str) -> Oid4vpResult<Consumed> {
        let mut inner = self.lock()?;
        let Some(flow) = inner.active.clone().filter(|f| f.nonce == nonce) else {
            return Err(Oid4vpError::NoActiveFlow);
        };
        if flow.nonce.is_empty() || inner.last_used_nonce.as_deref() == Some(flow.nonce.as_str()) {
            return Ok(Consumed::AlreadySent);
        }
        inner.last_used_nonce = Some(flow.nonce.clone());
        inner.phase = FlowPhase::ResponseSent;
        Ok(Consumed::Flow(flow))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(nonce: &str) -> FlowState {
        FlowState {
            presentation_definition: PresentationDefinition {
                id: "pd".into(),
                input_descriptors: vec![],
            },
            nonce: nonce.into(),
            response_uri: "https://verifier.example/cb".into(),
            client_id: "verifier.example".into(),
            state: None,
            client_metadata: None,
        }
    }

    #[test]
    fn test_consume_once() {
        let flows = FlowStore::new();
        let generation = flows.begin().unwrap();
        flows.store(generation, flow("n-1")).unwrap();
        assert!(matches!(flows.consume("n-1").unwrap(), Consumed::Flow(f) if f.nonce == "n-1"));
        assert_eq!(flows.consume("n-1").unwrap(), Consumed::AlreadySent);
        assert_eq!(flows.phase(), FlowPhase::ResponseSent);
        assert_eq!(flows.last_used_nonce().as_deref(), Some("n-1"));
    }

    #[test]
    fn test_consume_without_flow() {
        assert!(matches!(FlowStore::new().consume("n-1"), Err(Oid4vpError::NoActiveFlow)));
    }

    #[test]
    fn test_consume_superseded_flow() {
        let flows = FlowStore::new();
        let first = flows.begin().unwrap();
        flows.store(first, flow("n-1")).unwrap();
        let second = flows.begin().unwrap();
        flows.store(second, flow("n-2")).unwrap();
        assert!(matches!(flows.consume("n-1"), Err(Oid4vpError::NoActiveFlow)));
        assert!(flows.last_used_nonce().is_none());
    }

    #[test]
    fn test_empty_nonce_never_sends() {
        let flows = FlowStore::new();
        let generation = flows.begin().unwrap();
        flows.store(generation, flow("")).unwrap();
        assert_eq!(flows.consume("").unwrap(), Consumed::AlreadySent);
        assert!(flows.last_used_nonce().is_none());
    }

    #[test]
    fn test_replay_guard_survives_new_flow() {
        let flows = FlowStore::new();
        let generation = flows.begin().unwrap();
        flows.store(generation, flow("n-1")).unwrap();
        flows.consume("n-1").unwrap();
        flows.begin().unwrap();
        assert_eq!(flows.phase(), FlowPhase::RequestReceived);
        assert!(flows.active().is_none());
        assert!(matches!(flows.check_nonce("n-1"), Err(Oid4vpError::NonceReplay)));
        flows.check_nonce("n-2").unwrap();
    }

    #[test]
    fn test_abandon_keeps_guard() {
        let flows = FlowStore::new();
        let generation = flows.begin().unwrap();
        flows.store(generation, flow("n-1")).unwrap();
        flows.consume("n-1").unwrap();
        flows.abandon(generation);
        assert_eq!(flows.phase(), FlowPhase::Idle);
        assert_eq!(flows.last_used_nonce().as_deref(), Some("n-1"));
    }

    #[test]
    fn test_stale_generation_cannot_replace_newer_flow() {
        let flows = FlowStore::new();
        let first = flows.begin().unwrap();
        let second = flows.begin().unwrap();
        flows.store(second, flow("n-2")).unwrap();
        flows.advance(second, FlowPhase::Matched).unwrap();

        assert!(matches!(flows.store(first, flow("n-1")), Err(Oid4vpError::Superseded)));
        assert!(matches!(
            flows.advance(first, FlowPhase::Verified),
            Err(Oid4vpError::Superseded)
        ));
        flows.abandon(first);

        assert_eq!(flows.active().unwrap().nonce, "n-2");
        assert_eq!(flows.phase(), FlowPhase::Matched);
    }
}
