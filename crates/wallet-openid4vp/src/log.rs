use crate::error::{Oid4vpError, Oid4vpResult};
use async_trait::async_trait;
use std::sync::Mutex;
use wallet_core::{CredentialFormat, CredentialId, PresentationSubmission, Timestamp};

/// One presentation made to a verifier.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationRecord {
    pub presentation: String,
    pub format: CredentialFormat,
    pub credential_ids: Vec<CredentialId>,
    pub submission: PresentationSubmission,
    pub audience: String,
    pub presented_at: Timestamp,
}

/// Sink for presentations that were sent.
#[async_trait]
pub trait PresentationLog: Send + Sync {
    async fn record(&self, record: PresentationRecord) -> Oid4vpResult<()>;
}

#[derive(Default)]
pub struct InMemoryPresentationLog {
    records: Mutex<Vec<PresentationRecord>>,
}

impl InMemoryPresentationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PresentationRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PresentationLog for InMemoryPresentationLog {
    async fn record(&self, record: PresentationRecord) -> Oid4vpResult<()> {
        self.records
            .lock()
            .map_err(|e| Oid4vpError::InvalidRequest(format!("presentation log lock poisoned: {}", e)))?
            .push(record);
        Ok(())
    }
}
