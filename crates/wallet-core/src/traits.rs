use crate::error::{CoreError, CoreResult};
use crate::types::{CredentialId, StorableCredential};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// CredentialStore: key-value store of opaque credential blobs
//
// The trust core reads credentials for matching and presentation; it never
// owns their lifecycle.
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, id: &CredentialId) -> CoreResult<Option<StorableCredential>>;
    async fn put(&self, credential: StorableCredential) -> CoreResult<()>;
    async fn delete(&self, id: &CredentialId) -> CoreResult<bool>;
    async fn list(&self) -> CoreResult<Vec<StorableCredential>>;
}

// ---------------------------------------------------------------------------
// HttpClient: generic request/response transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> CoreResult<String> {
        String::from_utf8(self.body.clone())
            .map_err(|e| CoreError::Encoding(format!("response body is not UTF-8: {}", e)))
    }

    pub fn json(&self) -> CoreResult<serde_json::Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Fail with `HttpStatus` unless the status is 2xx.
    pub fn error_for_status(self, url: &str) -> CoreResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(CoreError::HttpStatus {
                status: self.status,
                url: url.to_string(),
            })
        }
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> CoreResult<HttpResponse>;

    /// POST an `application/x-www-form-urlencoded` body.
    async fn post_form(&self, url: &str, fields: &[(String, String)]) -> CoreResult<HttpResponse>;

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> CoreResult<HttpResponse>;
}

// ---------------------------------------------------------------------------
// InMemoryCredentialStore
// ---------------------------------------------------------------------------

/// Credential store held in process memory, ordered by id.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    data: Mutex<BTreeMap<CredentialId, StorableCredential>>,
}

fn lock_data(
    mutex: &Mutex<BTreeMap<CredentialId, StorableCredential>>,
) -> CoreResult<std::sync::MutexGuard<'_, BTreeMap<CredentialId, StorableCredential>>> {
    mutex
        .lock()
        .map_err(|e| CoreError::CredentialStore(format!("lock poisoned: {}", e)))
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: impl IntoIterator<Item = StorableCredential>) -> Self {
        let map = credentials
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect::<BTreeMap<_, _>>();
        Self {
            data: Mutex::new(map),
        }
    }

    pub fn count(&self) -> usize {
        lock_data(&self.data).map(|d| d.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get(&self, id: &CredentialId) -> CoreResult<Option<StorableCredential>> {
        Ok(lock_data(&self.data)?.get(id).cloned())
    }

    async fn put(&self, credential: StorableCredential) -> CoreResult<()> {
        lock_data(&self.data)?.insert(credential.id.clone(), credential);
        Ok(())
    }

    async fn delete(&self, id: &CredentialId) -> CoreResult<bool> {
        Ok(lock_data(&self.data)?.remove(id).is_some())
    }

    async fn list(&self) -> CoreResult<Vec<StorableCredential>> {
        Ok(lock_data(&self.data)?.values().cloned().collect())
    }
}
