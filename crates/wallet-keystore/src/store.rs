use crate::container::EncryptedContainer;
use crate::error::{KeystoreError, KeystoreResult};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Mutex;
use wallet_core::Versioned;

// ---------------------------------------------------------------------------
// ContainerStore: versioned persistence of the key container
//
// Version 0 means "absent". Every successful swap bumps the version by one.
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ContainerStore: Send + Sync {
    async fn load(&self) -> KeystoreResult<Option<Versioned<EncryptedContainer>>>;

    /// Replace the container if the stored version still equals `expected_version`.
    /// Returns the new version, or `None` if another writer got there first.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        container: &EncryptedContainer,
    ) -> KeystoreResult<Option<u64>>;
}

/// A replacement container that has not been persisted yet.
///
/// Dropping a `Commit` abandons the change; nothing is written until
/// [`Commit::apply`] is called.
#[must_use = "a Commit does nothing until applied"]
#[derive(Debug, Clone)]
pub struct Commit {
    base_version: u64,
    container: EncryptedContainer,
}

impl Commit {
    pub(crate) fn new(base_version: u64, container: EncryptedContainer) -> Self {
        Self {
            base_version,
            container,
        }
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn container(&self) -> &EncryptedContainer {
        &self.container
    }

    /// The version the store will hold once this commit lands.
    pub fn target_version(&self) -> u64 {
        self.base_version + 1
    }

    pub async fn apply(self, store: &dyn ContainerStore) -> KeystoreResult<u64> {
        match store
            .compare_and_swap(self.base_version, &self.container)
            .await?
        {
            Some(version) => {
                tracing::debug!(version, "container committed");
                Ok(version)
            }
            None => {
                tracing::warn!(base_version = self.base_version, "stale container commit rejected");
                Err(KeystoreError::StaleContainer)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// InMemoryContainerStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryContainerStore {
    data: Mutex<Option<Versioned<EncryptedContainer>>>,
}

fn lock_data(
    mutex: &Mutex<Option<Versioned<EncryptedContainer>>>,
) -> KeystoreResult<std::sync::MutexGuard<'_, Option<Versioned<EncryptedContainer>>>> {
    mutex
        .lock()
        .map_err(|e| KeystoreError::Storage(format!("lock poisoned: {}", e)))
}

impl InMemoryContainerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version, 0 when empty.
    pub fn version(&self) -> u64 {
        lock_data(&self.data)
            .map(|d| d.as_ref().map(|v| v.version).unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl ContainerStore for InMemoryContainerStore {
    async fn load(&self) -> KeystoreResult<Option<Versioned<EncryptedContainer>>> {
        Ok(lock_data(&self.data)?.clone())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        container: &EncryptedContainer,
    ) -> KeystoreResult<Option<u64>> {
        let mut data = lock_data(&self.data)?;
        let current = data.as_ref().map(|v| v.version).unwrap_or(0);
        if current != expected_version {
            return Ok(None);
        }
        let next = current + 1;
        *data = Some(Versioned::new(next, container.clone()));
        Ok(Some(next))
    }
}

// ---------------------------------------------------------------------------
// JsonFileContainerStore
// ---------------------------------------------------------------------------

/// Container persisted as a single JSON document, replaced by write-then-rename.
pub struct JsonFileContainerStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileContainerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn read(&self) -> KeystoreResult<Option<Versioned<EncryptedContainer>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let stored = serde_json::from_slice(&bytes).map_err(|e| {
                    KeystoreError::ContainerCorrupted(format!(
                        "{}: {}",
                        self.path.display(),
                        e
                    ))
                })?;
                Ok(Some(stored))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KeystoreError::Storage(format!(
                "read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl ContainerStore for JsonFileContainerStore {
    async fn load(&self) -> KeystoreResult<Option<Versioned<EncryptedContainer>>> {
        self.read().await
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        container: &EncryptedContainer,
    ) -> KeystoreResult<Option<u64>> {
        let _guard = self.write_lock.lock().await;
        let current = self.read().await?.map(|v| v.version).unwrap_or(0);
        if current != expected_version {
            return Ok(None);
        }
        let next = current + 1;
        let json = serde_json::to_vec_pretty(&Versioned::new(next, container))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| KeystoreError::Storage(format!("create dir: {}", e)))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| KeystoreError::Storage(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| KeystoreError::Storage(format!("rename {}: {}", tmp.display(), e)))?;
        Ok(Some(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{generate_main_key, PrivateData};

    fn sample_container() -> EncryptedContainer {
        EncryptedContainer::new(&generate_main_key(), &PrivateData::default()).unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_cas() {
        let store = InMemoryContainerStore::new();
        assert!(store.load().await.unwrap().is_none());

        let c = sample_container();
        assert_eq!(store.compare_and_swap(0, &c).await.unwrap(), Some(1));
        assert_eq!(store.compare_and_swap(0, &c).await.unwrap(), None);
        assert_eq!(store.compare_and_swap(1, &c).await.unwrap(), Some(2));
        assert_eq!(store.version(), 2);
        assert_eq!(store.load().await.unwrap().unwrap().value, c);
    }

    #[tokio::test]
    async fn test_commit_apply_and_stale() {
        let store = InMemoryContainerStore::new();
        let first = Commit::new(0, sample_container());
        let racing = Commit::new(0, sample_container());
        assert_eq!(first.target_version(), 1);
        assert_eq!(first.apply(&store).await.unwrap(), 1);
        assert!(matches!(
            racing.apply(&store).await,
            Err(KeystoreError::StaleContainer)
        ));
    }

    #[tokio::test]
    async fn test_json_file_store() {
        let dir = std::env::temp_dir().join(format!("wallet-store-{}", uuid::Uuid::new_v4()));
        let store = JsonFileContainerStore::new(dir.join("container.json"));
        assert!(store.load().await.unwrap().is_none());

        let c = sample_container();
        assert_eq!(store.compare_and_swap(0, &c).await.unwrap(), Some(1));
        assert_eq!(store.compare_and_swap(0, &c).await.unwrap(), None);
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.value, c);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_json_file_store_corrupted() {
        let dir = std::env::temp_dir().join(format!("wallet-store-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("container.json");
        std::fs::write(&path, b"not json").unwrap();
        let store = JsonFileContainerStore::new(&path);
        assert!(matches!(
            store.load().await,
            Err(KeystoreError::ContainerCorrupted(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
