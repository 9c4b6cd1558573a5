//! Host-side storage: concrete backends and the delegate that serves
//! storage requests raised inside the sandbox.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::sync::Mutex;

use keybridge_error::{BridgeError, StorageError};

use crate::envelope::{Envelope, InstanceId, StorageRequest};
use crate::{redact, Storage};

/// In-memory backend. Contents are lost with the value.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

static NAMESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());

/// File backed store: one JSON object per namespace at `<dir>/<namespace>.json`.
///
/// Writes go to a temporary file that is renamed over the original, so a
/// crash never leaves a half written store behind.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    items: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    /// Open (or create) the store for `namespace` under `dir`.
    pub async fn open(dir: impl AsRef<Path>, namespace: &str) -> Result<Self, StorageError> {
        if !NAMESPACE_RE.is_match(namespace) {
            return Err(StorageError::Backend(format!(
                "invalid storage namespace '{namespace}': use 1-64 of [A-Za-z0-9_-]"
            )));
        }
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{namespace}.json"));

        let items = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StorageError::Corrupt(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            items: Mutex::new(items),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.lock().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock().await;
        let previous = items.insert(key.to_string(), value.to_string());

        let bytes = serde_json::to_vec_pretty(&*items)
            .map_err(|e| StorageError::Backend(format!("encode store: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        let written = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &self.path).await
        }
        .await;

        if let Err(e) = written {
            // Keep memory consistent with disk.
            match previous {
                Some(old) => items.insert(key.to_string(), old),
                None => items.remove(key),
            };
            return Err(e.into());
        }
        Ok(())
    }
}

/// Registry of storage backends keyed by instance id, and the server for
/// `getItem` / `setItem` requests arriving from the sandbox.
///
/// Cheap to clone; clones share the same bindings.
#[derive(Clone, Default)]
pub struct StorageDelegate {
    bindings: Arc<RwLock<HashMap<InstanceId, Arc<dyn Storage>>>>,
}

impl std::fmt::Debug for StorageDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageDelegate")
            .field("bindings", &self.len())
            .finish()
    }
}

impl StorageDelegate {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `storage` to `instance`, returning any previous binding.
    pub fn bind(&self, instance: InstanceId, storage: Arc<dyn Storage>) -> Option<Arc<dyn Storage>> {
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance, storage)
    }

    /// Remove the binding for `instance`. Returns whether one existed.
    pub fn unbind(&self, instance: &InstanceId) -> bool {
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance)
            .is_some()
    }

    /// The backend bound to `instance`.
    pub fn get(&self, instance: &InstanceId) -> Option<Arc<dyn Storage>> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance)
            .cloned()
    }

    /// Number of live bindings.
    pub fn len(&self) -> usize {
        self.bindings.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serve one storage request and build the envelope answering it.
    ///
    /// Never fails: every problem becomes an error envelope for the caller.
    pub async fn handle(&self, request: &Envelope) -> Envelope {
        let key = request.key();
        match self.serve(request).await {
            Ok(result) => Envelope::response(&key, request.instance_id.clone(), result),
            Err(err) => {
                tracing::debug!(
                    correlation_id = %key.correlation_id,
                    action = %key.action,
                    code = err.code(),
                    "storage request failed"
                );
                Envelope::error(
                    &key,
                    request.instance_id.clone(),
                    redact::error_payload(&err, Some(&key.action), request.payload.as_ref()),
                )
            }
        }
    }

    async fn serve(&self, request: &Envelope) -> Result<Value, BridgeError> {
        let storage_request = StorageRequest::from_envelope(request)?;
        let instance = request.instance_id.as_ref().ok_or_else(|| {
            BridgeError::MalformedEnvelope("storage request without instanceId".into())
        })?;
        let backend = self
            .get(instance)
            .ok_or_else(|| BridgeError::StorageNotFound(instance.to_string()))?;

        match storage_request {
            StorageRequest::GetItem { key } => Ok(backend
                .get_item(&key)
                .await?
                .map(Value::String)
                .unwrap_or(Value::Null)),
            StorageRequest::SetItem { key, value } => {
                backend.set_item(&key, &value).await?;
                Ok(Value::Null)
            }
        }
    }
}
