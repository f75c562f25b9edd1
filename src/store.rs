//! Persistence of `last_seen_at` across restarts.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::DeviceId;
use crate::error::StoreError;

pub const STORE_SCHEMA_VERSION: u64 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPresence {
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Last committed presence. Informational only, never used as the state after a restart.
    #[serde(default)]
    pub present: bool,
}

pub trait LastSeenStore: Send + Sync {
    fn load(&self) -> Result<HashMap<DeviceId, StoredPresence>, StoreError>;

    fn save(&self, id: &DeviceId, record: StoredPresence) -> Result<(), StoreError>;

    fn remove(&self, id: &DeviceId) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<DeviceId, StoredPresence>>,
}

impl MemoryStore {
    fn records(&self) -> MutexGuard<'_, HashMap<DeviceId, StoredPresence>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, id: &DeviceId) -> Option<StoredPresence> {
        self.records().get(id).copied()
    }
}

impl LastSeenStore for MemoryStore {
    fn load(&self) -> Result<HashMap<DeviceId, StoredPresence>, StoreError> {
        Ok(self.records().clone())
    }

    fn save(&self, id: &DeviceId, record: StoredPresence) -> Result<(), StoreError> {
        self.records().insert(id.clone(), record);
        Ok(())
    }

    fn remove(&self, id: &DeviceId) -> Result<(), StoreError> {
        self.records().remove(id);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    schema_version: u64,
    #[serde(default)]
    devices: BTreeMap<DeviceId, StoredPresence>,
}

/// JSON state file, rewritten atomically on every save.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    document: Mutex<Document>,
}

impl JsonFileStore {
    /// Opens the state file, migrating it in place if it predates the current schema.
    /// A missing file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let document = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let mut value: Value = serde_json::from_str(&contents)?;
                let migrated = migrate_document(&mut value);
                let document: Document = serde_json::from_value(value)?;
                if migrated {
                    info!(
                        "Migrated state file {} to schema v{STORE_SCHEMA_VERSION}",
                        path.display()
                    );
                    write_atomically(&path, &document)?;
                }
                document
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {}, starting empty", path.display());
                Document {
                    schema_version: STORE_SCHEMA_VERSION,
                    devices: BTreeMap::new(),
                }
            }
            Err(err) => return Err(err.into()),
        };
        Ok(JsonFileStore {
            path,
            document: Mutex::new(document),
        })
    }

    fn document(&self) -> MutexGuard<'_, Document> {
        self.document.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LastSeenStore for JsonFileStore {
    fn load(&self) -> Result<HashMap<DeviceId, StoredPresence>, StoreError> {
        Ok(self
            .document()
            .devices
            .iter()
            .map(|(id, record)| (id.clone(), *record))
            .collect())
    }

    fn save(&self, id: &DeviceId, record: StoredPresence) -> Result<(), StoreError> {
        let mut document = self.document();
        document.devices.insert(id.clone(), record);
        write_atomically(&self.path, &document)
    }

    fn remove(&self, id: &DeviceId) -> Result<(), StoreError> {
        let mut document = self.document();
        if document.devices.remove(id).is_some() {
            write_atomically(&self.path, &document)?;
        }
        Ok(())
    }
}

fn write_atomically(path: &Path, document: &Document) -> Result<(), StoreError> {
    let contents = serde_json::to_vec_pretty(document)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Upgrades an older state document. Returns whether anything changed.
///
/// Before v2 the presence flag of each device was stored as `onoff`.
fn migrate_document(value: &mut Value) -> bool {
    let Some(root) = value.as_object_mut() else {
        return false;
    };
    let version = root
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if version >= STORE_SCHEMA_VERSION {
        return false;
    }
    if let Some(devices) = root.get_mut("devices").and_then(Value::as_object_mut) {
        for record in devices.values_mut().filter_map(Value::as_object_mut) {
            if let Some(legacy) = record.remove("onoff") {
                record.entry("present").or_insert(legacy);
            }
        }
    }
    root.insert("schema_version".to_string(), Value::from(STORE_SCHEMA_VERSION));
    true
}

#[derive(Debug)]
pub(crate) enum WriteRequest {
    Save(DeviceId, StoredPresence),
    Remove(DeviceId),
}

/// Runs store writes off the caller's task, one at a time and in order.
pub(crate) fn spawn_writer(
    store: Arc<dyn LastSeenStore>,
) -> (mpsc::UnboundedSender<WriteRequest>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<WriteRequest>();
    let handle = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let store = Arc::clone(&store);
            let result = tokio::task::spawn_blocking(move || {
                let outcome = match &request {
                    WriteRequest::Save(id, record) => store.save(id, *record),
                    WriteRequest::Remove(id) => store.remove(id),
                };
                outcome.map(|()| request)
            })
            .await;
            match result {
                Ok(Ok(request)) => debug!("Persisted {request:?}"),
                Ok(Err(err)) => warn!("Failed to persist presence state: {err}"),
                Err(err) => warn!("Presence state writer failed: {err}"),
            }
        }
        debug!("Presence state writer finished");
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("state.json")).unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let seen = Utc::now();

        let store = JsonFileStore::open(&path).unwrap();
        let record = StoredPresence {
            last_seen_at: Some(seen),
            present: true,
        };
        store.save(&"phone".into(), record).unwrap();
        store.save(&"tablet".into(), StoredPresence::default()).unwrap();
        store.remove(&"tablet".into()).unwrap();

        let reopened = JsonFileStore::open(&path).unwrap();
        let records = reopened.load().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records.get(&DeviceId::from("phone")), Some(&record));
    }

    #[test]
    fn test_legacy_presence_field_is_renamed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let legacy = json!({
            "schema_version": 1,
            "devices": {
                "phone": { "last_seen_at": "2024-05-01T10:00:00Z", "onoff": true },
                "tablet": { "last_seen_at": null, "onoff": false }
            }
        });
        std::fs::write(&path, legacy.to_string()).unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        let records = store.load().unwrap();
        assert!(records[&DeviceId::from("phone")].present);
        assert!(!records[&DeviceId::from("tablet")].present);

        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["schema_version"], json!(STORE_SCHEMA_VERSION));
        assert!(on_disk["devices"]["phone"].get("onoff").is_none());
    }

    #[test]
    fn test_current_document_is_not_migrated() {
        let mut value = json!({ "schema_version": 2, "devices": {} });
        assert!(!migrate_document(&mut value));
    }

    #[tokio::test]
    async fn test_writer_applies_requests_in_order() {
        let store = Arc::new(MemoryStore::default());
        let (tx, handle) = spawn_writer(store.clone());
        let seen = Utc::now();
        let record = StoredPresence {
            last_seen_at: Some(seen),
            present: true,
        };
        tx.send(WriteRequest::Save("a".into(), record)).unwrap();
        tx.send(WriteRequest::Save("b".into(), record)).unwrap();
        tx.send(WriteRequest::Remove("b".into())).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(store.get(&"a".into()), Some(record));
        assert_eq!(store.get(&"b".into()), None);
    }
}
