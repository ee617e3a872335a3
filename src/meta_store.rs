//! The in-memory upload registry, its reload-safe persistence, and its
//! change-notification channel.
//!
//! Grounded on the teacher's `auth/persistence/{file,indexed_db,mod}.rs`
//! (narrow key/value backend trait plus a persistence layer on top of it)
//! and `util/subscribe.rs` (the `Listener`/`Unsubscribe` change-notification
//! shape, also used here for the same purpose it served there).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{storage_error, UploadError, UploadErrorCode, UploadResult};
use crate::logger::Logger;
use crate::model::{UiState, UploadRecord, UploadStatus};
use crate::util::{Listener, Unsubscribe};

pub const PERSISTENCE_KEY: &str = "resumable-uploads";
pub const CURRENT_SCHEMA_VERSION: u32 = 5;

/// RAII guard returned by [`MetaStore::try_begin_resume`]. Holding it means
/// this caller, and only this caller, is driving a `resumeUpload` call;
/// dropping it (by any path, including a panic unwind) clears the flag so
/// the next resume attempt — from a button click, the focus handler, or the
/// online handler — can proceed.
pub struct ResumeGuard {
    state: Arc<Mutex<Inner>>,
}

impl Drop for ResumeGuard {
    fn drop(&mut self) {
        let mut inner = self.state.lock().expect("MetaStore mutex poisoned");
        inner.ui.is_resuming = false;
    }
}

/// Narrow key/value backend `MetaStorePersistence` is built on: three string
/// operations, nothing more. Each concrete store (`FileKvStore`,
/// `IndexedDbKvStore`, `MemoryKvStore`) only has to implement this.
///
/// Split the same way as `BlobStore`: native needs `Send + Sync` to live
/// behind an `Arc` shared across tokio tasks, `wasm32`'s `web-sys` handles
/// aren't `Send` so the bound is dropped there.
#[cfg(not(target_arch = "wasm32"))]
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_string(&self, key: &str) -> UploadResult<Option<String>>;
    async fn put_string(&self, key: &str, value: &str) -> UploadResult<()>;
    async fn delete(&self, key: &str) -> UploadResult<()>;
}

#[cfg(target_arch = "wasm32")]
#[async_trait(?Send)]
pub trait KvStore {
    async fn get_string(&self, key: &str) -> UploadResult<Option<String>>;
    async fn put_string(&self, key: &str, value: &str) -> UploadResult<()>;
    async fn delete(&self, key: &str) -> UploadResult<()>;
}

/// What gets persisted: the upload registry plus the schema version it was
/// written under, so a future reader knows whether to migrate.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Projection {
    pub uploads: BTreeMap<String, UploadRecord>,
    pub version: u32,
}

#[cfg(not(target_arch = "wasm32"))]
#[async_trait]
pub trait MetaStorePersistence: Send + Sync {
    async fn load(&self) -> UploadResult<Projection>;
    async fn save(&self, projection: &Projection) -> UploadResult<()>;
}

#[cfg(target_arch = "wasm32")]
#[async_trait(?Send)]
pub trait MetaStorePersistence {
    async fn load(&self) -> UploadResult<Projection>;
    async fn save(&self, projection: &Projection) -> UploadResult<()>;
}

/// Adapts any [`KvStore`] into a [`MetaStorePersistence`] by JSON-encoding
/// the whole [`Projection`] under [`PERSISTENCE_KEY`].
pub struct KvPersistence<K: KvStore> {
    kv: K,
    logger: Logger,
}

impl<K: KvStore> KvPersistence<K> {
    pub fn new(kv: K) -> Self {
        Self {
            kv,
            logger: Logger::new("meta_store::persistence"),
        }
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl<K: KvStore> MetaStorePersistence for KvPersistence<K> {
    async fn load(&self) -> UploadResult<Projection> {
        let Some(raw) = self.kv.get_string(PERSISTENCE_KEY).await? else {
            return Ok(Projection::default());
        };
        let parsed: Value = serde_json::from_str(&raw)
            .map_err(|err| storage_error(format!("persisted uploads are not valid JSON: {err}")))?;
        let old_version = parsed
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        if old_version == CURRENT_SCHEMA_VERSION {
            match serde_json::from_value::<Projection>(parsed.clone()) {
                Ok(projection) => return Ok(projection),
                Err(err) => self
                    .logger
                    .warn(format!("current-version projection failed to parse directly: {err}; migrating")),
            }
        }
        Ok(migrate(parsed, old_version, &self.logger))
    }

    async fn save(&self, projection: &Projection) -> UploadResult<()> {
        let encoded = serde_json::to_string(projection)
            .map_err(|err| storage_error(format!("failed to encode uploads for persistence: {err}")))?;
        self.kv.put_string(PERSISTENCE_KEY, &encoded).await
    }
}

/// Migrates an arbitrary persisted JSON blob to [`CURRENT_SCHEMA_VERSION`].
/// Always returns a usable (possibly empty) projection rather than failing
/// outright — a corrupt or ancient persisted blob is a reason to start
/// fresh, not to crash the engine on the next reload.
fn migrate(old: Value, old_version: u32, logger: &Logger) -> Projection {
    let raw_uploads = old.get("uploads").cloned().unwrap_or(Value::Null);
    let entries = match raw_uploads {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };

    let mut uploads = BTreeMap::new();
    for (id, mut value) in entries {
        if old_version < 4 {
            if let Value::Object(obj) = &mut value {
                obj.entry("needsFile").or_insert(Value::Bool(false));
            }
        }
        match serde_json::from_value::<UploadRecord>(value) {
            Ok(record) => {
                uploads.insert(id, record);
            }
            Err(err) => {
                logger.warn(format!("dropping unparseable persisted upload {id}: {err}"));
            }
        }
    }

    Projection {
        uploads,
        version: CURRENT_SCHEMA_VERSION,
    }
}

struct Inner {
    uploads: HashMap<String, UploadRecord>,
    ui: UiState,
    listeners: Vec<Listener<()>>,
}

/// The engine's single source of truth for upload records and UI state.
/// All mutations go through `&self` methods that lock, mutate, notify, and
/// unlock without ever holding the lock across an `.await` — persistence
/// writes happen after the lock is released.
pub struct MetaStore {
    state: Arc<Mutex<Inner>>,
    persistence: Arc<dyn MetaStorePersistence>,
    logger: Logger,
}

impl MetaStore {
    pub async fn load(persistence: Arc<dyn MetaStorePersistence>) -> UploadResult<Self> {
        let projection = persistence.load().await?;
        Ok(Self {
            state: Arc::new(Mutex::new(Inner {
                uploads: projection.uploads.into_iter().collect(),
                ui: UiState::default(),
                listeners: Vec::new(),
            })),
            persistence,
            logger: Logger::new("meta_store"),
        })
    }

    fn notify(&self, inner: &Inner) {
        for listener in &inner.listeners {
            listener(&());
        }
    }

    async fn persist(&self) -> UploadResult<()> {
        let projection = {
            let inner = self.state.lock().expect("MetaStore mutex poisoned");
            Projection {
                uploads: inner.uploads.clone().into_iter().collect(),
                version: CURRENT_SCHEMA_VERSION,
            }
        };
        if let Err(err) = self.persistence.save(&projection).await {
            self.logger.error(format!("failed to persist uploads: {err}"));
            return Err(err);
        }
        Ok(())
    }

    pub fn subscribe(&self, listener: Listener<()>) -> Unsubscribe {
        let state = Arc::clone(&self.state);
        {
            let mut inner = state.lock().expect("MetaStore mutex poisoned");
            inner.listeners.push(Arc::clone(&listener));
        }
        Box::new(move || {
            let mut inner = state.lock().expect("MetaStore mutex poisoned");
            inner.listeners.retain(|l| !Arc::ptr_eq(l, &listener));
        })
    }

    pub fn get_upload(&self, id: &str) -> Option<UploadRecord> {
        let inner = self.state.lock().expect("MetaStore mutex poisoned");
        inner.uploads.get(id).cloned()
    }

    pub fn get_uploads(&self) -> Vec<UploadRecord> {
        let inner = self.state.lock().expect("MetaStore mutex poisoned");
        let mut records: Vec<_> = inner.uploads.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub fn get_active_uploads(&self) -> Vec<UploadRecord> {
        self.get_uploads()
            .into_iter()
            .filter(|r| r.status.is_active())
            .collect()
    }

    /// Inserts or replaces a record and persists the change.
    pub async fn add(&self, record: UploadRecord) -> UploadResult<()> {
        {
            let mut inner = self.state.lock().expect("MetaStore mutex poisoned");
            inner.uploads.insert(record.upload_id.clone(), record);
            self.notify(&inner);
        }
        self.persist().await
    }

    /// Renames a record's key, used when a server-assigned id replaces a
    /// temporary client-side id.
    pub async fn rekey(&self, old_id: &str, new_id: &str) -> UploadResult<()> {
        {
            let mut inner = self.state.lock().expect("MetaStore mutex poisoned");
            if let Some(mut record) = inner.uploads.remove(old_id) {
                record.upload_id = new_id.to_string();
                inner.uploads.insert(new_id.to_string(), record);
            }
            self.notify(&inner);
        }
        self.persist().await
    }

    pub async fn update<F>(&self, id: &str, mutator: F) -> UploadResult<()>
    where
        F: FnOnce(&mut UploadRecord),
    {
        let found = {
            let mut inner = self.state.lock().expect("MetaStore mutex poisoned");
            let found = if let Some(record) = inner.uploads.get_mut(id) {
                mutator(record);
                true
            } else {
                false
            };
            self.notify(&inner);
            found
        };
        if !found {
            return Err(UploadError::new(
                UploadErrorCode::Internal,
                format!("update called for unknown upload id {id}"),
            ));
        }
        self.persist().await
    }

    pub async fn set_status(&self, id: &str, status: UploadStatus) -> UploadResult<()> {
        self.update(id, |record| record.status = status).await
    }

    pub async fn update_progress(&self, id: &str, chunk_index: u32) -> UploadResult<()> {
        self.update(id, |record| {
            record.uploaded_chunks.insert(chunk_index);
        })
        .await
    }

    pub async fn record_error(&self, id: &str, message: impl Into<String>, now: DateTime<Utc>) -> UploadResult<()> {
        let message = message.into();
        self.update(id, move |record| record.mark_error(message, now)).await
    }

    pub async fn remove(&self, id: &str) -> UploadResult<()> {
        {
            let mut inner = self.state.lock().expect("MetaStore mutex poisoned");
            inner.uploads.remove(id);
            self.notify(&inner);
        }
        self.persist().await
    }

    /// Drops records that are either terminally failed/canceled, or older
    /// than 24h, when they match `filename`/`filesize` of an incoming file.
    /// Completed records are deliberately exempt — a finished upload is
    /// never "stale" just because it's old.
    pub async fn clear_stale_uploads(&self, filename: &str, filesize: u64) -> UploadResult<()> {
        let now = Utc::now();
        {
            let mut inner = self.state.lock().expect("MetaStore mutex poisoned");
            inner.uploads.retain(|_, record| {
                let matches_incoming = record.filename == filename && record.filesize == filesize;
                !(matches_incoming && record.status != UploadStatus::Completed && record.is_stale(now))
            });
            self.notify(&inner);
        }
        self.persist().await
    }

    pub async fn clear_all(&self) -> UploadResult<()> {
        {
            let mut inner = self.state.lock().expect("MetaStore mutex poisoned");
            inner.uploads.clear();
            self.notify(&inner);
        }
        self.persist().await
    }

    pub fn ui_state(&self) -> UiState {
        let inner = self.state.lock().expect("MetaStore mutex poisoned");
        inner.ui.clone()
    }

    pub fn set_offline(&self, offline: bool) {
        let mut inner = self.state.lock().expect("MetaStore mutex poisoned");
        inner.ui.is_offline = offline;
        self.notify(&inner);
    }

    pub fn set_loading(&self, loading: bool) {
        let mut inner = self.state.lock().expect("MetaStore mutex poisoned");
        inner.ui.is_loading = loading;
        self.notify(&inner);
    }

    pub fn set_error(&self, error: Option<String>) {
        let mut inner = self.state.lock().expect("MetaStore mutex poisoned");
        inner.ui.error = error;
        self.notify(&inner);
    }

    pub fn set_drag_over(&self, drag_over: bool) {
        let mut inner = self.state.lock().expect("MetaStore mutex poisoned");
        inner.ui.drag_over = drag_over;
        self.notify(&inner);
    }

    /// Mutual-exclusion guard around `resumeUpload`: returns `None` if
    /// another resume is already in progress.
    pub fn try_begin_resume(&self) -> Option<ResumeGuard> {
        let mut inner = self.state.lock().expect("MetaStore mutex poisoned");
        if inner.ui.is_resuming {
            return None;
        }
        inner.ui.is_resuming = true;
        Some(ResumeGuard {
            state: Arc::clone(&self.state),
        })
    }
}

/// Native file-backed [`KvStore`], one JSON blob per path.
#[cfg(not(target_arch = "wasm32"))]
pub struct FileKvStore {
    path: std::path::PathBuf,
}

#[cfg(not(target_arch = "wasm32"))]
impl FileKvStore {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(not(target_arch = "wasm32"))]
#[async_trait]
impl KvStore for FileKvStore {
    async fn get_string(&self, _key: &str) -> UploadResult<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(storage_error(format!("failed to read {}: {err}", self.path.display()))),
        }
    }

    async fn put_string(&self, _key: &str, value: &str) -> UploadResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| storage_error(format!("failed to create {}: {err}", parent.display())))?;
        }
        tokio::fs::write(&self.path, value)
            .await
            .map_err(|err| storage_error(format!("failed to write {}: {err}", self.path.display())))
    }

    async fn delete(&self, _key: &str) -> UploadResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_error(format!("failed to remove {}: {err}", self.path.display()))),
        }
    }
}

/// IndexedDB-backed [`KvStore`] for `wasm-web`, reusing the same database
/// and object store the blob side uses but under a distinct key.
#[cfg(all(feature = "wasm-web", target_arch = "wasm32"))]
pub struct IndexedDbKvStore {
    db_name: String,
    store_name: String,
}

#[cfg(all(feature = "wasm-web", target_arch = "wasm32"))]
impl IndexedDbKvStore {
    pub fn new() -> Self {
        Self {
            db_name: "ResumableUploadDB".to_string(),
            store_name: "meta".to_string(),
        }
    }
}

#[cfg(all(feature = "wasm-web", target_arch = "wasm32"))]
impl Default for IndexedDbKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(feature = "wasm-web", target_arch = "wasm32"))]
#[async_trait(?Send)]
impl KvStore for IndexedDbKvStore {
    async fn get_string(&self, key: &str) -> UploadResult<Option<String>> {
        let db = crate::platform::browser::indexed_db::open_database_with_store(&self.db_name, 1, &self.store_name)
            .await
            .map_err(|err| storage_error(format!("IndexedDB open failed: {err}")))?;
        crate::platform::browser::indexed_db::get_string(&db, &self.store_name, key)
            .await
            .map_err(|err| storage_error(format!("IndexedDB get failed: {err}")))
    }

    async fn put_string(&self, key: &str, value: &str) -> UploadResult<()> {
        let db = crate::platform::browser::indexed_db::open_database_with_store(&self.db_name, 1, &self.store_name)
            .await
            .map_err(|err| storage_error(format!("IndexedDB open failed: {err}")))?;
        crate::platform::browser::indexed_db::put_string(&db, &self.store_name, key, value)
            .await
            .map_err(|err| storage_error(format!("IndexedDB put failed: {err}")))
    }

    async fn delete(&self, key: &str) -> UploadResult<()> {
        let db = crate::platform::browser::indexed_db::open_database_with_store(&self.db_name, 1, &self.store_name)
            .await
            .map_err(|err| storage_error(format!("IndexedDB open failed: {err}")))?;
        crate::platform::browser::indexed_db::delete_key(&db, &self.store_name, key)
            .await
            .map_err(|err| storage_error(format!("IndexedDB delete failed: {err}")))
    }
}

/// In-memory [`KvStore`] used by tests and as a fallback when no durable
/// backend is configured.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl KvStore for MemoryKvStore {
    async fn get_string(&self, key: &str) -> UploadResult<Option<String>> {
        Ok(self.entries.lock().expect("MemoryKvStore mutex poisoned").get(key).cloned())
    }

    async fn put_string(&self, key: &str, value: &str) -> UploadResult<()> {
        self.entries
            .lock()
            .expect("MemoryKvStore mutex poisoned")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> UploadResult<()> {
        self.entries.lock().expect("MemoryKvStore mutex poisoned").remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn sample_record(id: &str) -> UploadRecord {
        UploadRecord::new(
            id.to_string(),
            "f.bin".into(),
            "application/octet-stream".into(),
            10,
            5,
            now(),
        )
    }

    async fn store() -> MetaStore {
        let persistence = Arc::new(KvPersistence::new(MemoryKvStore::new()));
        MetaStore::load(persistence).await.unwrap()
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let store = store().await;
        store.add(sample_record("id1")).await.unwrap();
        assert!(store.get_upload("id1").is_some());
    }

    #[tokio::test]
    async fn set_status_updates_record() {
        let store = store().await;
        store.add(sample_record("id1")).await.unwrap();
        store.set_status("id1", UploadStatus::Uploading).await.unwrap();
        assert_eq!(store.get_upload("id1").unwrap().status, UploadStatus::Uploading);
    }

    #[tokio::test]
    async fn update_unknown_id_errors() {
        let store = store().await;
        let result = store.set_status("missing", UploadStatus::Paused).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn subscribe_is_notified_on_mutation() {
        let store = store().await;
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _unsub = store.subscribe(Arc::new(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        store.add(sample_record("id1")).await.unwrap();
        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_notifications() {
        let store = store().await;
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let unsub = store.subscribe(Arc::new(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        unsub();
        store.add(sample_record("id1")).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn clear_stale_uploads_keeps_completed() {
        let store = store().await;
        let mut completed = sample_record("done");
        completed.status = UploadStatus::Completed;
        completed.created_at = now() - chrono::Duration::hours(48);
        store.add(completed).await.unwrap();

        let mut failed = sample_record("failed");
        failed.status = UploadStatus::Failed;
        store.add(failed).await.unwrap();

        store.clear_stale_uploads("f.bin", 10).await.unwrap();

        assert!(store.get_upload("done").is_some());
        assert!(store.get_upload("failed").is_none());
    }

    #[tokio::test]
    async fn persistence_round_trips_through_kv_store() {
        let persistence = Arc::new(KvPersistence::new(MemoryKvStore::new()));
        let store = MetaStore::load(persistence.clone()).await.unwrap();
        store.add(sample_record("id1")).await.unwrap();

        let reloaded = MetaStore::load(persistence).await.unwrap();
        assert!(reloaded.get_upload("id1").is_some());
    }

    #[tokio::test]
    async fn try_begin_resume_is_mutually_exclusive() {
        let store = store().await;
        let guard = store.try_begin_resume();
        assert!(guard.is_some());
        assert!(store.try_begin_resume().is_none());
        drop(guard);
        assert!(store.try_begin_resume().is_some());
    }

    #[test]
    fn migrate_injects_needs_file_for_old_versions() {
        let old = serde_json::json!({
            "version": 2,
            "uploads": {
                "id1": {
                    "uploadId": "id1",
                    "filename": "a.bin",
                    "filetype": "application/octet-stream",
                    "filesize": 10,
                    "chunkSize": 5,
                    "totalChunks": 2,
                    "uploadedChunks": [],
                    "status": "paused",
                    "createdAt": "2026-01-01T00:00:00Z"
                }
            }
        });
        let logger = Logger::new("test");
        let projection = migrate(old, 2, &logger);
        assert_eq!(projection.version, CURRENT_SCHEMA_VERSION);
        assert!(!projection.uploads["id1"].needs_file);
    }

    #[test]
    fn migrate_drops_unparseable_records() {
        let old = serde_json::json!({
            "version": 1,
            "uploads": {
                "bad": { "not": "a valid record" }
            }
        });
        let logger = Logger::new("test");
        let projection = migrate(old, 1, &logger);
        assert!(projection.uploads.is_empty());
    }
}
