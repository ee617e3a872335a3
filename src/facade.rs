//! The crate's single public entry point: construct one [`UploadsFacade`]
//! per app and drive every upload through it.
//!
//! Grounded on the teacher's `storage/api.rs`, which exposes the storage
//! module's whole surface as a handful of top-level functions delegating to
//! `service.rs`/`upload.rs`; `UploadsFacade` plays the same role here.

use std::sync::Arc;

use crate::engine::{self, EngineContext};
use crate::error::{invalid_argument, UploadResult};
use crate::model::{is_temp_id, UiState, UploadRecord, DEFAULT_CHUNK_SIZE};
use crate::supervisor::{Supervisor, SupervisorOptions};
use crate::util::{Listener, Unsubscribe};

/// The whole engine, wired up and ready to drive uploads from application
/// code (a CLI, a desktop shell, or `wasm-bindgen` bindings into a browser
/// UI).
pub struct UploadsFacade {
    ctx: EngineContext,
    supervisor: Arc<Supervisor>,
}

impl UploadsFacade {
    pub async fn new(
        ctx: EngineContext,
        connectivity: Arc<dyn crate::supervisor::ConnectivityMonitor>,
        focus: Arc<dyn crate::supervisor::FocusMonitor>,
        options: SupervisorOptions,
    ) -> Self {
        let supervisor = Supervisor::start(ctx.clone(), connectivity, focus, options).await;
        Self { ctx, supervisor }
    }

    /// Registers `blob` as a new upload and begins transmitting it.
    /// `chunk_size` defaults to [`DEFAULT_CHUNK_SIZE`] when `None`.
    pub async fn add_upload(
        &self,
        filename: String,
        filetype: String,
        filesize: u64,
        blob: Vec<u8>,
        chunk_size: Option<u64>,
    ) -> UploadResult<String> {
        if filesize == 0 {
            return Err(invalid_argument("cannot upload an empty file"));
        }
        engine::add_upload(
            &self.ctx,
            filename,
            filetype,
            filesize,
            chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            blob,
        )
        .await
    }

    pub async fn start_upload(&self, id: &str) -> UploadResult<()> {
        self.reject_temp_id(id)?;
        engine::start_upload(&self.ctx, id).await
    }

    pub async fn pause_upload(&self, id: &str) -> UploadResult<()> {
        self.reject_temp_id(id)?;
        engine::pause_upload(&self.ctx, id).await
    }

    pub async fn resume_upload(&self, id: &str) -> UploadResult<()> {
        self.reject_temp_id(id)?;
        engine::resume_upload(&self.ctx, id).await
    }

    pub async fn cancel_upload(&self, id: &str) -> UploadResult<()> {
        self.reject_temp_id(id)?;
        engine::cancel_upload(&self.ctx, id).await
    }

    pub async fn remove_upload(&self, id: &str) -> UploadResult<()> {
        self.reject_temp_id(id)?;
        engine::remove_upload(&self.ctx, id).await
    }

    pub fn get_uploads(&self) -> Vec<UploadRecord> {
        self.ctx.meta.get_uploads()
    }

    pub fn get_upload(&self, id: &str) -> Option<UploadRecord> {
        self.ctx.meta.get_upload(id)
    }

    pub fn ui_state(&self) -> UiState {
        self.ctx.meta.ui_state()
    }

    pub fn subscribe(&self, listener: Listener<()>) -> Unsubscribe {
        self.ctx.meta.subscribe(listener)
    }

    /// `start`/`pause`/`resume`/`cancel`/`remove` only make sense once the
    /// server has assigned a real id; a still-`temp_`-prefixed id means the
    /// `initiate` round trip hasn't completed yet.
    fn reject_temp_id(&self, id: &str) -> UploadResult<()> {
        if is_temp_id(id) {
            return Err(invalid_argument(format!(
                "upload {id} has not finished registering with the server yet"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobStore, MemoryBlobStore};
    use crate::meta_store::{KvPersistence, MemoryKvStore, MetaStore};
    use crate::retry::RetryOptions;
    use crate::supervisor::{ManualConnectivityMonitor, ManualFocusMonitor};
    use crate::transport::{TransportClient, TransportConfig};
    use httpmock::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    async fn facade_for(server: &MockServer) -> UploadsFacade {
        let persistence = Arc::new(KvPersistence::new(MemoryKvStore::new()));
        let meta = Arc::new(MetaStore::load(persistence).await.unwrap());
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let retry = RetryOptions {
            retries: 1,
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
        };
        let transport = Arc::new(
            TransportClient::new(TransportConfig {
                base_url: server.base_url(),
                timeout: Duration::from_secs(5),
                chunk_timeout: Duration::from_secs(5),
                retry,
            })
            .unwrap(),
        );
        let ctx = EngineContext::new(meta, blobs, transport, retry);
        UploadsFacade::new(
            ctx,
            Arc::new(ManualConnectivityMonitor::new()),
            Arc::new(ManualFocusMonitor::new()),
            Default::default(),
        )
        .await
    }

    #[tokio::test]
    async fn add_upload_rejects_empty_file() {
        let server = MockServer::start();
        let facade = facade_for(&server).await;
        let result = facade
            .add_upload("f.bin".into(), "application/octet-stream".into(), 0, vec![], None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn operations_reject_temp_ids() {
        let server = MockServer::start();
        let facade = facade_for(&server).await;
        let result = facade.pause_upload("temp_12345").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn full_lifecycle_completes_a_small_upload() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/initiate");
            then.status(200).json_body(json!({
                "uploadId": "up_real",
                "chunkSize": 5,
                "totalChunks": 1
            }));
        });
        server.mock(|when, then| {
            when.method(POST).path("/up_real/chunk");
            then.status(200);
        });
        server.mock(|when, then| {
            when.method(POST).path("/up_real/complete");
            then.status(200);
        });

        let facade = facade_for(&server).await;
        let id = facade
            .add_upload(
                "f.bin".into(),
                "application/octet-stream".into(),
                5,
                vec![1, 2, 3, 4, 5],
                Some(5),
            )
            .await
            .unwrap();
        assert_eq!(id, "up_real");
        assert_eq!(
            facade.get_upload(&id).unwrap().status,
            crate::model::UploadStatus::Pending
        );

        facade.start_upload(&id).await.unwrap();
        assert_eq!(
            facade.get_upload(&id).unwrap().status,
            crate::model::UploadStatus::Completed
        );
    }
}
