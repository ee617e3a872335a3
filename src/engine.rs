//! The upload lifecycle: initiate, transmit chunks, pause/resume, cancel,
//! and reload recovery.
//!
//! Grounded on the teacher's `storage/upload.rs::UploadTask`, but reshaped
//! from an owned-`self` task object into free functions over a shared
//! [`EngineContext`]. The teacher's `UploadTask` is driven by exactly one
//! caller for its whole life; here, a reload can resume an upload that was
//! originally started by a different call site (or a different tab), so the
//! record's id, not an owned struct, is what identifies "this upload" across
//! calls.

use std::sync::Arc;

use chrono::Utc;

use crate::blob_store::{Blob, BlobRecord, BlobStore};
use crate::error::{invalid_argument, missing_blob_error, offline_error, UploadError, UploadResult};
use crate::logger::Logger;
use crate::meta_store::MetaStore;
use crate::model::{temp_id, UploadRecord, UploadStatus};
use crate::retry::RetryOptions;
use crate::transport::TransportClient;

/// Everything the engine's free functions need, bundled so call sites don't
/// have to thread four parameters through every function.
#[derive(Clone)]
pub struct EngineContext {
    pub meta: Arc<MetaStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub transport: Arc<TransportClient>,
    pub retry: RetryOptions,
    logger: Logger,
}

impl EngineContext {
    pub fn new(meta: Arc<MetaStore>, blobs: Arc<dyn BlobStore>, transport: Arc<TransportClient>, retry: RetryOptions) -> Self {
        Self {
            meta,
            blobs,
            transport,
            retry,
            logger: Logger::new("engine"),
        }
    }
}

/// Registers a new upload locally (status `Initiating`, a `temp_` id),
/// kicks off the server-side initiate call, and on success rekeys the
/// record to the server-assigned id, landing it in `Pending`. Does not
/// start transmission; the caller (or the supervisor, on reload) must
/// call [`start_upload`] or [`resume_upload`] to begin the chunk loop.
///
/// Returns the id the caller should track the upload by — the temp id
/// immediately, rekeyed in place once the server responds.
pub async fn add_upload(
    ctx: &EngineContext,
    filename: String,
    filetype: String,
    filesize: u64,
    chunk_size: u64,
    blob: Vec<u8>,
) -> UploadResult<String> {
    if filesize == 0 {
        return Err(invalid_argument("cannot upload an empty file"));
    }
    ctx.meta.clear_stale_uploads(&filename, filesize).await?;

    let now = Utc::now();
    let id = temp_id(now);
    let record = UploadRecord::new(id.clone(), filename.clone(), filetype.clone(), filesize, chunk_size, now);
    ctx.meta.add(record).await?;
    ctx.blobs
        .put(
            &id,
            BlobRecord {
                blob: Blob::new(blob),
                filename: filename.clone(),
                filesize,
                created_at: now,
            },
        )
        .await?;

    match ctx.transport.initiate(&filename, &filetype, filesize).await {
        Ok(response) => {
            let server_id = response.upload_id;
            ctx.meta.rekey(&id, &server_id).await?;
            if let Some(blob_record) = ctx.blobs.get(&id).await? {
                ctx.blobs.put(&server_id, blob_record).await?;
                ctx.blobs.delete(&id).await?;
            }
            ctx.meta
                .update(&server_id, |record| {
                    record.status = UploadStatus::Pending;
                    if let Some(key) = response.s3_key {
                        record.s3_key = Some(key);
                    }
                    if let Some(size) = response.chunk_size {
                        record.chunk_size = size;
                        record.recompute_total_chunks();
                    }
                })
                .await?;
            Ok(server_id)
        }
        Err(err) => {
            record_error(ctx, &id, &err).await;
            ctx.meta.set_status(&id, UploadStatus::Failed).await?;
            Err(err)
        }
    }
}

/// From `Pending` or `Paused`: if offline or the blob is unavailable, the
/// record stays `Paused`; otherwise it flips to `Uploading` and the chunk
/// loop runs to completion or the next interruption.
pub async fn start_upload(ctx: &EngineContext, id: &str) -> UploadResult<()> {
    begin_transmission(ctx, id).await
}

pub async fn pause_upload(ctx: &EngineContext, id: &str) -> UploadResult<()> {
    ctx.meta.set_status(id, UploadStatus::Paused).await?;
    // Best-effort: the server learning about a pause is not required for
    // local pausing to take effect, since the loop re-checks status.
    let _ = ctx.transport.pause(id).await;
    Ok(())
}

/// Like [`start_upload`] but also notifies the server of the resume, and
/// is mutually exclusive with any other in-flight resume: a concurrent
/// call (from a button click, the focus handler, and the online handler
/// racing each other) that loses the race returns immediately rather than
/// double-driving the chunk loop.
pub async fn resume_upload(ctx: &EngineContext, id: &str) -> UploadResult<()> {
    let Some(_guard) = ctx.meta.try_begin_resume() else {
        return Ok(());
    };
    let _ = ctx.transport.resume(id).await;
    begin_transmission(ctx, id).await
}

async fn begin_transmission(ctx: &EngineContext, id: &str) -> UploadResult<()> {
    if ctx.meta.ui_state().is_offline {
        ctx.meta.record_error(id, "offline", Utc::now()).await?;
        return ctx.meta.set_status(id, UploadStatus::Paused).await;
    }
    if ensure_file_available(ctx, id).await.is_err() {
        return ctx.meta.set_status(id, UploadStatus::Paused).await;
    }
    ctx.meta.set_status(id, UploadStatus::Uploading).await?;
    upload_chunks(ctx, id).await
}

pub async fn cancel_upload(ctx: &EngineContext, id: &str) -> UploadResult<()> {
    ctx.meta.set_status(id, UploadStatus::Canceled).await?;
    let _ = ctx.transport.cancel(id).await;
    ctx.blobs.delete(id).await?;
    Ok(())
}

pub async fn remove_upload(ctx: &EngineContext, id: &str) -> UploadResult<()> {
    ctx.blobs.delete(id).await?;
    ctx.meta.remove(id).await
}

/// Confirms the blob for `id` is still available locally, marking the
/// record `needsFile` and returning [`missing_blob_error`] if not. Used
/// before resuming after a reload, where the File object may not have
/// survived (IndexedDB retains bytes; a page that never re-persisted the
/// blob before a crash will not).
pub async fn ensure_file_available(ctx: &EngineContext, id: &str) -> UploadResult<()> {
    match ctx.blobs.get(id).await? {
        Some(_) => {
            ctx.meta.update(id, |record| record.needs_file = false).await?;
            Ok(())
        }
        None => {
            ctx.meta.update(id, |record| record.needs_file = true).await?;
            Err(missing_blob_error())
        }
    }
}

/// Reconciles the local record against the server's view of uploaded
/// chunks, server truth winning on any disagreement about status.
pub async fn refresh_status(ctx: &EngineContext, id: &str) -> UploadResult<()> {
    let status = ctx.transport.status(id).await?;
    ctx.meta
        .update(id, |record| {
            // Reconciliation authoritatively overwrites the local chunk set
            // — the server may have shrunk it relative to what the client
            // last knew about.
            record.uploaded_chunks = status.uploaded_chunks.clone();
            if let Some(server_status) = parse_status(&status.status) {
                record.status = server_status;
            }
        })
        .await
}

fn parse_status(raw: &str) -> Option<UploadStatus> {
    match raw {
        "initiating" => Some(UploadStatus::Initiating),
        "pending" => Some(UploadStatus::Pending),
        "uploading" => Some(UploadStatus::Uploading),
        "paused" => Some(UploadStatus::Paused),
        "completed" => Some(UploadStatus::Completed),
        "failed" => Some(UploadStatus::Failed),
        "canceled" => Some(UploadStatus::Canceled),
        _ => None,
    }
}

/// The chunk-transmission loop: sends every not-yet-uploaded chunk in
/// order, stopping cleanly if the record becomes non-`Uploading` (paused,
/// canceled, or failed) between chunks.
pub async fn upload_chunks(ctx: &EngineContext, id: &str) -> UploadResult<()> {
    loop {
        let record = match ctx.meta.get_upload(id) {
            Some(record) => record,
            None => return Ok(()),
        };
        if record.status != UploadStatus::Uploading {
            return Ok(());
        }
        if record.is_complete() {
            return complete_upload(ctx, id).await;
        }

        let next_chunk = (0..record.total_chunks)
            .find(|idx| !record.uploaded_chunks.contains(idx));
        let Some(chunk_index) = next_chunk else {
            return complete_upload(ctx, id).await;
        };

        if let Err(err) = upload_chunk(ctx, id, &record, chunk_index).await {
            record_error(ctx, id, &err).await;
            ctx.meta.set_status(id, UploadStatus::Paused).await?;
            return Err(err);
        }
    }
}

async fn upload_chunk(ctx: &EngineContext, id: &str, record: &UploadRecord, chunk_index: u32) -> UploadResult<()> {
    if ctx.meta.ui_state().is_offline {
        return Err(offline_error());
    }
    ensure_file_available(ctx, id).await?;
    let blob_record = ctx.blobs.get(id).await?.ok_or_else(missing_blob_error)?;
    let offset = chunk_index as u64 * record.chunk_size;
    let len = record.chunk_len(chunk_index);
    let bytes = blob_record.blob.slice(offset, len);

    ctx.transport
        .upload_chunk(id, chunk_index, record.total_chunks, bytes)
        .await?;
    ctx.meta.update_progress(id, chunk_index).await
}

async fn complete_upload(ctx: &EngineContext, id: &str) -> UploadResult<()> {
    if let Err(err) = ctx.transport.complete(id).await {
        record_error(ctx, id, &err).await;
        ctx.meta.set_status(id, UploadStatus::Failed).await?;
        return Err(err);
    }
    ctx.meta.set_status(id, UploadStatus::Completed).await?;
    ctx.meta.update(id, |record| record.clear_error()).await?;
    ctx.blobs.delete(id).await?;
    Ok(())
}

async fn record_error(ctx: &EngineContext, id: &str, err: &UploadError) {
    let _ = ctx.meta.record_error(id, err.to_string(), Utc::now()).await;
    ctx.logger.warn(format!("upload {id} error: {err}"));
}
