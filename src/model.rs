//! The data model of the upload engine: [`UploadRecord`], [`UploadStatus`],
//! and the never-persisted [`UiState`] bag.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default chunk size: 5 MiB, per spec.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// A temporary id assigned between local registration and server acknowledgment.
pub fn temp_id(now: DateTime<Utc>) -> String {
    format!("temp_{}", now.timestamp_millis())
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with("temp_")
}

/// Lifecycle states. `Completed`, `Failed`, and `Canceled` are terminal: no
/// chunk transmission occurs for a record in one of those states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Initiating,
    Pending,
    Uploading,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Canceled
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// The engine's per-file state container, keyed externally by `uploadId`.
///
/// `uploaded_bytes` and `progress` are derived, not stored, so they can never
/// drift from `uploaded_chunks` (spec.md: "callers never set those
/// directly" — here that's enforced by the type rather than by convention).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub upload_id: String,
    pub filename: String,
    pub filetype: String,
    pub filesize: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub uploaded_chunks: BTreeSet<u32>,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub needs_file: bool,
    #[serde(default)]
    pub s3_key: Option<String>,
}

impl UploadRecord {
    pub fn new(
        upload_id: String,
        filename: String,
        filetype: String,
        filesize: u64,
        chunk_size: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let total_chunks = total_chunks_for(filesize, chunk_size);
        Self {
            upload_id,
            filename,
            filetype,
            filesize,
            chunk_size,
            total_chunks,
            uploaded_chunks: BTreeSet::new(),
            status: UploadStatus::Initiating,
            created_at: now,
            last_error: None,
            last_error_at: None,
            needs_file: false,
            s3_key: None,
        }
    }

    /// Length in bytes of chunk `index`, accounting for a short final chunk.
    pub fn chunk_len(&self, index: u32) -> u64 {
        let start = index as u64 * self.chunk_size;
        let end = std::cmp::min(self.filesize, start + self.chunk_size);
        end.saturating_sub(start)
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_chunks
            .iter()
            .map(|&idx| self.chunk_len(idx))
            .sum()
    }

    pub fn progress(&self) -> f64 {
        if self.filesize == 0 {
            return 0.0;
        }
        let pct = 100.0 * self.uploaded_bytes() as f64 / self.filesize as f64;
        pct.clamp(0.0, 100.0)
    }

    pub fn is_complete(&self) -> bool {
        self.uploaded_chunks.len() as u32 == self.total_chunks
    }

    pub fn recompute_total_chunks(&mut self) {
        self.total_chunks = total_chunks_for(self.filesize, self.chunk_size);
    }

    pub fn mark_error(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.last_error = Some(message.into());
        self.last_error_at = Some(now);
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
        self.last_error_at = None;
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let older_than_24h = now.signed_duration_since(self.created_at) > chrono::Duration::hours(24);
        let terminal_failure = matches!(self.status, UploadStatus::Failed | UploadStatus::Canceled);
        older_than_24h || terminal_failure
    }
}

pub fn total_chunks_for(filesize: u64, chunk_size: u64) -> u32 {
    if filesize == 0 {
        return 0;
    }
    (filesize.div_ceil(chunk_size)) as u32
}

/// UI-facing state, never persisted and rebuilt fresh on every load.
#[derive(Clone, Debug, Default)]
pub struct UiState {
    pub is_loading: bool,
    pub error: Option<String>,
    pub is_offline: bool,
    pub is_resuming: bool,
    pub drag_over: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn total_chunks_rounds_up() {
        assert_eq!(total_chunks_for(12 * 1024 * 1024, 5 * 1024 * 1024), 3);
        assert_eq!(total_chunks_for(0, 5), 0);
        assert_eq!(total_chunks_for(1, 5), 1);
    }

    #[test]
    fn progress_and_uploaded_bytes_track_the_chunk_set() {
        let mut record = UploadRecord::new(
            "id".into(),
            "f.bin".into(),
            "application/octet-stream".into(),
            12 * 1024 * 1024,
            5 * 1024 * 1024,
            now(),
        );
        assert_eq!(record.total_chunks, 3);
        record.uploaded_chunks.insert(0);
        record.uploaded_chunks.insert(1);
        assert_eq!(record.uploaded_bytes(), 10 * 1024 * 1024);
        assert!(!record.is_complete());
        record.uploaded_chunks.insert(2);
        assert_eq!(record.uploaded_bytes(), 12 * 1024 * 1024);
        assert_eq!(record.progress(), 100.0);
        assert!(record.is_complete());
    }

    #[test]
    fn last_chunk_is_short_when_filesize_not_a_multiple_of_chunk_size() {
        let record = UploadRecord::new(
            "id".into(),
            "f.bin".into(),
            "application/octet-stream".into(),
            (5 * 1024 * 1024) + 7,
            5 * 1024 * 1024,
            now(),
        );
        assert_eq!(record.total_chunks, 2);
        assert_eq!(record.chunk_len(1), 7);
    }

    #[test]
    fn completed_is_never_stale_by_name_size_rule_alone() {
        // `is_stale` only inspects this record in isolation; the name/size
        // match is the caller's (MetaStore::clear_stale_uploads) job.
        let mut record = UploadRecord::new(
            "id".into(),
            "f.bin".into(),
            "application/octet-stream".into(),
            10,
            5,
            now(),
        );
        record.status = UploadStatus::Completed;
        assert!(!record.is_stale(now()));
    }
}
