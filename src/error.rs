//! The crate's single error type.
//!
//! Every fallible operation in this crate returns [`UploadError`]. The
//! `status` field (present only for errors that came back from an HTTP
//! response) is what [`crate::retry::is_retryable`] classifies on, and the
//! same value's `Display` text is what gets mirrored into
//! `UploadRecord::last_error` so it survives a reload.

use std::error::Error;
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadErrorCode {
    /// No usable HTTP response: DNS failure, connection reset, timeout.
    TransientTransport,
    /// An HTTP response came back with a non-retryable status.
    PermanentTransport,
    /// The device is known to be offline; the call was never attempted.
    Offline,
    /// The blob for this upload could not be found or restored.
    MissingBlob,
    /// A persisted record could not be migrated to the current schema.
    SchemaMigration,
    /// The BlobStore or KvStore backend itself failed.
    Storage,
    /// Caller-supplied input failed validation (e.g. an empty file).
    InvalidArgument,
    /// An invariant the engine relies on was violated.
    Internal,
}

impl UploadErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadErrorCode::TransientTransport => "upload/transient-transport",
            UploadErrorCode::PermanentTransport => "upload/permanent-transport",
            UploadErrorCode::Offline => "upload/offline",
            UploadErrorCode::MissingBlob => "upload/missing-blob",
            UploadErrorCode::SchemaMigration => "upload/schema-migration",
            UploadErrorCode::Storage => "upload/storage",
            UploadErrorCode::InvalidArgument => "upload/invalid-argument",
            UploadErrorCode::Internal => "upload/internal-error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadError {
    pub code: UploadErrorCode,
    message: String,
    pub status: Option<u16>,
    pub server_response: Option<String>,
}

impl UploadError {
    pub fn new(code: UploadErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            server_response: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_server_response(mut self, response: impl Into<String>) -> Self {
        self.server_response = Some(response.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }
}

impl Display for UploadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.server_response {
            Some(server) => write!(f, "{} ({}): {}", self.message, self.code_str(), server),
            None => write!(f, "{} ({})", self.message, self.code_str()),
        }
    }
}

impl Error for UploadError {}

pub type UploadResult<T> = Result<T, UploadError>;

pub fn invalid_argument(message: impl Into<String>) -> UploadError {
    UploadError::new(UploadErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> UploadError {
    UploadError::new(UploadErrorCode::Internal, message)
}

pub fn offline_error() -> UploadError {
    UploadError::new(UploadErrorCode::Offline, "Network offline. Upload paused.")
}

pub fn missing_blob_error() -> UploadError {
    UploadError::new(
        UploadErrorCode::MissingBlob,
        "The file for this upload is no longer available locally. Please reselect it.",
    )
}

pub fn storage_error(message: impl Into<String>) -> UploadError {
    UploadError::new(UploadErrorCode::Storage, message)
}

pub fn transport_error(message: impl Into<String>) -> UploadError {
    UploadError::new(UploadErrorCode::TransientTransport, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_server_response_when_present() {
        let err = UploadError::new(UploadErrorCode::PermanentTransport, "upload failed")
            .with_status(403)
            .with_server_response("forbidden");
        let text = err.to_string();
        assert!(text.contains("upload failed"));
        assert!(text.contains("forbidden"));
        assert!(text.contains("upload/permanent-transport"));
    }
}
