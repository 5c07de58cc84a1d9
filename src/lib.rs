//! Transcript Uploader - A Rust CLI tool for sending media files to object storage for transcription
//!
//! This library validates audio and video files locally, streams them to an HTTP object store
//! under the signed-in user's bearer token while reporting progress, and then registers the
//! uploaded object in a metadata table.

pub mod auth;
pub mod cli;
pub mod config;
pub mod media;
pub mod output;
pub mod upload;
pub mod utils;

pub use auth::{AuthError, CredentialProvider, SessionCredential};
pub use cli::{Cli, Commands, OutputFormat};
pub use config::Config;
pub use media::{ByteSource, CandidateFile, MediaFormat};
pub use upload::{
    FileRecord, RegistrationError, TransportError, UploadHandle, UploadPipeline, UploadPolicy, UploadState,
    UploadUpdate, ValidationError,
};

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;

/// Why an upload attempt ended without a file record
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Authentication(#[from] AuthError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("Upload cancelled")]
    Cancelled,
}

impl UploadError {
    /// What the user can do about it
    pub fn remedy(&self) -> &'static str {
        match self {
            UploadError::Validation(ValidationError::TooLarge { .. }) => "Choose a smaller file.",
            UploadError::Validation(_) => "Choose an audio or video file.",
            UploadError::Authentication(_) => "Sign in again with `tpupload login`.",
            UploadError::Transport(TransportError::Rejected { status: 401 | 403, .. }) => {
                "Your session may have expired; sign in again and retry."
            }
            UploadError::Transport(TransportError::Source { .. }) => "Check that the file is still readable.",
            UploadError::Transport(_) => "Check your connection and retry the upload.",
            UploadError::Registration(_) => {
                "The file is stored but was not recorded; contact support with the storage path."
            }
            UploadError::Cancelled => "Start the upload again when ready.",
        }
    }

    /// Short machine-friendly name of the failure
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::Validation(ValidationError::TooLarge { .. }) => "too_large",
            UploadError::Validation(ValidationError::UnsupportedType { .. }) => "unsupported_type",
            UploadError::Validation(ValidationError::Empty) => "empty",
            UploadError::Authentication(AuthError::NoSession) => "no_session",
            UploadError::Transport(TransportError::Network { .. }) => "network",
            UploadError::Transport(TransportError::Rejected { .. }) => "rejected_by_service",
            UploadError::Transport(TransportError::Source { .. }) => "unreadable_source",
            UploadError::Registration(RegistrationError::AfterSuccessfulUpload { .. }) => "after_successful_upload",
            UploadError::Cancelled => "cancelled",
        }
    }
}
