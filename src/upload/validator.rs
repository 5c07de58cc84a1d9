use serde::{Deserialize, Serialize};

use crate::media::CandidateFile;
use crate::utils::format_file_size;

/// Size and type policy applied before any network activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPolicy {
    /// Largest accepted file, in bytes
    pub max_bytes: u64,

    /// Accepted MIME types
    pub allowed_mime_types: Vec<String>,
}

/// Why a file was refused locally
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("File too large ({}). Maximum size is {}.", human_size(.size), human_size(.max_bytes))]
    TooLarge { size: u64, max_bytes: u64 },

    #[error("Invalid file type '{mime_type}'. Please upload an audio or video file.")]
    UnsupportedType { mime_type: String },

    #[error("File is empty")]
    Empty,
}

fn human_size(bytes: &u64) -> String {
    format_file_size(*bytes)
}

impl UploadPolicy {
    pub fn new(max_bytes: u64, allowed_mime_types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            max_bytes,
            allowed_mime_types: allowed_mime_types.into_iter().map(Into::into).collect(),
        }
    }

    /// Check a candidate file: size first, then MIME type, then emptiness
    pub fn validate(&self, file: &CandidateFile) -> Result<(), ValidationError> {
        if file.size() > self.max_bytes {
            return Err(ValidationError::TooLarge {
                size: file.size(),
                max_bytes: self.max_bytes,
            });
        }

        if !self.allows(file.mime_type()) {
            return Err(ValidationError::UnsupportedType {
                mime_type: file.mime_type().to_string(),
            });
        }

        if file.size() == 0 {
            return Err(ValidationError::Empty);
        }

        Ok(())
    }

    /// Whether a declared MIME type is on the allow-list
    ///
    /// Comparison ignores case and parameters such as `; codecs=opus`.
    pub fn allows(&self, mime_type: &str) -> bool {
        let essence = mime_type.split(';').next().unwrap_or("").trim();
        self.allowed_mime_types
            .iter()
            .any(|allowed| allowed.trim().eq_ignore_ascii_case(essence))
    }
}
