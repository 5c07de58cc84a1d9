use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Media container formats recognised from a file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaFormat {
    Mp3,
    M4a,
    Wav,
    Ogg,
    Flac,
    Webm,
    Mp4,
    Mpeg,
    Mov,
    Avi,
    Mkv,
}

impl MediaFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "mp3" => Some(MediaFormat::Mp3),
            "m4a" | "aac" => Some(MediaFormat::M4a),
            "wav" => Some(MediaFormat::Wav),
            "ogg" | "oga" => Some(MediaFormat::Ogg),
            "flac" => Some(MediaFormat::Flac),
            "webm" => Some(MediaFormat::Webm),
            "mp4" | "m4v" => Some(MediaFormat::Mp4),
            "mpeg" | "mpg" => Some(MediaFormat::Mpeg),
            "mov" | "qt" => Some(MediaFormat::Mov),
            "avi" => Some(MediaFormat::Avi),
            "mkv" => Some(MediaFormat::Mkv),
            _ => None,
        }
    }

    /// Get MIME type for the format
    pub fn mime_type(&self) -> &'static str {
        match self {
            MediaFormat::Mp3 => "audio/mpeg",
            MediaFormat::M4a => "audio/mp4",
            MediaFormat::Wav => "audio/wav",
            MediaFormat::Ogg => "audio/ogg",
            MediaFormat::Flac => "audio/flac",
            MediaFormat::Webm => "audio/webm",
            MediaFormat::Mp4 => "video/mp4",
            MediaFormat::Mpeg => "video/mpeg",
            MediaFormat::Mov => "video/quicktime",
            MediaFormat::Avi => "video/x-msvideo",
            MediaFormat::Mkv => "video/x-matroska",
        }
    }
}

/// MIME type used when the extension is not recognised
pub const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

/// Guess a MIME type from a file name
pub fn guess_mime_type(name: &str) -> &'static str {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(MediaFormat::from_extension)
        .map(|format| format.mime_type())
        .unwrap_or(FALLBACK_MIME_TYPE)
}

/// Where the bytes of a candidate file come from
#[derive(Debug, Clone)]
pub enum ByteSource {
    /// A file on disk, streamed at transfer time
    Path(PathBuf),
    /// An in-memory buffer
    Memory(Bytes),
}

/// A user-selected file awaiting upload
///
/// Immutable once built. Picking another file means building a new value.
#[derive(Debug, Clone)]
pub struct CandidateFile {
    name: String,
    size: u64,
    mime_type: String,
    source: ByteSource,
}

impl CandidateFile {
    /// Build a candidate from a file on disk
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let metadata = fs::metadata(path)
            .await
            .with_context(|| format!("Cannot access file {}", path.display()))?;

        if !metadata.is_file() {
            anyhow::bail!("Path is not a file: {}", path.display());
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("File name is not valid UTF-8: {}", path.display()))?;

        Ok(Self {
            mime_type: guess_mime_type(&name).to_string(),
            name,
            size: metadata.len(),
            source: ByteSource::Path(path.to_path_buf()),
        })
    }

    /// Build a candidate from an in-memory buffer
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            mime_type: mime_type.into(),
            source: ByteSource::Memory(data),
        }
    }

    /// Replace the declared MIME type
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn source(&self) -> &ByteSource {
        &self.source
    }

    /// Lower-cased extension of the original name, if any
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty())
            .map(|ext| ext.to_lowercase())
    }
}
