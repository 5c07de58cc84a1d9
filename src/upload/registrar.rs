use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::auth::SessionCredential;

/// Lifecycle of an uploaded file; only `Uploaded` is written here
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadStatus::Uploaded => write!(f, "uploaded"),
            UploadStatus::Processing => write!(f, "processing"),
            UploadStatus::Completed => write!(f, "completed"),
            UploadStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Server-assigned row id, numeric or textual depending on the table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Number(i64),
    Text(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Number(n) => write!(f, "{}", n),
            RecordId::Text(s) => f.write_str(s),
        }
    }
}

/// Row to insert once storage has accepted the object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewFileRecord {
    pub user_id: String,
    pub original_filename: String,
    pub size: u64,
    pub upload_status: UploadStatus,
    pub storage_path: String,
}

/// Persisted metadata for an uploaded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: RecordId,
    pub user_id: String,
    pub original_filename: String,
    pub size: u64,
    pub storage_path: String,
    pub upload_status: UploadStatus,
    pub created_at: DateTime<Utc>,
}

/// Metadata insert failed although the object is in storage
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("File was uploaded to {storage_path} but its record could not be saved: {message}")]
    AfterSuccessfulUpload {
        storage_path: String,
        status: Option<u16>,
        message: String,
    },
}

impl RegistrationError {
    fn new(record: &NewFileRecord, status: Option<u16>, message: impl Into<String>) -> Self {
        RegistrationError::AfterSuccessfulUpload {
            storage_path: record.storage_path.clone(),
            status,
            message: message.into(),
        }
    }
}

/// Writes file metadata for a signed-in user
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataRegistrar: Send + Sync {
    async fn register(&self, session: &SessionCredential, record: &NewFileRecord) -> Result<FileRecord, RegistrationError>;
}

#[derive(Debug, Deserialize)]
struct RestErrorBody {
    message: Option<String>,
    code: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

impl RestErrorBody {
    fn describe(self) -> Option<String> {
        let mut message = self.message?;
        if let Some(code) = self.code {
            message = format!("{} ({})", message, code);
        }
        if let Some(details) = self.details {
            message = format!("{}; {}", message, details);
        }
        if let Some(hint) = self.hint {
            message = format!("{}; hint: {}", message, hint);
        }
        Some(message)
    }
}

/// Inserts rows through a REST table endpoint: `POST {root}/{table}`
pub struct RestMetadataRegistrar {
    client: Client,
    rest_root: String,
    table: String,
    api_key: Option<String>,
}

impl RestMetadataRegistrar {
    /// `rest_root` is the table API base, e.g. `https://project.example.co/rest/v1`
    pub fn new(client: Client, rest_root: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            client,
            rest_root: rest_root.into().trim_end_matches('/').to_string(),
            table: table.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }
}

#[async_trait]
impl MetadataRegistrar for RestMetadataRegistrar {
    async fn register(&self, session: &SessionCredential, record: &NewFileRecord) -> Result<FileRecord, RegistrationError> {
        let url = format!("{}/{}", self.rest_root, self.table);
        tracing::debug!("Registering {} in {}", record.storage_path, url);

        let mut request = self
            .client
            .post(&url)
            .bearer_auth(&session.access_token)
            .header("Prefer", "return=representation")
            .json(record);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RegistrationError::new(record, None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<RestErrorBody>(&body)
                .ok()
                .and_then(RestErrorBody::describe)
                .unwrap_or(body);
            return Err(RegistrationError::new(record, Some(status.as_u16()), message));
        }

        let rows: Vec<FileRecord> = response
            .json()
            .await
            .map_err(|e| RegistrationError::new(record, Some(status.as_u16()), format!("Unreadable insert response: {}", e)))?;

        rows.into_iter()
            .next()
            .ok_or_else(|| RegistrationError::new(record, Some(status.as_u16()), "Insert returned no rows"))
    }
}
