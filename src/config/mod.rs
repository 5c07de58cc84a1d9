use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::upload::UploadPolicy;
use crate::utils::{format_file_size, mask_secret, validate_and_normalize_url};

const APP_DIR: &str = "transcript-uploader";
const ENV_URL: &str = "TRANSCRIPT_UPLOADER_URL";
const ENV_ANON_KEY: &str = "TRANSCRIPT_UPLOADER_ANON_KEY";
const ENV_MAX_FILE_SIZE: &str = "TRANSCRIPT_UPLOADER_MAX_FILE_SIZE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Storage, table and identity service settings
    pub service: ServiceConfig,

    /// Local validation policy
    pub upload: UploadConfig,

    /// Application settings
    pub app: AppConfig,

    /// File this configuration was read from
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Project base URL; storage, table and auth endpoints hang off it
    pub url: String,

    /// Public project key sent as `apikey`
    pub anon_key: Option<String>,

    /// Storage bucket receiving uploads
    pub bucket: String,

    /// First path segment of every object
    pub namespace: String,

    /// Table holding file records
    pub files_table: String,

    /// Cache-control max-age attached to uploaded objects
    pub cache_control_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum file size in bytes
    pub max_file_size: u64,

    /// Accepted MIME types
    pub allowed_mime_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where the signed-in session is kept (defaults next to the config file)
    pub session_file: Option<PathBuf>,

    /// Maximum uploads running at once
    pub max_concurrent_uploads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                url: "http://localhost:54321".to_string(),
                anon_key: None,
                bucket: "transcriptpro-files".to_string(),
                namespace: "uploads".to_string(),
                files_table: "files".to_string(),
                cache_control_seconds: Some(3600),
            },
            upload: UploadConfig {
                max_file_size: 200_000_000,
                allowed_mime_types: [
                    "audio/mp3",
                    "audio/mpeg",
                    "audio/wav",
                    "audio/ogg",
                    "video/mp4",
                    "video/mpeg",
                    "video/quicktime",
                    "video/x-msvideo",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            },
            app: AppConfig {
                session_file: None,
                max_concurrent_uploads: 3,
            },
            source_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file or create default
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let config_path = Self::config_path(explicit)?;

        let mut config = if config_path.exists() {
            let content = fs_err::read_to_string(&config_path)
                .context("Failed to read config file")?;

            serde_yaml::from_str::<Config>(&content)
                .context("Failed to parse config file")?
        } else {
            tracing::info!("Writing default configuration to {}", config_path.display());
            let config = Self::default();
            config.save_to(&config_path)?;
            config
        };

        config.source_path = Some(config_path);
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self)
            .context("Failed to serialize config")?;

        fs_err::write(config_path, content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Get configuration file path
    fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }

        // First try current directory for easy testing
        let local_config = PathBuf::from("config.yaml");
        if local_config.exists() {
            return Ok(local_config);
        }

        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?;

        Ok(config_dir.join(APP_DIR).join("config.yaml"))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var(ENV_URL) {
            self.service.url = url;
        }
        if let Ok(key) = std::env::var(ENV_ANON_KEY) {
            self.service.anon_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Ok(size) = std::env::var(ENV_MAX_FILE_SIZE) {
            self.upload.max_file_size = size
                .trim()
                .parse()
                .with_context(|| format!("{} must be a byte count, got '{}'", ENV_MAX_FILE_SIZE, size))?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_and_normalize_url(&self.service.url)
            .context("service.url must be an http(s) URL")?;

        if self.service.bucket.trim().is_empty() {
            anyhow::bail!("Storage bucket must be configured");
        }

        if self.service.files_table.trim().is_empty() {
            anyhow::bail!("Files table must be configured");
        }

        if self.upload.allowed_mime_types.is_empty() {
            anyhow::bail!("At least one allowed MIME type must be configured");
        }

        if self.app.max_concurrent_uploads == 0 {
            anyhow::bail!("max_concurrent_uploads must be at least 1");
        }

        Ok(())
    }

    fn base_url(&self) -> String {
        self.service.url.trim_end_matches('/').to_string()
    }

    /// Storage service base, `{url}/storage/v1`
    pub fn storage_root(&self) -> String {
        format!("{}/storage/v1", self.base_url())
    }

    /// Table API base, `{url}/rest/v1`
    pub fn rest_root(&self) -> String {
        format!("{}/rest/v1", self.base_url())
    }

    /// Identity service base, `{url}/auth/v1`
    pub fn auth_root(&self) -> String {
        format!("{}/auth/v1", self.base_url())
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy::new(self.upload.max_file_size, self.upload.allowed_mime_types.iter().cloned())
    }

    /// Session file location: configured, else next to the config file
    pub fn session_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.app.session_file {
            return Ok(path.clone());
        }

        let dir = match self.source_path.as_deref().and_then(Path::parent) {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => dirs::config_dir()
                .context("Could not determine config directory")?
                .join(APP_DIR),
        };

        Ok(dir.join("session.yaml"))
    }

    /// Display current configuration
    pub fn display(&self) {
        println!("Current Configuration:");
        if let Some(path) = &self.source_path {
            println!("  Config File: {}", path.display());
        }
        println!("  Service URL: {}", self.service.url);
        println!(
            "  API Key: {}",
            self.service.anon_key.as_deref().map(mask_secret).unwrap_or_else(|| "(none)".to_string())
        );
        println!("  Bucket: {}", self.service.bucket);
        println!("  Namespace: {}", self.service.namespace);
        println!("  Files Table: {}", self.service.files_table);
        println!("  Max File Size: {}", format_file_size(self.upload.max_file_size));
        println!("  Allowed Types: {}", self.upload.allowed_mime_types.join(", "));
        println!("  Concurrent Uploads: {}", self.app.max_concurrent_uploads);
    }

    /// Point the user at the file to edit
    pub fn interactive_setup(&self) -> Result<()> {
        println!("Edit the configuration file to change settings:");
        match &self.source_path {
            Some(path) => println!("  {}", path.display()),
            None => println!("  {}", Self::config_path(None)?.display()),
        }
        println!("Environment overrides: {}, {}, {}", ENV_URL, ENV_ANON_KEY, ENV_MAX_FILE_SIZE);
        Ok(())
    }
}
