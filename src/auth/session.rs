use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{CredentialProvider, SessionCredential};

/// On-disk home of the signed-in session
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored session, `Ok(None)` when there is none
    pub fn load(&self) -> Result<Option<SessionCredential>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs_err::read_to_string(&self.path)
            .context("Failed to read session file")?;

        let session = serde_yaml::from_str(&content)
            .context("Failed to parse session file")?;

        Ok(Some(session))
    }

    /// Persist a session, readable by the owner only
    pub fn save(&self, session: &SessionCredential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(session)
            .context("Failed to serialize session")?;

        let mut options = fs_err::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use fs_err::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;

        // An existing file keeps its old mode on open
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.file().set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(content.as_bytes())
            .context("Failed to write session file")?;

        Ok(())
    }

    /// Remove the stored session; returns whether one existed
    pub fn clear(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }

        fs_err::remove_file(&self.path)
            .context("Failed to remove session file")?;
        Ok(true)
    }
}

/// Reads the session file every time it is asked
///
/// A missing, expired or unreadable session counts as signed out.
#[derive(Debug, Clone)]
pub struct StoredSessionProvider {
    store: SessionStore,
}

impl StoredSessionProvider {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CredentialProvider for StoredSessionProvider {
    async fn current_session(&self) -> Option<SessionCredential> {
        match self.store.load() {
            Ok(Some(session)) if session.is_expired() => {
                tracing::warn!("Stored session for {} expired at {}", session.user_id, session.expires_at);
                None
            }
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Ignoring unreadable session file {}: {:#}", self.store.path().display(), e);
                None
            }
        }
    }
}
