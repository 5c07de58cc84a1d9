//! Session credentials and the boundary to the identity provider
//!
//! The upload pipeline only ever asks a [`CredentialProvider`] for the
//! current session. How that session came to exist (password sign-in, a
//! token from the environment, a test fixture) is decided by the caller.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod session;
pub mod sign_in;

pub use session::{SessionStore, StoredSessionProvider};
pub use sign_in::{PasswordAuthenticator, SignInError};

/// A bearer token and the identity it represents
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredential {
    /// Identity provider user id
    pub user_id: String,

    /// Opaque bearer token
    pub access_token: String,

    /// When the token stops being accepted
    pub expires_at: DateTime<Utc>,

    /// E-mail used to sign in, for display
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl SessionCredential {
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
            expires_at,
            email: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).max(Duration::zero())
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("email", &self.email)
            .finish()
    }
}

/// Authentication failures seen by the upload pipeline
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("You must be logged in to upload files")]
    NoSession,
}

/// Source of the current session
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// The session in effect right now, or `None` when nobody is signed in
    async fn current_session(&self) -> Option<SessionCredential>;
}

/// A fixed session, e.g. a token handed over through the environment
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    session: Option<SessionCredential>,
}

impl StaticCredentials {
    pub fn new(session: SessionCredential) -> Self {
        Self { session: Some(session) }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn current_session(&self) -> Option<SessionCredential> {
        self.session.clone().filter(|session| !session.is_expired())
    }
}
