use chrono::{Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::SessionCredential;

/// Why a sign-in attempt failed
#[derive(thiserror::Error, Debug)]
pub enum SignInError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Identity provider rejected the sign-in with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Could not reach the identity provider: {0}")]
    Network(#[from] reqwest::Error),
}

#[derive(Debug, Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    user: TokenUser,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: String,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthErrorBody {
    message: Option<String>,
    msg: Option<String>,
    error_description: Option<String>,
}

/// Email/password sign-in against the identity provider's token endpoint
pub struct PasswordAuthenticator {
    client: Client,
    auth_root: String,
    api_key: Option<String>,
}

impl PasswordAuthenticator {
    /// `auth_root` is the identity service base, e.g. `https://project.example.co/auth/v1`
    pub fn new(client: Client, auth_root: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            auth_root: auth_root.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Exchange credentials for a session
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SessionCredential, SignInError> {
        let url = format!("{}/token?grant_type=password", self.auth_root);
        tracing::debug!("Signing in {} via {}", email, url);

        let mut request = self.client.post(&url).json(&PasswordGrant { email, password });
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            tracing::warn!("Sign-in refused for {}: HTTP {}", email, status);
            return Err(SignInError::InvalidCredentials);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<AuthErrorBody>(&body)
                .ok()
                .and_then(|b| b.message.or(b.msg).or(b.error_description))
                .unwrap_or(body);
            return Err(SignInError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let token: TokenResponse = response.json().await?;
        let expires_at = Duration::try_seconds(token.expires_in)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| SignInError::Rejected {
                status: status.as_u16(),
                message: format!("Unusable session lifetime of {} seconds", token.expires_in),
            })?;
        tracing::info!("Signed in as {}", token.user.id);

        Ok(SessionCredential {
            user_id: token.user.id,
            access_token: token.access_token,
            expires_at,
            email: token.user.email.or_else(|| Some(email.to_string())),
        })
    }
}
