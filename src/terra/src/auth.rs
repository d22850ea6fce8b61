//! Bearer tokens for Google APIs.
//!
//! A static token (configuration or `GOOGLE_OAUTH_ACCESS_TOKEN`) is used as is.
//! Otherwise tokens come from `gcloud auth print-access-token` and are
//! refreshed well before their one hour lifetime ends.

use crate::WorkspaceApiError;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Environment variable holding a ready-made access token
pub const TOKEN_ENV_VAR: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

const REFRESH_AFTER: Duration = Duration::from_secs(45 * 60);

#[derive(Debug)]
pub struct TokenSource {
    fixed: Option<String>,
    cached: Mutex<Option<(String, Instant)>>,
}

impl TokenSource {
    /// Prefer `configured`, then the environment, then gcloud
    pub fn new(configured: Option<String>) -> Self {
        let fixed = configured
            .filter(|t| !t.trim().is_empty())
            .or_else(|| std::env::var(TOKEN_ENV_VAR).ok())
            .filter(|t| !t.trim().is_empty());

        Self {
            fixed,
            cached: Mutex::new(None),
        }
    }

    pub fn fixed(token: impl Into<String>) -> Self {
        Self {
            fixed: Some(token.into()),
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<String, WorkspaceApiError> {
        if let Some(token) = &self.fixed {
            return Ok(token.clone());
        }

        let mut cached = self.cached.lock().await;
        if let Some((token, fetched_at)) = cached.as_ref() {
            if fetched_at.elapsed() < REFRESH_AFTER {
                return Ok(token.clone());
            }
        }

        let token = gcloud_access_token().await?;
        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }
}

async fn gcloud_access_token() -> Result<String, WorkspaceApiError> {
    log::debug!("Requesting access token from gcloud");

    let output = tokio::process::Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .output()
        .await
        .map_err(|e| WorkspaceApiError::Auth(format!("could not run gcloud: {e}")))?;

    if !output.status.success() {
        return Err(WorkspaceApiError::Auth(format!(
            "gcloud exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(WorkspaceApiError::Auth(
            "gcloud printed an empty token".to_string(),
        ));
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_configured_token_wins() {
        let source = TokenSource::new(Some("abc".to_string()));
        assert_eq!(source.token().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_fixed_token() {
        let source = TokenSource::fixed("xyz");
        assert_eq!(source.token().await.unwrap(), "xyz");
    }
}
