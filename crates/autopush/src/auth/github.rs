//! GitHub App installation token exchange.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{
    AccessToken, ExchangeOptions, GITHUB_APP_BASE_URL_KEY, GITHUB_APP_ID_KEY,
    GITHUB_APP_INSTALLATION_ID_KEY, GITHUB_APP_PRIVATE_KEY_KEY,
};
use crate::error::{Result, SyncError};
use crate::secrets::Secret;

const DEFAULT_GITHUB_API_BASE_URL: &str = "https://api.github.com";

/// GitHub App credentials read from a secret.
#[derive(Clone)]
pub struct GitHubAppCredentials {
    pub app_id: String,
    pub installation_id: String,
    pub private_key: SecretString,
    pub api_base_url: String,
}

impl std::fmt::Debug for GitHubAppCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubAppCredentials")
            .field("app_id", &self.app_id)
            .field("installation_id", &self.installation_id)
            .field("api_base_url", &self.api_base_url)
            .finish_non_exhaustive()
    }
}

impl GitHubAppCredentials {
    /// Reads the App fields; the API base URL is optional.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let app_id = secret.require(GITHUB_APP_ID_KEY)?.expose_secret().trim().to_string();
        let installation_id = secret
            .require(GITHUB_APP_INSTALLATION_ID_KEY)?
            .expose_secret()
            .trim()
            .to_string();
        let private_key = secret.require(GITHUB_APP_PRIVATE_KEY_KEY)?.clone();
        let api_base_url = secret
            .get(GITHUB_APP_BASE_URL_KEY)
            .map(|u| u.expose_secret().trim().to_string())
            .unwrap_or_else(|| DEFAULT_GITHUB_API_BASE_URL.to_string());

        Ok(Self {
            app_id,
            installation_id,
            private_key,
            api_base_url,
        })
    }

    /// Identifies the credential without exposing the private key.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}/{}@{}",
            self.app_id,
            self.installation_id,
            self.api_base_url.trim_end_matches('/')
        )
    }

    /// Signs the App JWT used to request installation tokens.
    pub fn generate_jwt(&self, now: u64) -> Result<String> {
        #[derive(Debug, Serialize)]
        struct Claims {
            iat: u64,
            exp: u64,
            iss: String,
        }

        let claims = Claims {
            iat: now.saturating_sub(60),
            exp: now + 600,
            iss: self.app_id.clone(),
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.expose_secret().as_bytes())
            .map_err(|e| exchange_error(format!("invalid App private key: {}", e)))?;

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| exchange_error(e.to_string()))
    }
}

fn exchange_error(message: impl Into<String>) -> SyncError {
    SyncError::TokenExchange {
        provider: "github".to_string(),
        message: message.into(),
    }
}

/// Mints installation access tokens for a GitHub App.
#[async_trait]
pub trait GitHubAppTokenProvider: Send + Sync {
    async fn installation_token(
        &self,
        app: &GitHubAppCredentials,
        options: &ExchangeOptions,
    ) -> Result<AccessToken>;
}

/// Token provider calling the GitHub REST API.
#[derive(Debug, Default)]
pub struct HttpGitHubAppTokenProvider;

impl HttpGitHubAppTokenProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GitHubAppTokenProvider for HttpGitHubAppTokenProvider {
    async fn installation_token(
        &self,
        app: &GitHubAppCredentials,
        options: &ExchangeOptions,
    ) -> Result<AccessToken> {
        #[derive(Debug, Deserialize)]
        struct InstallationTokenResponse {
            token: String,
            expires_at: String,
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| exchange_error(e.to_string()))?
            .as_secs();
        let jwt = app.generate_jwt(now)?;
        let endpoint = format!(
            "{}/app/installations/{}/access_tokens",
            app.api_base_url.trim_end_matches('/'),
            app.installation_id
        );

        log::debug!("Requesting installation token from {}", endpoint);

        let response = options
            .http_client()?
            .post(endpoint)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "autopush")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .bearer_auth(jwt)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    SyncError::GitNetworkError(format!("GitHub token exchange: {}", e))
                } else {
                    exchange_error(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read token response body".to_string());
            return Err(exchange_error(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        let payload: InstallationTokenResponse = response
            .json()
            .await
            .map_err(|e| exchange_error(e.to_string()))?;

        let expires_at = DateTime::parse_from_rfc3339(&payload.expires_at)
            .map_err(|e| exchange_error(format!("invalid expires_at '{}': {}", payload.expires_at, e)))?
            .with_timezone(&Utc);

        Ok(AccessToken {
            token: SecretString::from(payload.token),
            expires_at,
        })
    }
}
