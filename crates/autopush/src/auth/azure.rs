//! Azure workload identity: federated token to Azure DevOps bearer token.

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use serde::Deserialize;

use super::{AccessToken, ExchangeOptions};
use crate::error::{Result, SyncError};

const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com/";

/// Azure DevOps resource scope.
const AZURE_DEVOPS_SCOPE: &str = "499b84ac-1321-427f-aa17-267ca6975798/.default";

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Exchanges the ambient workload identity for a bearer token.
#[async_trait]
pub trait WorkloadIdentityProvider: Send + Sync {
    async fn access_token(&self, options: &ExchangeOptions) -> Result<AccessToken>;

    /// Identifies the ambient identity for cache keys.
    fn fingerprint(&self) -> String;
}

/// Workload identity configured through the standard Azure environment.
#[derive(Debug, Clone, Default)]
pub struct AzureWorkloadIdentity {
    pub client_id: Option<String>,
    pub tenant_id: Option<String>,
    pub federated_token_file: Option<String>,
    pub authority_host: Option<String>,
}

impl AzureWorkloadIdentity {
    /// Reads `AZURE_CLIENT_ID`, `AZURE_TENANT_ID`, `AZURE_FEDERATED_TOKEN_FILE`
    /// and `AZURE_AUTHORITY_HOST`.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            client_id: var("AZURE_CLIENT_ID"),
            tenant_id: var("AZURE_TENANT_ID"),
            federated_token_file: var("AZURE_FEDERATED_TOKEN_FILE"),
            authority_host: var("AZURE_AUTHORITY_HOST"),
        }
    }

    fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
        value.as_deref().ok_or_else(|| exchange_error(format!("{} is not set", name)))
    }

    /// Returns the token endpoint for the configured tenant.
    pub fn token_endpoint(&self) -> Result<String> {
        let tenant = Self::required(&self.tenant_id, "AZURE_TENANT_ID")?;
        let authority = self
            .authority_host
            .as_deref()
            .unwrap_or(DEFAULT_AUTHORITY_HOST);
        Ok(format!(
            "{}/{}/oauth2/v2.0/token",
            authority.trim_end_matches('/'),
            tenant
        ))
    }
}

fn exchange_error(message: impl Into<String>) -> SyncError {
    SyncError::TokenExchange {
        provider: "azure".to_string(),
        message: message.into(),
    }
}

#[async_trait]
impl WorkloadIdentityProvider for AzureWorkloadIdentity {
    async fn access_token(&self, options: &ExchangeOptions) -> Result<AccessToken> {
        #[derive(Debug, Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: i64,
        }

        let client_id = Self::required(&self.client_id, "AZURE_CLIENT_ID")?;
        let token_file = Self::required(&self.federated_token_file, "AZURE_FEDERATED_TOKEN_FILE")?;
        let endpoint = self.token_endpoint()?;

        let assertion = tokio::fs::read_to_string(token_file)
            .await
            .map_err(|e| exchange_error(format!("reading federated token: {}", e)))?;

        let form = [
            ("client_id", client_id),
            ("scope", AZURE_DEVOPS_SCOPE),
            ("grant_type", "client_credentials"),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE),
            ("client_assertion", assertion.trim()),
        ];

        let response = options
            .http_client()?
            .post(&endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    SyncError::GitNetworkError(format!("Azure token exchange: {}", e))
                } else {
                    exchange_error(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(exchange_error(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|e| exchange_error(e.to_string()))?;

        Ok(AccessToken {
            token: SecretString::from(payload.access_token),
            expires_at: Utc::now() + chrono::Duration::seconds(payload.expires_in),
        })
    }

    fn fingerprint(&self) -> String {
        format!(
            "{}/{}",
            self.tenant_id.as_deref().unwrap_or_default(),
            self.client_id.as_deref().unwrap_or_default()
        )
    }
}
