//! Credential resolution: turns a source and its secrets into transport auth.
//!
//! Dispatch is closed over [`GitProvider`]. Every provider yields the same
//! [`AuthOptions`] shape, which [`env::build_git_env`] later turns into the
//! environment of a git process.

pub mod azure;
pub mod cache;
pub mod env;
pub mod github;
pub mod proxy;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::{Result, SyncError};
use crate::resource::{GitProvider, GitRepository, ObjectKey};
use crate::secrets::{Secret, SecretStore};

pub use azure::{AzureWorkloadIdentity, WorkloadIdentityProvider};
pub use cache::TokenCache;
pub use env::{build_git_env, GitEnv};
pub use github::{GitHubAppCredentials, GitHubAppTokenProvider, HttpGitHubAppTokenProvider};
pub use proxy::ProxyOptions;

/// Secret keys carrying GitHub App credentials.
pub const GITHUB_APP_ID_KEY: &str = "githubAppID";
pub const GITHUB_APP_INSTALLATION_ID_KEY: &str = "githubAppInstallationID";
pub const GITHUB_APP_PRIVATE_KEY_KEY: &str = "githubAppPrivateKey";
pub const GITHUB_APP_BASE_URL_KEY: &str = "githubAppBaseURL";

/// Username paired with GitHub App installation tokens.
pub const GITHUB_TOKEN_USERNAME: &str = "x-access-token";

/// Transport derived from the repository URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Https,
    Ssh,
    File,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Http => write!(f, "http"),
            TransportKind::Https => write!(f, "https"),
            TransportKind::Ssh => write!(f, "ssh"),
            TransportKind::File => write!(f, "file"),
        }
    }
}

/// A short-lived credential returned by a token exchange.
#[derive(Clone)]
pub struct AccessToken {
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Provider-specific data attached to exchanged credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderData {
    pub provider: GitProvider,
    pub expires_at: DateTime<Utc>,
}

/// Transport-level authentication for one repository.
#[derive(Debug, Clone)]
pub struct AuthOptions {
    pub transport: TransportKind,
    pub host: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub bearer_token: Option<SecretString>,
    /// Private SSH key.
    pub identity: Option<SecretString>,
    pub known_hosts: Option<String>,
    pub provider_data: Option<ProviderData>,
}

impl AuthOptions {
    /// Anonymous options derived from the URL alone.
    pub fn from_url(url: &str) -> Result<Self> {
        let (transport, host, username) = parse_transport(url)?;
        Ok(Self {
            transport,
            host,
            username,
            password: None,
            bearer_token: None,
            identity: None,
            known_hosts: None,
            provider_data: None,
        })
    }

    /// Returns true if any credential material is present.
    pub fn has_credentials(&self) -> bool {
        self.password.is_some() || self.bearer_token.is_some() || self.identity.is_some()
    }
}

/// Parses a repository URL into its transport kind, host and URL username.
///
/// Absolute local paths are accepted as `file` transports.
pub fn parse_transport(raw: &str) -> Result<(TransportKind, String, Option<String>)> {
    if raw.starts_with('/') {
        return Ok((TransportKind::File, String::new(), None));
    }

    let url = Url::parse(raw).map_err(|e| SyncError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    let transport = match url.scheme() {
        "http" => TransportKind::Http,
        "https" => TransportKind::Https,
        "ssh" => TransportKind::Ssh,
        "file" => TransportKind::File,
        other => {
            return Err(SyncError::InvalidUrl {
                url: raw.to_string(),
                reason: format!("unsupported scheme '{}'", other),
            })
        }
    };

    let host = url.host_str().unwrap_or_default().to_string();
    if host.is_empty() && transport != TransportKind::File {
        return Err(SyncError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }

    let username = Some(url.username())
        .filter(|u| !u.is_empty())
        .map(str::to_string);

    Ok((transport, host, username))
}

/// Settings for outbound token exchanges.
#[derive(Debug, Clone)]
pub struct ExchangeOptions {
    pub proxy: Option<ProxyOptions>,
    pub timeout: Duration,
}

impl ExchangeOptions {
    /// Builds an HTTP client honouring the proxy and timeout.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(proxy.to_reqwest()?);
        }
        builder.build().map_err(|e| SyncError::TokenExchange {
            provider: "http".to_string(),
            message: e.to_string(),
        })
    }
}

/// Resolves [`AuthOptions`] for sources, dispatching on the provider.
pub struct CredentialResolver {
    secrets: Arc<dyn SecretStore>,
    github: Arc<dyn GitHubAppTokenProvider>,
    workload_identity: Arc<dyn WorkloadIdentityProvider>,
    cache: Option<TokenCache>,
}

impl CredentialResolver {
    /// Creates a resolver with the HTTP-backed providers and no token cache.
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            secrets,
            github: Arc::new(HttpGitHubAppTokenProvider::new()),
            workload_identity: Arc::new(AzureWorkloadIdentity::from_env()),
            cache: None,
        }
    }

    /// Replaces the GitHub App token provider.
    pub fn with_github_provider(mut self, provider: Arc<dyn GitHubAppTokenProvider>) -> Self {
        self.github = provider;
        self
    }

    /// Replaces the workload identity provider.
    pub fn with_workload_identity(mut self, provider: Arc<dyn WorkloadIdentityProvider>) -> Self {
        self.workload_identity = provider;
        self
    }

    /// Enables token reuse through the given cache.
    pub fn with_token_cache(mut self, cache: TokenCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Returns the secret store.
    pub fn secrets(&self) -> &Arc<dyn SecretStore> {
        &self.secrets
    }

    /// Fetches a secret referenced from `namespace`.
    pub async fn secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        Ok(self.secrets.get_secret(namespace, name).await?)
    }

    /// Resolves the proxy referenced by the source, if any.
    pub async fn resolve_proxy(&self, repo: &GitRepository) -> Result<Option<ProxyOptions>> {
        let Some(reference) = &repo.spec.proxy_secret_ref else {
            return Ok(None);
        };
        let secret = self.secret(repo.namespace(), &reference.name).await?;
        Ok(Some(ProxyOptions::from_secret(&secret)?))
    }

    /// Resolves auth options for `repo` on behalf of `target`.
    ///
    /// `target` keys the token cache so that two automations sharing a
    /// source never share an exchanged token.
    pub async fn resolve(
        &self,
        target: &ObjectKey,
        repo: &GitRepository,
        proxy: Option<&ProxyOptions>,
        timeout: Duration,
    ) -> Result<AuthOptions> {
        let mut auth = AuthOptions::from_url(&repo.spec.url)?;
        if auth.transport == TransportKind::File {
            return Ok(auth);
        }

        let exchange = ExchangeOptions {
            proxy: proxy.cloned(),
            timeout,
        };

        match repo.spec.provider {
            GitProvider::Generic => {
                let Some(reference) = &repo.spec.secret_ref else {
                    return Ok(auth);
                };
                let secret = self.secret(repo.namespace(), &reference.name).await?;
                apply_generic_secret(&mut auth, &secret)?;
            }
            GitProvider::Github => {
                let Some(reference) = &repo.spec.secret_ref else {
                    return Err(SyncError::InvalidConfig(format!(
                        "provider 'github' requires a secretRef with GitHub App data on {}",
                        repo.key()
                    )));
                };
                let secret = self.secret(repo.namespace(), &reference.name).await?;
                let app = GitHubAppCredentials::from_secret(&secret)?;
                let key = cache::cache_key(GitProvider::Github, target, &app.fingerprint());
                let token = match self.cached(&key) {
                    Some(token) => token,
                    None => {
                        let token = self.github.installation_token(&app, &exchange).await?;
                        self.store(key, &token);
                        token
                    }
                };
                auth.username = Some(GITHUB_TOKEN_USERNAME.to_string());
                auth.password = Some(token.token.clone());
                auth.provider_data = Some(ProviderData {
                    provider: GitProvider::Github,
                    expires_at: token.expires_at,
                });
            }
            GitProvider::Azure => {
                let fingerprint = format!("{}|{}", self.workload_identity.fingerprint(), auth.host);
                let key = cache::cache_key(GitProvider::Azure, target, &fingerprint);
                let token = match self.cached(&key) {
                    Some(token) => token,
                    None => {
                        let token = self.workload_identity.access_token(&exchange).await?;
                        self.store(key, &token);
                        token
                    }
                };
                auth.bearer_token = Some(token.token.clone());
                auth.provider_data = Some(ProviderData {
                    provider: GitProvider::Azure,
                    expires_at: token.expires_at,
                });
            }
        }

        Ok(auth)
    }

    fn cached(&self, key: &str) -> Option<AccessToken> {
        let token = self.cache.as_ref()?.get(key)?;
        log::debug!("Reusing cached token for {}", key);
        Some(token)
    }

    fn store(&self, key: String, token: &AccessToken) {
        if let Some(cache) = &self.cache {
            cache.insert(key, token.clone());
        }
    }
}

/// Reads static credentials from a secret under the generic provider.
fn apply_generic_secret(auth: &mut AuthOptions, secret: &Secret) -> Result<()> {
    if secret.contains(GITHUB_APP_ID_KEY)
        || secret.contains(GITHUB_APP_INSTALLATION_ID_KEY)
        || secret.contains(GITHUB_APP_PRIVATE_KEY_KEY)
    {
        return Err(SyncError::ProviderMismatch {
            secret: secret.key(),
            provider: GitProvider::Generic.to_string(),
        });
    }

    match auth.transport {
        TransportKind::Http | TransportKind::Https => {
            if let Some(username) = secret.get("username") {
                auth.username = Some(username.expose_secret().to_string());
            }
            auth.password = secret.get("password").cloned();
            auth.bearer_token = secret.get("bearerToken").cloned();
        }
        TransportKind::Ssh => {
            auth.identity = secret.get("identity").cloned();
            auth.known_hosts = secret
                .get("known_hosts")
                .map(|k| k.expose_secret().to_string());
            if auth.identity.is_some() && auth.known_hosts.is_none() {
                secret.require("known_hosts")?;
            }
            if let Some(password) = secret.get("password") {
                auth.password = Some(password.clone());
            }
        }
        TransportKind::File => {}
    }

    Ok(())
}
