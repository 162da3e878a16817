//! HTTP(S) proxy settings read from a secret.

use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::{Result, SyncError};
use crate::secrets::Secret;

/// A proxy address with optional basic credentials.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub address: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

impl ProxyOptions {
    /// Reads `address` (required), `username` and `password` from the secret.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let address = secret.require("address")?.expose_secret().trim().to_string();
        Url::parse(&address).map_err(|e| SyncError::InvalidUrl {
            url: address.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            address,
            username: secret
                .get("username")
                .map(|u| u.expose_secret().to_string()),
            password: secret.get("password").cloned(),
        })
    }

    /// Returns the proxy URL with credentials embedded, as git's `http.proxy` expects.
    pub fn to_git_url(&self) -> Result<String> {
        let mut url = Url::parse(&self.address).map_err(|e| SyncError::InvalidUrl {
            url: self.address.clone(),
            reason: e.to_string(),
        })?;
        if let Some(username) = &self.username {
            url.set_username(username).map_err(|_| SyncError::InvalidUrl {
                url: self.address.clone(),
                reason: "cannot carry credentials".to_string(),
            })?;
            if let Some(password) = &self.password {
                url.set_password(Some(password.expose_secret()))
                    .map_err(|_| SyncError::InvalidUrl {
                        url: self.address.clone(),
                        reason: "cannot carry credentials".to_string(),
                    })?;
            }
        }
        Ok(url.to_string())
    }

    /// Builds the equivalent reqwest proxy for token exchanges.
    pub fn to_reqwest(&self) -> Result<reqwest::Proxy> {
        let mut proxy = reqwest::Proxy::all(&self.address).map_err(|e| SyncError::InvalidUrl {
            url: self.address.clone(),
            reason: e.to_string(),
        })?;
        if let Some(username) = &self.username {
            let password = self
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_string())
                .unwrap_or_default();
            proxy = proxy.basic_auth(username, &password);
        }
        Ok(proxy)
    }
}
