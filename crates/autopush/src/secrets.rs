//! Secret lookup by name and namespace.
//!
//! The engine never owns secret storage. It asks a [`SecretStore`] for a
//! key/value map and reads the keys it recognises:
//!
//! - `username`, `password`, `bearerToken` for HTTP(S) transports
//! - `identity`, `identity.pub`, `known_hosts` for SSH transports
//! - `address`, `username`, `password` for proxies
//! - `git.asc`, `passphrase` for commit signing
//! - `githubAppID`, `githubAppInstallationID`, `githubAppPrivateKey`,
//!   `githubAppBaseURL` for GitHub App federation

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

/// Error type for secret lookup failures.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Secret '{namespace}/{name}' not found")]
    NotFound { namespace: String, name: String },

    #[error("Secret '{secret}' is missing required field '{field}'")]
    MissingField { secret: String, field: String },

    #[error("Failed to read secret from '{path}': {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Secret '{secret}' field '{field}' is not valid UTF-8")]
    NotUnicode { secret: String, field: String },
}

/// Result type for secret lookups.
pub type Result<T> = std::result::Result<T, SecretError>;

/// A resolved secret: a name, a namespace and its data.
#[derive(Clone)]
pub struct Secret {
    name: String,
    namespace: String,
    data: BTreeMap<String, SecretString>,
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Secret {
    /// Creates a secret from plain string data.
    pub fn new<K, V>(
        namespace: impl Into<String>,
        name: impl Into<String>,
        data: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            data: data
                .into_iter()
                .map(|(k, v)| (k.into(), SecretString::from(v.into())))
                .collect(),
        }
    }

    /// Returns the `namespace/name` of this secret.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Returns true if the secret carries the given field.
    pub fn contains(&self, field: &str) -> bool {
        self.data.contains_key(field)
    }

    /// Returns a field if present and non-empty.
    pub fn get(&self, field: &str) -> Option<&SecretString> {
        self.data
            .get(field)
            .filter(|value| !value.expose_secret().is_empty())
    }

    /// Returns a field or a [`SecretError::MissingField`].
    pub fn require(&self, field: &str) -> Result<&SecretString> {
        self.get(field).ok_or_else(|| SecretError::MissingField {
            secret: self.key(),
            field: field.to_string(),
        })
    }
}

/// Key/value secret lookup by namespace and name.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetches a secret, failing with [`SecretError::NotFound`] when absent.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;
}

/// Secrets held in memory, keyed by `(namespace, name)`.
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<(String, String), Secret>>,
}

impl InMemorySecretStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a secret.
    pub fn insert(&self, secret: Secret) {
        let key = (secret.namespace.clone(), secret.name.clone());
        if let Ok(mut secrets) = self.secrets.write() {
            secrets.insert(key, secret);
        }
    }

    /// Builder-style insert.
    pub fn with_secret(self, secret: Secret) -> Self {
        self.insert(secret);
        self
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let secrets = self.secrets.read().map_err(|_| SecretError::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;
        secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| SecretError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }
}

/// Secrets laid out on disk as `<root>/<namespace>/<name>/<field>`.
///
/// This is the shape of Kubernetes secrets mounted as volumes. Hidden entries
/// (the `..data` symlink farm) are skipped. File contents are taken verbatim so
/// SSH identities and armored keys keep their trailing newlines.
pub struct DirectorySecretStore {
    root: PathBuf,
}

impl DirectorySecretStore {
    /// Creates a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl SecretStore for DirectorySecretStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let dir = self.root.join(namespace).join(name);
        if !dir.is_dir() {
            return Err(SecretError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }

        let entries = fs::read_dir(&dir).map_err(|e| SecretError::FileReadError {
            path: dir.clone(),
            source: e,
        })?;

        let mut data = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| SecretError::FileReadError {
                path: dir.clone(),
                source: e,
            })?;
            let path = entry.path();
            let Some(field) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if field.starts_with('.') || !path.is_file() {
                continue;
            }
            let bytes = fs::read(&path).map_err(|e| SecretError::FileReadError {
                path: path.clone(),
                source: e,
            })?;
            let value = String::from_utf8(bytes).map_err(|_| SecretError::NotUnicode {
                secret: format!("{}/{}", namespace, name),
                field: field.to_string(),
            })?;
            data.insert(field.to_string(), value);
        }

        Ok(Secret::new(namespace, name, data))
    }
}
