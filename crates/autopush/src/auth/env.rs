//! Git process environment built from resolved auth options.
//!
//! Credentials never appear in argv. Username/password pairs are answered by
//! an askpass script, bearer tokens and proxies travel as `GIT_CONFIG_*`
//! entries, and SSH identities are written to files referenced from
//! `GIT_SSH_COMMAND`. Every file lives in a scratch directory removed when the
//! [`GitEnv`] is dropped.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use tempfile::TempDir;

use super::{AuthOptions, ProxyOptions, TransportKind};
use crate::error::{Result, SyncError};

/// Escapes a token for safe use in single-quoted shell strings.
/// Replaces single quotes with '\'' (end quote, escaped quote, start quote).
pub fn shell_escape_token(token: &str) -> String {
    token.replace('\'', "'\\''")
}

/// Quotes a path for the shell, guarding against leading dashes.
fn shell_quote_path(path: &Path) -> String {
    let escaped = shell_escape_token(&path.display().to_string());
    if escaped.starts_with('-') {
        format!("'./{}'", escaped)
    } else {
        format!("'{}'", escaped)
    }
}

/// Environment for git commands.
///
/// The scratch directory must outlive every git command using this env.
#[derive(Debug)]
pub struct GitEnv {
    /// Environment variables to set for the git command.
    pub env_vars: Vec<(String, String)>,
    scratch: Option<TempDir>,
}

impl GitEnv {
    /// An environment carrying no credentials.
    pub fn anonymous() -> Self {
        Self {
            env_vars: vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())],
            scratch: None,
        }
    }

    /// Returns the scratch directory, if any files were written.
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(|d| d.path())
    }

    /// Adds a variable, replacing an earlier value for the same key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.env_vars.retain(|(k, _)| *k != key);
        self.env_vars.push((key, value.into()));
    }

    fn scratch(&mut self) -> Result<PathBuf> {
        if self.scratch.is_none() {
            let dir = tempfile::Builder::new().prefix(".git-auth-").tempdir()?;
            self.scratch = Some(dir);
        }
        self.scratch
            .as_ref()
            .map(|d| d.path().to_path_buf())
            .ok_or_else(|| SyncError::FileOperation("scratch directory unavailable".to_string()))
    }

    /// Writes an owner-only file into the scratch directory.
    fn write_private(&mut self, name: &str, content: &str, mode: u32) -> Result<PathBuf> {
        let path = self.scratch()?.join(name);

        #[cfg(unix)]
        let mut file = {
            use std::os::unix::fs::OpenOptionsExt;
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode)
                .open(&path)?
        };

        #[cfg(not(unix))]
        let mut file = {
            let _ = mode;
            OpenOptions::new().write(true).create_new(true).open(&path)?
        };

        file.write_all(content.as_bytes())?;
        Ok(path)
    }
}

/// Builds the git environment for the given auth and proxy.
///
/// Credentials over plain HTTP are refused unless `allow_insecure_http`.
pub fn build_git_env(
    auth: &AuthOptions,
    proxy: Option<&ProxyOptions>,
    allow_insecure_http: bool,
) -> Result<GitEnv> {
    let mut env = GitEnv::anonymous();
    let mut config: Vec<(String, String)> = Vec::new();

    if auth.transport == TransportKind::Http && auth.has_credentials() && !allow_insecure_http {
        return Err(SyncError::InvalidConfig(format!(
            "refusing to send credentials to '{}' over plain HTTP",
            auth.host
        )));
    }

    match auth.transport {
        TransportKind::Http | TransportKind::Https => {
            if let Some(token) = &auth.bearer_token {
                config.push((
                    "http.extraHeader".to_string(),
                    format!("Authorization: Bearer {}", token.expose_secret()),
                ));
            }
            if let Some(password) = &auth.password {
                let username = auth.username.as_deref().unwrap_or("git");
                let script = format!(
                    "#!/bin/sh\ncase \"$1\" in\n  Username*) echo '{}' ;;\n  *) echo '{}' ;;\nesac\n",
                    shell_escape_token(username),
                    shell_escape_token(password.expose_secret())
                );
                let path = env.write_private("askpass.sh", &script, 0o700)?;
                let path = path
                    .to_str()
                    .ok_or_else(|| {
                        SyncError::GitAuthFailed(
                            "Temp directory path contains non-UTF8 characters".to_string(),
                        )
                    })?
                    .to_string();
                env.set("GIT_ASKPASS", path);
            }
        }
        TransportKind::Ssh => {
            let mut command = String::from("ssh -o BatchMode=yes");
            if let Some(identity) = &auth.identity {
                let mut key = identity.expose_secret().to_string();
                if !key.ends_with('\n') {
                    key.push('\n');
                }
                let path = env.write_private("identity", &key, 0o600)?;
                command.push_str(&format!(" -i {} -o IdentitiesOnly=yes", shell_quote_path(&path)));
            }
            if let Some(known_hosts) = &auth.known_hosts {
                let path = env.write_private("known_hosts", known_hosts, 0o600)?;
                command.push_str(&format!(
                    " -o StrictHostKeyChecking=yes -o UserKnownHostsFile={}",
                    shell_quote_path(&path)
                ));
            }
            env.set("GIT_SSH_COMMAND", command);
        }
        TransportKind::File => {}
    }

    if let Some(proxy) = proxy {
        config.push(("http.proxy".to_string(), proxy.to_git_url()?));
    }

    if !config.is_empty() {
        env.set("GIT_CONFIG_COUNT", config.len().to_string());
        for (i, (key, value)) in config.into_iter().enumerate() {
            env.set(format!("GIT_CONFIG_KEY_{}", i), key);
            env.set(format!("GIT_CONFIG_VALUE_{}", i), value);
        }
    }

    Ok(env)
}
