//! OpenPGP commit signing through GnuPG.
//!
//! A [`SigningEntity`] owns a private GnuPG home holding exactly one secret
//! key. Construction proves the key can be unlocked, so a wrong or missing
//! passphrase fails the cycle before anything is committed. Git signs through
//! a wrapper `gpg.program` that points at that home and feeds the passphrase.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use secrecy::ExposeSecret;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::auth::env::shell_escape_token;
use crate::error::{Result, SyncError};
use crate::secrets::Secret;

/// Secret key holding the ASCII-armored private key.
pub const SIGNING_KEY_FIELD: &str = "git.asc";

/// Secret key holding the private key passphrase.
pub const PASSPHRASE_FIELD: &str = "passphrase";

/// A secret key as listed by `gpg --with-colons`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretKeyInfo {
    pub key_id: String,
    pub fingerprint: String,
    pub uid: Option<String>,
}

/// Extracts the primary secret keys from `--with-colons` output.
pub fn parse_secret_keys(colons: &str) -> Vec<SecretKeyInfo> {
    let mut keys: Vec<SecretKeyInfo> = Vec::new();
    let mut in_primary = false;

    for line in colons.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first().copied() {
            Some("sec") => {
                keys.push(SecretKeyInfo {
                    key_id: fields.get(4).copied().unwrap_or_default().to_string(),
                    ..Default::default()
                });
                in_primary = true;
            }
            Some("ssb") | Some("pub") | Some("sub") => in_primary = false,
            Some("fpr") if in_primary => {
                if let Some(key) = keys.last_mut() {
                    if key.fingerprint.is_empty() {
                        key.fingerprint = fields.get(9).copied().unwrap_or_default().to_string();
                    }
                }
            }
            Some("uid") if in_primary => {
                if let Some(key) = keys.last_mut() {
                    if key.uid.is_none() {
                        key.uid = fields.get(9).map(|s| s.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    keys
}

/// Returns true if a `gpg` executable can be run.
pub fn gpg_available() -> bool {
    std::process::Command::new("gpg")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// A decrypted signing identity backed by a private GnuPG home.
pub struct SigningEntity {
    home: TempDir,
    key: SecretKeyInfo,
    program: PathBuf,
}

impl std::fmt::Debug for SigningEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningEntity")
            .field("fingerprint", &self.key.fingerprint)
            .field("uid", &self.key.uid)
            .finish_non_exhaustive()
    }
}

impl SigningEntity {
    /// Loads and unlocks the single key carried by the secret.
    pub async fn from_secret(secret: &Secret) -> Result<Self> {
        let armored = secret.require(SIGNING_KEY_FIELD)?;
        let passphrase = secret
            .get(PASSPHRASE_FIELD)
            .map(|p| p.expose_secret().to_string())
            .unwrap_or_default();

        let home = tempfile::Builder::new().prefix("autopush-gpg-").tempdir()?;
        let key_file = write_private(home.path(), "key.asc", armored.expose_secret(), 0o600)?;
        let passphrase_file = write_private(home.path(), "passphrase", &passphrase, 0o600)?;

        let listing = gpg(home.path())
            .args(["--with-colons", "--import-options", "show-only", "--import"])
            .arg(&key_file)
            .output()
            .await
            .map_err(|e| SyncError::SigningKey(format!("failed to run gpg: {}", e)))?;
        if !listing.status.success() {
            return Err(SyncError::SigningKey(format!(
                "secret '{}' does not hold a readable armored key: {}",
                secret.key(),
                String::from_utf8_lossy(&listing.stderr).trim()
            )));
        }

        let mut keys = parse_secret_keys(&String::from_utf8_lossy(&listing.stdout));
        if keys.len() != 1 {
            return Err(SyncError::SigningKey(format!(
                "secret '{}' must hold exactly one private key, found {}",
                secret.key(),
                keys.len()
            )));
        }
        let key = keys.remove(0);

        let import = gpg(home.path())
            .arg("--import")
            .arg(&key_file)
            .output()
            .await?;
        if !import.status.success() {
            return Err(SyncError::SigningKey(format!(
                "failed to import key from '{}': {}",
                secret.key(),
                String::from_utf8_lossy(&import.stderr).trim()
            )));
        }

        // Ultimate owner trust so verification reports a fully valid signature
        let trust_file = write_private(
            home.path(),
            "ownertrust",
            &format!("{}:6:\n", key.fingerprint),
            0o600,
        )?;
        let trust = gpg(home.path())
            .arg("--import-ownertrust")
            .arg(&trust_file)
            .output()
            .await?;
        if !trust.status.success() {
            log::debug!(
                "Failed to set owner trust for {}: {}",
                key.fingerprint,
                String::from_utf8_lossy(&trust.stderr).trim()
            );
        }

        let program = write_private(
            home.path(),
            "gpg-program.sh",
            &format!(
                "#!/bin/sh\nexec gpg --homedir '{}' --batch --no-tty --pinentry-mode loopback --passphrase-file '{}' \"$@\"\n",
                shell_escape_token(&home.path().display().to_string()),
                shell_escape_token(&passphrase_file.display().to_string())
            ),
            0o700,
        )?;

        let entity = Self { home, key, program };
        entity.check_passphrase().await?;

        log::debug!(
            "Loaded signing key {} from secret {}",
            entity.key.fingerprint,
            secret.key()
        );
        Ok(entity)
    }

    /// Signs a throwaway payload to prove the key is unlocked.
    async fn check_passphrase(&self) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(["--local-user", &self.key.fingerprint, "--detach-sign", "--armor"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(b"autopush signing check\n").await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SyncError::SigningKeyDecrypt(format!(
                "key {}: {}",
                self.key.fingerprint,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    /// Returns the primary key fingerprint.
    pub fn fingerprint(&self) -> &str {
        &self.key.fingerprint
    }

    /// Returns the primary user id, if the key carries one.
    pub fn uid(&self) -> Option<&str> {
        self.key.uid.as_deref()
    }

    /// Git configuration making `git commit -S` and `git verify-commit` use this key.
    pub fn git_config(&self) -> Vec<(String, String)> {
        vec![
            ("gpg.format".to_string(), "openpgp".to_string()),
            (
                "gpg.program".to_string(),
                self.program.display().to_string(),
            ),
            ("user.signingkey".to_string(), self.key.fingerprint.clone()),
        ]
    }
}

impl Drop for SigningEntity {
    fn drop(&mut self) {
        // The agent outlives the home directory unless stopped explicitly
        let result = std::process::Command::new("gpgconf")
            .arg("--homedir")
            .arg(self.home.path())
            .args(["--kill", "gpg-agent"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = result {
            log::debug!("Failed to stop gpg-agent: {}", e);
        }
    }
}

fn gpg(home: &Path) -> Command {
    let mut cmd = Command::new("gpg");
    cmd.arg("--homedir")
        .arg(home)
        .args(["--batch", "--no-tty"])
        .stdin(Stdio::null())
        .kill_on_drop(true);
    cmd
}

fn write_private(dir: &Path, name: &str, content: &str, mode: u32) -> Result<PathBuf> {
    let path = dir.join(name);

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
