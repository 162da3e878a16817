//! Git output parsing helpers.

use std::process::Output;

use semver::{Version, VersionReq};

use crate::error::{Result, SyncError};

/// Formats a git error with both stdout and stderr for better debugging.
pub fn format_git_error(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => format!(
            "Command failed with exit code {}",
            output.status.code().unwrap_or(-1)
        ),
        (true, false) => stdout,
        (false, true) => stderr,
        (false, false) => format!("{}\n{}", stderr, stdout),
    }
}

/// A reference advertised by `git ls-remote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    pub hash: String,
    pub name: String,
}

/// Parses `git ls-remote` output.
///
/// Peeled tag entries (`refs/tags/x^{}`) replace the tag object hash with the
/// commit they point to. Symref lines (`ref: ...`) are ignored.
pub fn parse_ls_remote(output: &str) -> Vec<RemoteRef> {
    let mut refs: Vec<RemoteRef> = Vec::new();

    for line in output.lines() {
        if line.starts_with("ref:") {
            continue;
        }
        let Some((hash, name)) = line.split_once('\t') else {
            continue;
        };
        let (hash, name) = (hash.trim(), name.trim());
        if hash.is_empty() || name.is_empty() {
            continue;
        }

        if let Some(tag) = name.strip_suffix("^{}") {
            if let Some(existing) = refs.iter_mut().find(|r| r.name == tag) {
                existing.hash = hash.to_string();
            } else {
                refs.push(RemoteRef {
                    hash: hash.to_string(),
                    name: tag.to_string(),
                });
            }
        } else if !refs.iter().any(|r| r.name == name) {
            refs.push(RemoteRef {
                hash: hash.to_string(),
                name: name.to_string(),
            });
        }
    }

    refs
}

/// Parses a tag name as a version, tolerating a leading `v`.
fn parse_tag_version(tag: &str) -> Option<Version> {
    let trimmed = tag.strip_prefix('v').unwrap_or(tag);
    Version::parse(trimmed).ok()
}

/// Returns the highest tag whose version satisfies `range`.
pub fn pick_semver_tag<'a>(range: &str, tags: impl IntoIterator<Item = &'a str>) -> Result<String> {
    let req = VersionReq::parse(range.trim()).map_err(|e| {
        SyncError::InvalidConfig(format!("invalid semver range '{}': {}", range, e))
    })?;

    tags.into_iter()
        .filter_map(|tag| parse_tag_version(tag).map(|v| (v, tag)))
        .filter(|(v, _)| req.matches(v))
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, tag)| tag.to_string())
        .ok_or_else(|| {
            SyncError::ReferenceNotFound(format!("no tag matches semver range '{}'", range))
        })
}
