//! Record of a completed push.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, SyncError};

const SHORT_REVISION_LEN: usize = 7;

/// What a cycle pushed. Built once and never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    branch: String,
    revision: String,
    message: String,
    refspecs: Vec<String>,
    switch_branch: bool,
    completed_at: DateTime<Utc>,
}

impl PushResult {
    /// Builds a result. Fails if `revision` is empty.
    pub fn new(
        branch: impl Into<String>,
        revision: impl Into<String>,
        message: impl Into<String>,
        refspecs: Vec<String>,
        switch_branch: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<Self> {
        let revision = revision.into();
        if revision.is_empty() {
            return Err(SyncError::InvalidPushResult(
                "push revision must not be empty".to_string(),
            ));
        }
        Ok(Self {
            branch: branch.into(),
            revision,
            message: message.into(),
            refspecs,
            switch_branch,
            completed_at,
        })
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn refspecs(&self) -> &[String] {
        &self.refspecs
    }

    pub fn switch_branch(&self) -> bool {
        self.switch_branch
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    /// The revision abbreviated to seven characters when long enough.
    pub fn short_revision(&self) -> &str {
        self.revision
            .get(..SHORT_REVISION_LEN)
            .unwrap_or(&self.revision)
    }

    /// Human-readable summary for status reporting.
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "pushed commit '{}' to branch '{}'",
            self.short_revision(),
            self.branch
        );
        if !self.refspecs.is_empty() {
            let refspecs: Vec<String> = self.refspecs.iter().map(|r| format!("'{}'", r)).collect();
            summary.push_str(" and refspecs ");
            summary.push_str(&refspecs.join(", "));
        }
        if !self.message.is_empty() {
            summary.push('\n');
            summary.push_str(&self.message);
        }
        summary
    }
}
