//! Commit and push of a patched working copy.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::diff::StructuredDiff;
use crate::error::Result;
use crate::git::WorkingCopy;
use crate::plan::ResolvedPlan;
use crate::result::PushResult;
use crate::template::{MessageRenderer, TemplateData};

/// Turns a structured diff into a commit on the push branch.
pub struct CommitPushEngine {
    renderer: Arc<dyn MessageRenderer>,
}

impl CommitPushEngine {
    pub fn new(renderer: Arc<dyn MessageRenderer>) -> Self {
        Self { renderer }
    }

    /// Commits the working copy and pushes it.
    ///
    /// Returns `Ok(None)` when there is nothing to commit, so replaying a
    /// cycle against an unchanged tree never creates an empty commit. A
    /// failed push is returned as is; the local commit is left in place and
    /// discarded with the working copy.
    pub async fn commit_and_push(
        &self,
        working_copy: &WorkingCopy,
        plan: &ResolvedPlan,
        diff: &StructuredDiff,
        started_at: DateTime<Utc>,
    ) -> Result<Option<PushResult>> {
        if diff.is_empty() {
            log::debug!("{}: no changes to commit", plan.target);
            return Ok(None);
        }

        let data = TemplateData::new(plan.target.clone(), diff, plan.commit.values.clone());
        let message = self.renderer.render(&plan.commit.message_template, &data)?;

        working_copy.stage_all().await?;
        if !working_copy.has_staged_changes().await? {
            log::info!(
                "{}: diff reported {} change(s) but nothing was staged",
                plan.target,
                diff.len()
            );
            return Ok(None);
        }

        let signing = plan.signing.as_ref();
        let revision = working_copy
            .commit(&message, &plan.commit.author, started_at, signing)
            .await?;
        if let Some(entity) = signing {
            working_copy.verify_commit(&revision, entity).await?;
            log::debug!(
                "{}: commit {} signed by {}",
                plan.target,
                revision,
                entity.fingerprint()
            );
        }

        let force = plan.force_push();
        working_copy
            .push(&plan.push_branch, force, &plan.push.options)
            .await?;
        log::info!(
            "{}: pushed {} to branch '{}'{}",
            plan.target,
            revision,
            plan.push_branch,
            if force { " (forced)" } else { "" }
        );

        let mut refspecs = Vec::new();
        if let Some(refspec) = &plan.push.refspec {
            working_copy.push_refspec(refspec, &plan.push.options).await?;
            log::info!("{}: pushed refspec '{}'", plan.target, refspec);
            refspecs.push(refspec.clone());
        }

        PushResult::new(
            plan.push_branch.clone(),
            revision,
            message,
            refspecs,
            plan.switch_branch,
            Utc::now(),
        )
        .map(Some)
    }
}
