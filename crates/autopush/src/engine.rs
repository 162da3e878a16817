//! One synchronization cycle: plan, clone, patch, commit, push.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Instrument;

use crate::auth::CredentialResolver;
use crate::commit::CommitPushEngine;
use crate::error::{Result, SyncError};
use crate::git::{CheckedOutCommit, CloneOptions, WorkingCopy};
use crate::loader::LoadedConfig;
use crate::plan::{PlanResolver, ResolvedPlan, GIT_REPOSITORY_KIND};
use crate::resource::{ImagePolicy, ImageUpdateAutomation, ObjectKey, SettingsSpec};
use crate::result::PushResult;
use crate::setters::{Patcher, SetterPatcher};
use crate::template::{DefaultRenderer, MessageRenderer};

/// What a later cycle may reuse from an earlier one.
///
/// The clone is skipped only when both the remote tip and the inputs that
/// shape the tree are unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleHint {
    pub commit: String,
    pub inputs: String,
}

/// Canonical rendering of everything besides the remote tip that decides
/// what a cycle writes: the selected policies, update path and commit inputs.
pub fn cycle_inputs(plan: &ResolvedPlan, policies: &[&ImagePolicy]) -> String {
    let mut images: Vec<(String, &str)> = policies
        .iter()
        .map(|p| (p.key().to_string(), p.spec.latest_image.as_str()))
        .collect();
    images.sort();

    serde_json::json!({
        "policies": images,
        "updatePath": plan.update_path,
        "pushBranch": plan.push_branch,
        "refspec": plan.push.refspec,
        "template": plan.commit.message_template,
        "values": plan.commit.values,
    })
    .to_string()
}

/// Result of a cycle that ran to completion.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleOutcome {
    pub target: ObjectKey,
    /// Commit the working copy was cloned at.
    pub observed_commit: String,
    /// False when the clone was skipped because the remote tip was unchanged.
    pub tree_inspected: bool,
    /// Present when a commit was pushed.
    pub push: Option<PushResult>,
    /// Inputs the cycle ran with, see [`cycle_inputs`].
    pub inputs: String,
    pub started_at: DateTime<Utc>,
}

impl CycleOutcome {
    /// The newest commit known on the push branch after this cycle.
    pub fn last_commit(&self) -> &str {
        self.push
            .as_ref()
            .map(PushResult::revision)
            .unwrap_or(&self.observed_commit)
    }

    /// The hint for the next cycle of the same automation.
    pub fn hint(&self) -> CycleHint {
        CycleHint {
            commit: self.last_commit().to_string(),
            inputs: self.inputs.clone(),
        }
    }
}

/// Runs cycles for automations against a loaded configuration.
pub struct SyncEngine {
    resolver: PlanResolver,
    patcher: Arc<dyn Patcher>,
    committer: CommitPushEngine,
    work_root: Option<PathBuf>,
}

impl SyncEngine {
    /// Creates an engine with the built-in patcher and renderer.
    pub fn new(credentials: Arc<CredentialResolver>, settings: SettingsSpec) -> Result<Self> {
        let work_root = settings.work_directory.as_ref().map(PathBuf::from);
        Ok(Self {
            resolver: PlanResolver::new(credentials, settings),
            patcher: Arc::new(SetterPatcher::new()?),
            committer: CommitPushEngine::new(Arc::new(DefaultRenderer)),
            work_root,
        })
    }

    /// Replaces the patcher.
    pub fn with_patcher(mut self, patcher: Arc<dyn Patcher>) -> Self {
        self.patcher = patcher;
        self
    }

    /// Replaces the commit message renderer.
    pub fn with_renderer(mut self, renderer: Arc<dyn MessageRenderer>) -> Self {
        self.committer = CommitPushEngine::new(renderer);
        self
    }

    /// Overrides the parent directory of working copies.
    pub fn with_work_root(mut self, work_root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(work_root.into());
        self
    }

    pub fn settings(&self) -> &SettingsSpec {
        self.resolver.settings()
    }

    /// Resolves the plan for an automation without touching the remote.
    pub async fn plan(
        &self,
        automation: &ImageUpdateAutomation,
        config: &LoadedConfig,
    ) -> Result<ResolvedPlan> {
        let source_key = self.resolver.source_key(automation)?;
        let source = config
            .repository(&source_key.namespace, &source_key.name)
            .ok_or_else(|| SyncError::ResourceNotFound {
                kind: GIT_REPOSITORY_KIND.to_string(),
                name: source_key.to_string(),
            })?;
        self.resolver.resolve(automation, source).await
    }

    /// Runs one cycle for `automation`.
    ///
    /// `last` is the hint left by the previous cycle, if any.
    pub async fn run_cycle(
        &self,
        automation: &ImageUpdateAutomation,
        config: &LoadedConfig,
        last: Option<&CycleHint>,
    ) -> Result<CycleOutcome> {
        let target = automation.key();
        let span = tracing::info_span!("cycle", automation = %target);
        self.run_cycle_inner(automation, config, last)
            .instrument(span)
            .await
    }

    async fn run_cycle_inner(
        &self,
        automation: &ImageUpdateAutomation,
        config: &LoadedConfig,
        last: Option<&CycleHint>,
    ) -> Result<CycleOutcome> {
        let started_at = Utc::now();
        let plan = self.plan(automation, config).await?;
        let policies = config.policies_for(automation);
        let inputs = cycle_inputs(&plan, &policies);

        let last_observed_commit = match last {
            Some(hint) if hint.inputs == inputs => Some(hint.commit.clone()),
            Some(_) => {
                log::debug!("{}: inputs changed since last cycle", plan.target);
                None
            }
            None => None,
        };
        let options = CloneOptions {
            shallow: None,
            last_observed_commit,
        };
        // The working copy is removed when it goes out of scope, on every path
        let (working_copy, checked_out) =
            WorkingCopy::clone(&plan, self.work_root.as_deref(), &options).await?;

        let observed_commit = match checked_out {
            CheckedOutCommit::Concrete(hash) => hash,
            CheckedOutCommit::Unchanged(tip) => {
                log::info!("{}: remote tip {} unchanged since last cycle", plan.target, tip);
                return Ok(CycleOutcome {
                    target: plan.target.clone(),
                    observed_commit: tip,
                    tree_inspected: false,
                    push: None,
                    inputs,
                    started_at,
                });
            }
        };

        let update_dir = resolve_update_dir(working_copy.path(), &plan.update_path)?;
        log::debug!(
            "{}: applying {} polic(ies) under '{}'",
            plan.target,
            policies.len(),
            plan.update_path
        );
        let diff = self.patcher.patch(&update_dir, &policies)?;

        let push = self
            .committer
            .commit_and_push(&working_copy, &plan, &diff, started_at)
            .await?;

        match &push {
            Some(result) => log::info!("{}: {}", plan.target, result.summary()),
            None => log::info!("{}: no updates made", plan.target),
        }

        Ok(CycleOutcome {
            target: plan.target.clone(),
            observed_commit,
            tree_inspected: true,
            push,
            inputs,
            started_at,
        })
    }
}

/// Resolves the update path inside the working copy.
///
/// Absolute paths and paths leaving the working copy are rejected.
pub fn resolve_update_dir(root: &Path, update_path: &str) -> Result<PathBuf> {
    let relative = Path::new(update_path);
    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => resolved.push(part),
            _ => {
                return Err(SyncError::InvalidConfig(format!(
                    "update path '{}' must stay inside the repository",
                    update_path
                )))
            }
        }
    }
    Ok(resolved)
}
