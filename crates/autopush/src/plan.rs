//! Resolution of an automation and its source into one execution plan.
//!
//! Each precedence rule is a pure function so it can be tested on its own.
//! [`PlanResolver::resolve`] only composes them with credential and signing
//! lookups; nothing here touches a remote or the local disk beyond the
//! scratch files owned by the resolved credentials.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::auth::{AuthOptions, CredentialResolver, ProxyOptions, TransportKind};
use crate::error::{Result, SyncError};
use crate::resource::{
    CommitUser, FeatureGates, GitRepository, GitRepositoryRef, ImageUpdateAutomation, ObjectKey,
    PushSpec, SettingsSpec,
};
use crate::signing::SigningEntity;

/// Name git gives the default branch when the remote does not say otherwise.
pub const DEFAULT_BRANCH: &str = "master";

/// Timeout applied when neither the source nor the settings provide one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default commit message when the automation declares no template.
pub const DEFAULT_MESSAGE_TEMPLATE: &str = "Update from image update automation";

/// Source kind accepted by the engine.
pub const GIT_REPOSITORY_KIND: &str = "GitRepository";

/// Timeout = source timeout if present, else the default.
pub fn resolve_timeout(source_timeout: Option<u64>, default: Duration) -> Duration {
    source_timeout.map(Duration::from_secs).unwrap_or(default)
}

/// Checkout reference = automation override, else source reference, else none.
pub fn resolve_checkout_ref(
    automation: Option<&GitRepositoryRef>,
    source: Option<&GitRepositoryRef>,
) -> Option<GitRepositoryRef> {
    automation.or(source).cloned()
}

/// Resolves the push branch and whether the working copy must switch to it.
///
/// A declared push branch wins and switching is needed when it differs from
/// the effective checkout branch. Without one, the checkout branch is reused.
pub fn resolve_push_branch(
    push: Option<&PushSpec>,
    checkout: Option<&GitRepositoryRef>,
) -> Result<(String, bool)> {
    let checkout_branch = checkout.and_then(GitRepositoryRef::branch_name);

    if let Some(branch) = push.and_then(PushSpec::branch_name) {
        let effective = checkout_branch.unwrap_or(DEFAULT_BRANCH);
        return Ok((branch.to_string(), branch != effective));
    }

    match checkout_branch {
        Some(branch) => Ok((branch.to_string(), false)),
        None => Err(SyncError::NoPushBranch(
            "no push branch declared and the checkout reference names no branch".to_string(),
        )),
    }
}

/// Validates the source reference and returns the source key.
pub fn resolve_source_key(
    automation: &ImageUpdateAutomation,
    no_cross_namespace_refs: bool,
) -> Result<ObjectKey> {
    let source_ref = &automation.spec.source_ref;
    if source_ref.kind != GIT_REPOSITORY_KIND {
        return Err(SyncError::UnsupportedSourceKind(source_ref.kind.clone()));
    }

    let namespace = source_ref
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .unwrap_or(automation.namespace());

    if no_cross_namespace_refs && namespace != automation.namespace() {
        return Err(SyncError::AccessDenied(format!(
            "cross-namespace reference from {} to {}/{} is not allowed",
            automation.key(),
            namespace,
            source_ref.name
        )));
    }

    Ok(ObjectKey::new(namespace, &source_ref.name))
}

/// How the clone discovers references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReferenceDiscovery {
    /// Fetch only what the checkout selection needs.
    SingleBranch,
    /// Fetch every branch so the push branch history is visible.
    AllBranches,
}

/// Transport client options derived from the plan.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Objects are stored on disk rather than in memory.
    pub disk_storage: bool,
    /// Credentials may be sent over plain HTTP.
    pub insecure_http_allowed: bool,
    pub proxy: Option<ProxyOptions>,
    pub discovery: ReferenceDiscovery,
}

/// Derives client options from the transport, proxy and branch topology.
pub fn client_options(
    transport: TransportKind,
    proxy: Option<ProxyOptions>,
    switch_branch: bool,
    features: &FeatureGates,
) -> ClientOptions {
    let discovery = if switch_branch && features.git_all_branch_references {
        ReferenceDiscovery::AllBranches
    } else {
        ReferenceDiscovery::SingleBranch
    };

    ClientOptions {
        disk_storage: true,
        insecure_http_allowed: transport == TransportKind::Http,
        proxy,
        discovery,
    }
}

/// Commit metadata carried into the commit step.
#[derive(Debug, Clone)]
pub struct CommitPlan {
    pub author: CommitUser,
    pub message_template: String,
    pub values: BTreeMap<String, String>,
}

/// Push destination details beyond the branch.
#[derive(Debug, Clone, Default)]
pub struct PushPlan {
    pub refspec: Option<String>,
    pub options: BTreeMap<String, String>,
}

/// Everything one cycle needs, resolved up front.
#[derive(Debug)]
pub struct ResolvedPlan {
    pub target: ObjectKey,
    pub source: ObjectKey,
    pub url: String,
    pub push_branch: String,
    pub switch_branch: bool,
    pub timeout: Duration,
    pub checkout: Option<GitRepositoryRef>,
    pub auth: AuthOptions,
    pub client: ClientOptions,
    pub signing: Option<SigningEntity>,
    pub commit: CommitPlan,
    pub push: PushPlan,
    pub update_path: String,
    pub features: FeatureGates,
}

impl ResolvedPlan {
    /// The branch the clone starts from, falling back to the default branch.
    pub fn effective_checkout_branch(&self) -> &str {
        self.checkout
            .as_ref()
            .and_then(GitRepositoryRef::branch_name)
            .unwrap_or(DEFAULT_BRANCH)
    }

    /// Whether the branch push is forced.
    pub fn force_push(&self) -> bool {
        self.switch_branch && self.features.git_force_push_branch
    }

    /// Returns a redacted, serialisable view of the plan.
    pub fn describe(&self) -> PlanView {
        let credentials = if self.auth.bearer_token.is_some() {
            "bearer"
        } else if self.auth.identity.is_some() {
            "ssh-key"
        } else if self.auth.password.is_some() {
            "basic"
        } else {
            "anonymous"
        };

        PlanView {
            target: self.target.to_string(),
            source: self.source.to_string(),
            url: self.url.clone(),
            transport: self.auth.transport,
            push_branch: self.push_branch.clone(),
            switch_branch: self.switch_branch,
            force_push: self.force_push(),
            timeout_seconds: self.timeout.as_secs(),
            checkout: self.checkout.clone(),
            credentials: credentials.to_string(),
            provider: self
                .auth
                .provider_data
                .as_ref()
                .map(|p| p.provider.to_string()),
            proxy: self.client.proxy.as_ref().map(|p| p.address.clone()),
            discovery: self.client.discovery,
            refspec: self.push.refspec.clone(),
            push_options: self.push.options.keys().cloned().collect(),
            signing_key: self.signing.as_ref().map(|s| s.fingerprint().to_string()),
            update_path: self.update_path.clone(),
        }
    }
}

/// Redacted view of a [`ResolvedPlan`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanView {
    pub target: String,
    pub source: String,
    pub url: String,
    pub transport: TransportKind,
    pub push_branch: String,
    pub switch_branch: bool,
    pub force_push: bool,
    pub timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout: Option<GitRepositoryRef>,
    pub credentials: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    pub discovery: ReferenceDiscovery,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refspec: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub push_options: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,
    pub update_path: String,
}

/// Composes the resolution steps for one automation.
pub struct PlanResolver {
    credentials: Arc<CredentialResolver>,
    settings: SettingsSpec,
}

impl PlanResolver {
    pub fn new(credentials: Arc<CredentialResolver>, settings: SettingsSpec) -> Self {
        Self {
            credentials,
            settings,
        }
    }

    /// Returns the settings in effect.
    pub fn settings(&self) -> &SettingsSpec {
        &self.settings
    }

    /// Validates the automation's source reference.
    pub fn source_key(&self, automation: &ImageUpdateAutomation) -> Result<ObjectKey> {
        resolve_source_key(automation, self.settings.no_cross_namespace_refs)
    }

    /// Resolves the plan for `automation` against its `source`.
    pub async fn resolve(
        &self,
        automation: &ImageUpdateAutomation,
        source: &GitRepository,
    ) -> Result<ResolvedPlan> {
        let source_key = self.source_key(automation)?;
        if source_key != source.key() {
            return Err(SyncError::ResourceNotFound {
                kind: GIT_REPOSITORY_KIND.to_string(),
                name: source_key.to_string(),
            });
        }

        let git = automation.spec.git.clone().unwrap_or_default();

        let timeout = resolve_timeout(
            source.spec.timeout,
            Duration::from_secs(self.settings.default_timeout),
        );

        let checkout = resolve_checkout_ref(
            git.checkout.as_ref().map(|c| &c.reference),
            source.spec.reference.as_ref(),
        );

        let (push_branch, switch_branch) =
            resolve_push_branch(git.push.as_ref(), checkout.as_ref())?;

        let proxy = self.credentials.resolve_proxy(source).await?;
        let target = automation.key();
        let auth = self
            .credentials
            .resolve(&target, source, proxy.as_ref(), timeout)
            .await?;

        let client = client_options(auth.transport, proxy, switch_branch, &self.settings.features);

        let signing = match &git.commit.signing_key {
            Some(key) => {
                let secret = self
                    .credentials
                    .secret(automation.namespace(), &key.secret_ref.name)
                    .await?;
                Some(SigningEntity::from_secret(&secret).await?)
            }
            None => None,
        };

        let commit = CommitPlan {
            author: git.commit.author.clone(),
            message_template: git
                .commit
                .message_template
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MESSAGE_TEMPLATE.to_string()),
            values: git.commit.message_template_values.clone(),
        };

        let push = git
            .push
            .map(|p| PushPlan {
                refspec: p.refspec.filter(|r| !r.is_empty()),
                options: p.options,
            })
            .unwrap_or_default();

        log::debug!(
            "Resolved plan for {}: push branch '{}', switch {}, timeout {}s",
            target,
            push_branch,
            switch_branch,
            timeout.as_secs()
        );

        Ok(ResolvedPlan {
            target,
            source: source_key,
            url: source.spec.url.clone(),
            push_branch,
            switch_branch,
            timeout,
            checkout,
            auth,
            client,
            signing,
            commit,
            push,
            update_path: automation.spec.update.path.clone(),
            features: self.settings.features,
        })
    }
}
