//! K8s-style resource types for automation configuration.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The API version for all autopush resources.
pub const API_VERSION: &str = "autopush.io/v1";

/// Namespace assigned to resources that do not declare one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// The kind of resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Settings,
    GitRepository,
    ImageUpdateAutomation,
    ImagePolicy,
}

impl ResourceKind {
    /// Returns all resource kinds.
    pub fn all() -> &'static [ResourceKind] {
        &[
            ResourceKind::Settings,
            ResourceKind::GitRepository,
            ResourceKind::ImageUpdateAutomation,
            ResourceKind::ImagePolicy,
        ]
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Settings => write!(f, "Settings"),
            ResourceKind::GitRepository => write!(f, "GitRepository"),
            ResourceKind::ImageUpdateAutomation => write!(f, "ImageUpdateAutomation"),
            ResourceKind::ImagePolicy => write!(f, "ImagePolicy"),
        }
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "settings" => Ok(ResourceKind::Settings),
            "gitrepository" => Ok(ResourceKind::GitRepository),
            "imageupdateautomation" => Ok(ResourceKind::ImageUpdateAutomation),
            "imagepolicy" => Ok(ResourceKind::ImagePolicy),
            _ => Err(format!("Unknown resource kind: {}", s)),
        }
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Metadata for a resource, following K8s conventions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// The name of the resource, unique per kind within its namespace.
    pub name: String,

    /// The namespace the resource lives in.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Key-value labels for organizing and selecting resources.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    /// Key-value annotations for storing additional metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl Default for ObjectMeta {
    fn default() -> Self {
        Self::new("")
    }
}

impl ObjectMeta {
    /// Creates a new ObjectMeta in the default namespace.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: default_namespace(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
        }
    }

    /// Sets the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Adds a label to the metadata.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A namespaced object identity, printed as `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A generic K8s-style resource wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource<T> {
    /// API version, should always be `autopush.io/v1`.
    pub api_version: String,

    /// The kind of resource.
    pub kind: ResourceKind,

    /// Resource metadata.
    pub metadata: ObjectMeta,

    /// The resource specification.
    pub spec: T,
}

impl<T> Resource<T> {
    /// Creates a new resource in the default namespace.
    pub fn new(kind: ResourceKind, name: impl Into<String>, spec: T) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind,
            metadata: ObjectMeta::new(name),
            spec,
        }
    }

    /// Moves the resource into the given namespace.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.metadata.namespace = namespace.into();
        self
    }

    /// Returns the name of the resource.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Returns the namespace of the resource.
    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// Returns the `namespace/name` identity of the resource.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.metadata.namespace, &self.metadata.name)
    }
}

// ============================================================================
// GitRepository Resource
// ============================================================================

/// Source descriptor: where to read from and how to authenticate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySpec {
    /// Repository URL (`https://`, `http://`, `ssh://` or `file://`).
    pub url: String,

    /// What to check out when the automation does not override it.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<GitRepositoryRef>,

    /// Timeout for remote operations, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Secret holding transport credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,

    /// Secret holding proxy address and credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_secret_ref: Option<LocalObjectReference>,

    /// Credential provider.
    #[serde(default)]
    pub provider: GitProvider,
}

/// A checkout reference. At most one selector wins; see the working copy
/// manager for the precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositoryRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Semantic version range matched against tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semver: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl GitRepositoryRef {
    /// A reference naming only a branch.
    pub fn branch(branch: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            ..Default::default()
        }
    }

    /// A reference naming only a tag.
    pub fn tag(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..Default::default()
        }
    }

    /// Returns the branch if one is set and non-empty.
    pub fn branch_name(&self) -> Option<&str> {
        self.branch.as_deref().filter(|b| !b.is_empty())
    }
}

/// Reference to a secret in the same namespace as the referrer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalObjectReference {
    pub name: String,
}

impl LocalObjectReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Credential provider for a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitProvider {
    /// Static credentials read from the referenced secret.
    #[default]
    Generic,
    /// GitHub App installation tokens.
    Github,
    /// Azure workload identity.
    Azure,
}

impl std::fmt::Display for GitProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitProvider::Generic => write!(f, "generic"),
            GitProvider::Github => write!(f, "github"),
            GitProvider::Azure => write!(f, "azure"),
        }
    }
}

/// Type alias for GitRepository resource.
pub type GitRepository = Resource<GitRepositorySpec>;

// ============================================================================
// ImageUpdateAutomation Resource
// ============================================================================

/// Automation target: source, checkout/commit/push settings and policy selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUpdateAutomationSpec {
    /// The source to read from and push to.
    pub source_ref: CrossNamespaceSourceReference,

    /// Git checkout, commit and push settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSpec>,

    /// Where and how to apply updates.
    #[serde(default)]
    pub update: UpdateStrategy,

    /// Selects the image policies this automation applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_selector: Option<LabelSelector>,

    /// Run interval in seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Suspended automations are skipped.
    #[serde(default)]
    pub suspend: bool,
}

fn default_interval() -> u64 {
    300 // 5 minutes
}

impl ImageUpdateAutomationSpec {
    /// An automation of `source_ref` with every other field defaulted.
    pub fn new(source_ref: CrossNamespaceSourceReference) -> Self {
        Self {
            source_ref,
            git: None,
            update: UpdateStrategy::default(),
            policy_selector: None,
            interval: default_interval(),
            suspend: false,
        }
    }
}

/// Reference to a source, optionally in another namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossNamespaceSourceReference {
    #[serde(default = "default_source_kind")]
    pub kind: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

fn default_source_kind() -> String {
    "GitRepository".to_string()
}

impl CrossNamespaceSourceReference {
    pub fn git_repository(name: impl Into<String>) -> Self {
        Self {
            kind: default_source_kind(),
            name: name.into(),
            namespace: None,
        }
    }
}

/// Git settings of an automation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSpec {
    /// Overrides the source's checkout reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout: Option<GitCheckoutSpec>,

    /// Commit metadata.
    #[serde(default)]
    pub commit: CommitSpec,

    /// Push destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<PushSpec>,
}

/// Checkout override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitCheckoutSpec {
    #[serde(rename = "ref")]
    pub reference: GitRepositoryRef,
}

/// Commit metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSpec {
    #[serde(default)]
    pub author: CommitUser,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<SigningKey>,

    /// Commit message template; a fixed message is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_template: Option<String>,

    /// Named values exposed to the template as `.Values`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub message_template_values: BTreeMap<String, String>,
}

/// Commit author.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitUser {
    #[serde(default = "default_author_name")]
    pub name: String,

    #[serde(default = "default_author_email")]
    pub email: String,
}

fn default_author_name() -> String {
    "autopush".to_string()
}

fn default_author_email() -> String {
    "autopush@localhost".to_string()
}

impl Default for CommitUser {
    fn default() -> Self {
        Self {
            name: default_author_name(),
            email: default_author_email(),
        }
    }
}

/// Reference to the secret holding the armored signing key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningKey {
    pub secret_ref: LocalObjectReference,
}

/// Push destination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushSpec {
    /// Branch to push to; inferred from the checkout branch when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Additional refspec pushed after the branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refspec: Option<String>,

    /// Push options passed to the server (`git push -o`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl PushSpec {
    /// Returns the branch if one is set and non-empty.
    pub fn branch_name(&self) -> Option<&str> {
        self.branch.as_deref().filter(|b| !b.is_empty())
    }
}

/// Update strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStrategy {
    /// Path inside the repository to patch.
    #[serde(default = "default_update_path")]
    pub path: String,

    #[serde(default)]
    pub strategy: UpdateStrategyName,
}

fn default_update_path() -> String {
    "./".to_string()
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        Self {
            path: default_update_path(),
            strategy: UpdateStrategyName::Setters,
        }
    }
}

/// Supported update strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStrategyName {
    #[default]
    Setters,
}

/// Label selector with exact matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: HashMap<String, String>,
}

impl LabelSelector {
    /// Returns true if every selector label is present with the same value.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Type alias for ImageUpdateAutomation resource.
pub type ImageUpdateAutomation = Resource<ImageUpdateAutomationSpec>;

// ============================================================================
// ImagePolicy Resource
// ============================================================================

/// The latest image chosen for a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePolicySpec {
    /// Image repository, e.g. `ghcr.io/org/app`.
    pub image_repository: String,

    /// Latest selected image reference, e.g. `ghcr.io/org/app:v1.2.3`.
    pub latest_image: String,
}

/// Type alias for ImagePolicy resource.
pub type ImagePolicy = Resource<ImagePolicySpec>;

// ============================================================================
// Settings Resource
// ============================================================================

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsSpec {
    #[serde(default)]
    pub features: FeatureGates,

    /// Timeout in seconds for sources that do not declare one.
    #[serde(default = "default_timeout")]
    pub default_timeout: u64,

    /// Reject automations whose source lives in another namespace.
    #[serde(default)]
    pub no_cross_namespace_refs: bool,

    #[serde(default)]
    pub token_cache: TokenCacheSettings,

    /// Maximum number of automations run at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Root of the directory-backed secret store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_directory: Option<String>,

    /// Parent directory of ephemeral working copies; system temp when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_directory: Option<String>,

    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_timeout() -> u64 {
    60
}

fn default_concurrency() -> usize {
    num_cpus::get()
}

impl Default for SettingsSpec {
    fn default() -> Self {
        Self {
            features: FeatureGates::default(),
            default_timeout: default_timeout(),
            no_cross_namespace_refs: false,
            token_cache: TokenCacheSettings::default(),
            concurrency: default_concurrency(),
            secrets_directory: None,
            work_directory: None,
            retry: RetrySettings::default(),
        }
    }
}

/// Feature toggles for branch topology and fetch behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureGates {
    /// Force-push when pushing to a branch other than the checkout branch.
    #[serde(default = "default_true")]
    pub git_force_push_branch: bool,

    /// Clone with depth 1 where the checkout selection allows it.
    #[serde(default = "default_true")]
    pub git_shallow_clone: bool,

    /// Fetch all branches when the push branch differs from the checkout branch.
    #[serde(default = "default_true")]
    pub git_all_branch_references: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FeatureGates {
    fn default() -> Self {
        Self {
            git_force_push_branch: true,
            git_shallow_clone: true,
            git_all_branch_references: true,
        }
    }
}

/// Token cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

fn default_max_entries() -> u64 {
    256
}

impl Default for TokenCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
        }
    }
}

/// Retry policy for transient failures in the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay in seconds, doubled per attempt.
    #[serde(default = "default_base_delay")]
    pub base_delay: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    2
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
        }
    }
}

/// Type alias for Settings resource.
pub type SettingsResource = Resource<SettingsSpec>;

// ============================================================================
// Any Resource (for generic handling)
// ============================================================================

/// A resource that can be any of the supported types.
#[derive(Debug, Clone)]
#[allow(clippy::large_enum_variant)]
pub enum AnyResource {
    Settings(SettingsResource),
    GitRepository(GitRepository),
    ImageUpdateAutomation(ImageUpdateAutomation),
    ImagePolicy(ImagePolicy),
}

impl AnyResource {
    /// Returns the kind of this resource.
    pub fn kind(&self) -> ResourceKind {
        match self {
            AnyResource::Settings(_) => ResourceKind::Settings,
            AnyResource::GitRepository(_) => ResourceKind::GitRepository,
            AnyResource::ImageUpdateAutomation(_) => ResourceKind::ImageUpdateAutomation,
            AnyResource::ImagePolicy(_) => ResourceKind::ImagePolicy,
        }
    }

    /// Returns the metadata of this resource.
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            AnyResource::Settings(r) => &r.metadata,
            AnyResource::GitRepository(r) => &r.metadata,
            AnyResource::ImageUpdateAutomation(r) => &r.metadata,
            AnyResource::ImagePolicy(r) => &r.metadata,
        }
    }
}

/// Intermediate struct for parsing resources before determining their type.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHeader {
    pub api_version: String,
    pub kind: ResourceKind,
    pub metadata: ObjectMeta,
}

/// A resource with its file path.
#[derive(Debug, Clone)]
pub struct ResourceWithPath<T> {
    /// The resource.
    pub resource: T,
    /// The file path relative to the config directory.
    pub path: std::path::PathBuf,
}

impl<T> ResourceWithPath<T> {
    pub fn new(resource: T, path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            resource,
            path: path.into(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
