//! Builders for the resources an automation cycle reads.
//!
//! Everything lives in the `apps` namespace unless a test moves it.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use autopush::loader::LoadedConfig;
use autopush::resource::{
    CommitSpec, CommitUser, CrossNamespaceSourceReference, GitCheckoutSpec, GitRepositoryRef,
    GitRepositorySpec, GitSpec, ImagePolicySpec, ImageUpdateAutomationSpec, LocalObjectReference,
    PushSpec, Resource, ResourceKind, ResourceWithPath, SettingsSpec, SigningKey, UpdateStrategy,
};
use autopush::{
    CredentialResolver, GitRepository, ImagePolicy, ImageUpdateAutomation, InMemorySecretStore,
    SyncEngine,
};

use super::RemoteHarness;

pub const NAMESPACE: &str = "apps";

/// Builder for `ImageUpdateAutomation` resources.
pub struct AutomationBuilder {
    name: String,
    source: String,
    checkout: Option<GitRepositoryRef>,
    push: Option<PushSpec>,
    template: Option<String>,
    values: BTreeMap<String, String>,
    signing_secret: Option<String>,
    update_path: String,
    suspend: bool,
}

impl AutomationBuilder {
    /// An automation named `podinfo-auto` reading the `podinfo` source.
    pub fn new() -> Self {
        Self {
            name: "podinfo-auto".to_string(),
            source: "podinfo".to_string(),
            checkout: None,
            push: None,
            template: None,
            values: BTreeMap::new(),
            signing_secret: None,
            update_path: "./deploy".to_string(),
            suspend: false,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn checkout_branch(mut self, branch: &str) -> Self {
        self.checkout = Some(GitRepositoryRef::branch(branch));
        self
    }

    pub fn checkout_tag(mut self, tag: &str) -> Self {
        self.checkout = Some(GitRepositoryRef::tag(tag));
        self
    }

    pub fn checkout_semver(mut self, range: &str) -> Self {
        self.checkout = Some(GitRepositoryRef {
            semver: Some(range.to_string()),
            ..Default::default()
        });
        self
    }

    pub fn push_branch(mut self, branch: &str) -> Self {
        self.push.get_or_insert_with(PushSpec::default).branch = Some(branch.to_string());
        self
    }

    pub fn refspec(mut self, refspec: &str) -> Self {
        self.push.get_or_insert_with(PushSpec::default).refspec = Some(refspec.to_string());
        self
    }

    pub fn template(mut self, template: &str) -> Self {
        self.template = Some(template.to_string());
        self
    }

    pub fn value(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn signing_secret(mut self, name: &str) -> Self {
        self.signing_secret = Some(name.to_string());
        self
    }

    pub fn update_path(mut self, path: &str) -> Self {
        self.update_path = path.to_string();
        self
    }

    pub fn suspend(mut self) -> Self {
        self.suspend = true;
        self
    }

    pub fn build(self) -> ImageUpdateAutomation {
        let mut spec =
            ImageUpdateAutomationSpec::new(CrossNamespaceSourceReference::git_repository(self.source));
        spec.git = Some(GitSpec {
            checkout: self.checkout.map(|reference| GitCheckoutSpec { reference }),
            commit: CommitSpec {
                author: CommitUser {
                    name: "Image Bot".to_string(),
                    email: "bot@example.com".to_string(),
                },
                signing_key: self.signing_secret.map(|name| SigningKey {
                    secret_ref: LocalObjectReference::new(name),
                }),
                message_template: self.template,
                message_template_values: self.values,
            },
            push: self.push,
        });
        spec.update = UpdateStrategy {
            path: self.update_path,
            ..Default::default()
        };
        spec.suspend = self.suspend;

        Resource::new(ResourceKind::ImageUpdateAutomation, self.name, spec).in_namespace(NAMESPACE)
    }
}

/// A `podinfo` source pointing at the harness remote, tracking `branch`.
pub fn source(harness: &RemoteHarness, branch: &str) -> GitRepository {
    Resource::new(
        ResourceKind::GitRepository,
        "podinfo",
        GitRepositorySpec {
            url: harness.url(),
            reference: Some(GitRepositoryRef::branch(branch)),
            timeout: Some(30),
            secret_ref: None,
            proxy_secret_ref: None,
            provider: Default::default(),
        },
    )
    .in_namespace(NAMESPACE)
}

/// The `podinfo` policy selecting `latest_image`.
pub fn policy(latest_image: &str) -> ImagePolicy {
    Resource::new(
        ResourceKind::ImagePolicy,
        "podinfo",
        ImagePolicySpec {
            image_repository: "ghcr.io/stefanprodan/podinfo".to_string(),
            latest_image: latest_image.to_string(),
        },
    )
    .in_namespace(NAMESPACE)
}

/// Assembles a loaded configuration from resources.
pub fn config(
    repositories: Vec<GitRepository>,
    automations: Vec<ImageUpdateAutomation>,
    policies: Vec<ImagePolicy>,
) -> LoadedConfig {
    LoadedConfig {
        settings: None,
        repositories: repositories
            .into_iter()
            .map(|r| ResourceWithPath::new(r, "repositories.yaml"))
            .collect(),
        automations: automations
            .into_iter()
            .map(|a| ResourceWithPath::new(a, "automations.yaml"))
            .collect(),
        policies: policies
            .into_iter()
            .map(|p| ResourceWithPath::new(p, "policies.yaml"))
            .collect(),
    }
}

/// An engine backed by `secrets` that keeps working copies in the harness.
pub fn engine(harness: &RemoteHarness, secrets: InMemorySecretStore) -> SyncEngine {
    engine_with_settings(harness, secrets, SettingsSpec::default())
}

/// Like [`engine`], with explicit settings.
pub fn engine_with_settings(
    harness: &RemoteHarness,
    secrets: InMemorySecretStore,
    settings: SettingsSpec,
) -> SyncEngine {
    let credentials = Arc::new(CredentialResolver::new(Arc::new(secrets)));
    SyncEngine::new(credentials, settings)
        .expect("Failed to create engine")
        .with_work_root(&harness.work_dir)
}
