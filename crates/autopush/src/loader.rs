//! Loader for multi-file YAML configuration directories.

use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Result, SyncError};
use crate::resource::{
    AnyResource, GitRepository, ImagePolicy, ImageUpdateAutomation, ObjectKey, ResourceHeader,
    ResourceKind, ResourceWithPath, SettingsResource, SettingsSpec, API_VERSION,
};

/// Everything loaded from a configuration directory.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    /// The settings resource, if one was declared.
    pub settings: Option<ResourceWithPath<SettingsResource>>,
    /// All git repositories, sorted by key.
    pub repositories: Vec<ResourceWithPath<GitRepository>>,
    /// All automations, sorted by key.
    pub automations: Vec<ResourceWithPath<ImageUpdateAutomation>>,
    /// All image policies, sorted by key.
    pub policies: Vec<ResourceWithPath<ImagePolicy>>,
}

impl LoadedConfig {
    /// Returns the declared settings or the defaults.
    pub fn settings(&self) -> SettingsSpec {
        self.settings
            .as_ref()
            .map(|s| s.resource.spec.clone())
            .unwrap_or_default()
    }

    /// Looks up a repository by namespace and name.
    pub fn repository(&self, namespace: &str, name: &str) -> Option<&GitRepository> {
        self.repositories
            .iter()
            .map(|r| &r.resource)
            .find(|r| r.namespace() == namespace && r.name() == name)
    }

    /// Looks up an automation by namespace and name.
    pub fn automation(&self, namespace: &str, name: &str) -> Option<&ImageUpdateAutomation> {
        self.automations
            .iter()
            .map(|r| &r.resource)
            .find(|r| r.namespace() == namespace && r.name() == name)
    }

    /// Returns the policies in `namespace` selected by the automation.
    pub fn policies_for(&self, automation: &ImageUpdateAutomation) -> Vec<&ImagePolicy> {
        let selector = automation.spec.policy_selector.clone().unwrap_or_default();
        self.policies
            .iter()
            .map(|p| &p.resource)
            .filter(|p| p.namespace() == automation.namespace())
            .filter(|p| selector.matches(&p.metadata.labels))
            .collect()
    }

    /// Returns all resources as a flat list.
    pub fn all_resources(&self) -> Vec<(ResourceKind, ObjectKey, &Path)> {
        let mut resources = Vec::new();
        if let Some(settings) = &self.settings {
            resources.push((
                ResourceKind::Settings,
                settings.resource.key(),
                settings.path.as_path(),
            ));
        }
        for repo in &self.repositories {
            resources.push((
                ResourceKind::GitRepository,
                repo.resource.key(),
                repo.path.as_path(),
            ));
        }
        for auto in &self.automations {
            resources.push((
                ResourceKind::ImageUpdateAutomation,
                auto.resource.key(),
                auto.path.as_path(),
            ));
        }
        for policy in &self.policies {
            resources.push((
                ResourceKind::ImagePolicy,
                policy.resource.key(),
                policy.path.as_path(),
            ));
        }
        resources
    }
}

/// Configuration loader.
pub struct ConfigLoader {
    /// Root directory for configuration files.
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new config loader for the given directory.
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Returns the config directory path.
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Loads all configuration from the config directory.
    pub fn load(&self) -> Result<LoadedConfig> {
        if !self.config_dir.exists() {
            return Err(SyncError::ConfigDirNotFound(self.config_dir.clone()));
        }

        let mut config = LoadedConfig::default();

        for entry in WalkDir::new(&self.config_dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();

            if !path.is_file() {
                continue;
            }

            // Skip hidden files and anything below a hidden directory
            if let Ok(relative) = path.strip_prefix(&self.config_dir) {
                let has_hidden_component = relative.components().any(|c| {
                    c.as_os_str()
                        .to_str()
                        .map(|s| s.starts_with('.'))
                        .unwrap_or(false)
                });
                if has_hidden_component {
                    continue;
                }
            }

            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if ext != "yaml" && ext != "yml" {
                continue;
            }

            let resource = match self.load_file(path) {
                Ok(resource) => resource,
                Err(e) => {
                    log::warn!("Failed to load {}: {}", path.display(), e);
                    return Err(e);
                }
            };
            let relative_path = path
                .strip_prefix(&self.config_dir)
                .unwrap_or(path)
                .to_path_buf();

            match resource {
                AnyResource::Settings(r) => {
                    if config.settings.is_some() {
                        return Err(duplicate(ResourceKind::Settings, r.key()));
                    }
                    config.settings = Some(ResourceWithPath::new(r, relative_path));
                }
                AnyResource::GitRepository(r) => {
                    if config.repositories.iter().any(|x| x.resource.key() == r.key()) {
                        return Err(duplicate(ResourceKind::GitRepository, r.key()));
                    }
                    config.repositories.push(ResourceWithPath::new(r, relative_path));
                }
                AnyResource::ImageUpdateAutomation(r) => {
                    if config.automations.iter().any(|x| x.resource.key() == r.key()) {
                        return Err(duplicate(ResourceKind::ImageUpdateAutomation, r.key()));
                    }
                    config.automations.push(ResourceWithPath::new(r, relative_path));
                }
                AnyResource::ImagePolicy(r) => {
                    if config.policies.iter().any(|x| x.resource.key() == r.key()) {
                        return Err(duplicate(ResourceKind::ImagePolicy, r.key()));
                    }
                    config.policies.push(ResourceWithPath::new(r, relative_path));
                }
            }
        }

        config.repositories.sort_by_key(|r| r.resource.key());
        config.automations.sort_by_key(|r| r.resource.key());
        config.policies.sort_by_key(|r| r.resource.key());

        log::debug!(
            "Loaded {} repositories, {} automations, {} policies from {}",
            config.repositories.len(),
            config.automations.len(),
            config.policies.len(),
            self.config_dir.display()
        );

        Ok(config)
    }

    /// Loads a single resource file.
    pub fn load_file(&self, path: &Path) -> Result<AnyResource> {
        let content = fs::read_to_string(path).map_err(|e| SyncError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        self.parse_resource(&content, path)
    }

    /// Parses a resource from YAML content.
    pub fn parse_resource(&self, content: &str, path: &Path) -> Result<AnyResource> {
        // Parse the header first to determine the kind
        let header: ResourceHeader = parse_yaml(content, path)?;

        if header.api_version != API_VERSION {
            return Err(SyncError::InvalidApiVersion {
                version: header.api_version,
                expected: API_VERSION.to_string(),
            });
        }

        match header.kind {
            ResourceKind::Settings => Ok(AnyResource::Settings(parse_yaml(content, path)?)),
            ResourceKind::GitRepository => {
                Ok(AnyResource::GitRepository(parse_yaml(content, path)?))
            }
            ResourceKind::ImageUpdateAutomation => {
                Ok(AnyResource::ImageUpdateAutomation(parse_yaml(content, path)?))
            }
            ResourceKind::ImagePolicy => Ok(AnyResource::ImagePolicy(parse_yaml(content, path)?)),
        }
    }
}

fn parse_yaml<T: serde::de::DeserializeOwned>(content: &str, path: &Path) -> Result<T> {
    serde_yaml::from_str(content).map_err(|e| SyncError::ParseYaml {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn duplicate(kind: ResourceKind, key: ObjectKey) -> SyncError {
    SyncError::DuplicateName {
        kind: kind.to_string(),
        name: key.to_string(),
    }
}
