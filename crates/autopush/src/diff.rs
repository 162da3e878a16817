//! Structured record of the values a patcher rewrote.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

/// Identity of a YAML object inside a patched file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectIdentifier {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Which part of an image reference a setter writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SetterField {
    Image,
    Tag,
    Name,
}

/// One value rewritten by a setter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub old_value: String,
    pub new_value: String,
    /// Setter identifier, `<namespace>:<policy>` with an optional `:tag` or
    /// `:name` suffix.
    pub setter: String,
}

impl Change {
    /// Returns the field the setter writes, derived from its suffix.
    pub fn field(&self) -> SetterField {
        match self.setter.rsplit_once(':') {
            Some((_, "tag")) if self.setter.matches(':').count() >= 2 => SetterField::Tag,
            Some((_, "name")) if self.setter.matches(':').count() >= 2 => SetterField::Name,
            _ => SetterField::Image,
        }
    }
}

/// Per file, per object, the ordered list of changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuredDiff {
    files: BTreeMap<String, BTreeMap<ObjectIdentifier, Vec<Change>>>,
}

impl StructuredDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a change. `file` is relative to the working copy root.
    pub fn add(&mut self, file: impl Into<String>, object: ObjectIdentifier, change: Change) {
        self.files
            .entry(file.into())
            .or_default()
            .entry(object)
            .or_default()
            .push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.files.values().all(|objects| objects.values().all(Vec::is_empty))
    }

    pub fn files(&self) -> &BTreeMap<String, BTreeMap<ObjectIdentifier, Vec<Change>>> {
        &self.files
    }

    /// Total number of recorded changes.
    pub fn len(&self) -> usize {
        self.files
            .values()
            .flat_map(BTreeMap::values)
            .map(Vec::len)
            .sum()
    }

    /// Flattens the diff in file then object order.
    pub fn changes(&self) -> Vec<FileChange> {
        self.files
            .iter()
            .flat_map(|(file, objects)| {
                objects.iter().flat_map(move |(object, changes)| {
                    changes.iter().map(move |change| FileChange {
                        file: file.clone(),
                        object: object.to_string(),
                        old_value: change.old_value.clone(),
                        new_value: change.new_value.clone(),
                        setter: change.setter.clone(),
                    })
                })
            })
            .collect()
    }

    /// Builds the legacy result view.
    pub fn update_result(&self) -> UpdateResult {
        let mut files = Vec::new();
        let mut objects = BTreeSet::new();
        let mut images = BTreeSet::new();

        for (file, by_object) in &self.files {
            if by_object.values().any(|c| !c.is_empty()) {
                files.push(file.clone());
            }
            for (object, changes) in by_object {
                if changes.is_empty() {
                    continue;
                }
                objects.insert(object.to_string());
                images.extend(
                    changes
                        .iter()
                        .filter(|c| c.field() == SetterField::Image)
                        .map(|c| c.new_value.clone()),
                );
            }
        }

        UpdateResult {
            files,
            objects: objects.into_iter().collect(),
            images: images.into_iter().collect(),
        }
    }
}

/// A change flattened with its location, as exposed to templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub file: String,
    pub object: String,
    pub old_value: String,
    pub new_value: String,
    pub setter: String,
}

/// Legacy view of a diff: which files and objects changed and the images
/// now referenced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateResult {
    pub files: Vec<String>,
    pub objects: Vec<String>,
    pub images: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(name: &str) -> ObjectIdentifier {
        ObjectIdentifier {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            namespace: "apps".into(),
            name: name.into(),
        }
    }

    fn change(old: &str, new: &str, setter: &str) -> Change {
        Change {
            old_value: old.into(),
            new_value: new.into(),
            setter: setter.into(),
        }
    }

    #[test]
    fn test_empty_diff() {
        let diff = StructuredDiff::new();
        assert!(diff.is_empty());
        assert_eq!(diff.len(), 0);
        assert_eq!(diff.update_result(), UpdateResult::default());
    }

    #[test]
    fn test_setter_field() {
        assert_eq!(change("a", "b", "apps:podinfo").field(), SetterField::Image);
        assert_eq!(change("a", "b", "apps:podinfo:tag").field(), SetterField::Tag);
        assert_eq!(change("a", "b", "apps:podinfo:name").field(), SetterField::Name);
        // A policy that happens to be called "tag"
        assert_eq!(change("a", "b", "apps:tag").field(), SetterField::Image);
    }

    #[test]
    fn test_update_result_collects_sorted_unique_images() {
        let mut diff = StructuredDiff::new();
        diff.add(
            "deploy/b.yaml",
            deployment("b"),
            change("ghcr.io/x/b:1", "ghcr.io/x/b:2", "apps:b"),
        );
        diff.add(
            "deploy/a.yaml",
            deployment("a"),
            change("ghcr.io/x/a:1", "ghcr.io/x/a:2", "apps:a"),
        );
        diff.add("deploy/a.yaml", deployment("a"), change("1", "2", "apps:a:tag"));
        diff.add(
            "deploy/c.yaml",
            deployment("c"),
            change("ghcr.io/x/a:1", "ghcr.io/x/a:2", "apps:a"),
        );

        let result = diff.update_result();
        assert_eq!(result.files, vec!["deploy/a.yaml", "deploy/b.yaml", "deploy/c.yaml"]);
        assert_eq!(
            result.objects,
            vec!["Deployment/apps/a", "Deployment/apps/b", "Deployment/apps/c"]
        );
        assert_eq!(result.images, vec!["ghcr.io/x/a:2", "ghcr.io/x/b:2"]);
        assert_eq!(diff.len(), 4);
    }

    #[test]
    fn test_changes_are_flattened_in_order() {
        let mut diff = StructuredDiff::new();
        diff.add("a.yaml", deployment("a"), change("1", "2", "apps:a:tag"));
        diff.add("a.yaml", deployment("a"), change("x:1", "x:2", "apps:x"));

        let changes = diff.changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].new_value, "2");
        assert_eq!(changes[1].object, "Deployment/apps/a");
        assert_eq!(changes[1].file, "a.yaml");
    }

    #[test]
    fn test_object_identifier_without_namespace() {
        let mut id = deployment("a");
        id.namespace.clear();
        assert_eq!(id.to_string(), "Deployment/a");
    }
}
