//! Setter-marker patching of YAML manifests.
//!
//! A field opts into automation with a trailing comment naming a policy:
//!
//! ```yaml
//! image: ghcr.io/org/app:1.0.0 # {"$imagepolicy": "apps:app"}
//! tag: 1.0.0 # {"$imagepolicy": "apps:app:tag"}
//! ```
//!
//! The scalar before the marker is replaced with the policy's latest image,
//! or with its tag or name part when the marker carries that suffix.

use std::fs;
use std::path::Path;

use regex::Regex;
use serde_yaml::Value;
use walkdir::WalkDir;

use crate::diff::{Change, ObjectIdentifier, SetterField, StructuredDiff};
use crate::error::{Result, SyncError};
use crate::resource::ImagePolicy;

const MARKER_PATTERN: &str = r#"^(?P<head>.*?)(?P<value>"[^"]*"|'[^']*'|[^\s"'#]+)(?P<gap>\s*)#\s*\{\s*"\$imagepolicy"\s*:\s*"(?P<setter>[^"]+)"\s*\}\s*$"#;

/// Rewrites files under a directory from a set of policies.
pub trait Patcher: Send + Sync {
    /// Patches every eligible file below `dir` in place and reports what changed.
    fn patch(&self, dir: &Path, policies: &[&ImagePolicy]) -> Result<StructuredDiff>;
}

/// A parsed `$imagepolicy` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetterRef {
    pub namespace: String,
    pub policy: String,
    pub field: SetterField,
}

impl SetterRef {
    /// Parses `<namespace>:<policy>[:tag|:name]`.
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.trim().split(':').collect();
        let (namespace, policy, field) = match parts.as_slice() {
            [ns, policy] => (*ns, *policy, SetterField::Image),
            [ns, policy, "tag"] => (*ns, *policy, SetterField::Tag),
            [ns, policy, "name"] => (*ns, *policy, SetterField::Name),
            _ => return None,
        };
        if namespace.is_empty() || policy.is_empty() {
            return None;
        }
        Some(Self {
            namespace: namespace.to_string(),
            policy: policy.to_string(),
            field,
        })
    }
}

/// Splits an image reference into name and tag.
///
/// A digest stays attached to the tag part. References without a tag yield
/// an empty tag.
pub fn split_image(image: &str) -> (&str, &str) {
    let (without_digest, digest_at) = match image.find('@') {
        Some(at) => (&image[..at], Some(at)),
        None => (image, None),
    };
    let last_slash = without_digest.rfind('/').map(|i| i + 1).unwrap_or(0);
    match without_digest[last_slash..].rfind(':') {
        Some(colon) => {
            let colon = last_slash + colon;
            (&image[..colon], &image[colon + 1..])
        }
        None => match digest_at {
            Some(at) => (&image[..at], &image[at..]),
            None => (image, ""),
        },
    }
}

fn value_for(image: &str, field: SetterField) -> &str {
    match field {
        SetterField::Image => image,
        SetterField::Name => split_image(image).0,
        SetterField::Tag => split_image(image).1,
    }
}

fn object_identity(document: &str) -> Option<ObjectIdentifier> {
    let value: Value = serde_yaml::from_str(document).ok()?;
    let field = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(str::to_string);
    let metadata = value.get("metadata")?;
    Some(ObjectIdentifier {
        api_version: field(&value, "apiVersion").unwrap_or_default(),
        kind: field(&value, "kind").unwrap_or_default(),
        namespace: field(metadata, "namespace").unwrap_or_default(),
        name: field(metadata, "name")?,
    })
}

fn is_document_separator(line: &str) -> bool {
    line.trim_end() == "---" || line.starts_with("--- ")
}

/// Line-oriented `$imagepolicy` marker patcher.
pub struct SetterPatcher {
    marker: Regex,
}

impl SetterPatcher {
    pub fn new() -> Result<Self> {
        let marker = Regex::new(MARKER_PATTERN)
            .map_err(|e| SyncError::InvalidConfig(format!("invalid setter pattern: {}", e)))?;
        Ok(Self { marker })
    }

    /// Patches one file's contents, returning the new text if anything changed.
    pub fn patch_contents(
        &self,
        file: &str,
        contents: &str,
        policies: &[&ImagePolicy],
        diff: &mut StructuredDiff,
    ) -> Option<String> {
        let lines: Vec<&str> = contents.split_inclusive('\n').collect();
        let mut output = String::with_capacity(contents.len());
        let mut changed = false;

        let mut start = 0;
        while start < lines.len() {
            let end = lines[start + 1..]
                .iter()
                .position(|l| is_document_separator(l))
                .map(|p| start + 1 + p)
                .unwrap_or(lines.len());
            let document = &lines[start..end];
            let identity = if document.iter().any(|l| l.contains("$imagepolicy")) {
                object_identity(&document.concat())
            } else {
                None
            };

            for line in document {
                match identity
                    .as_ref()
                    .and_then(|id| self.patch_line(line, policies).map(|p| (id, p)))
                {
                    Some((id, (patched, change))) => {
                        diff.add(file, id.clone(), change);
                        output.push_str(&patched);
                        changed = true;
                    }
                    None => output.push_str(line),
                }
            }
            start = end;
        }

        changed.then_some(output)
    }

    fn patch_line(&self, line: &str, policies: &[&ImagePolicy]) -> Option<(String, Change)> {
        let (body, newline) = match line.strip_suffix('\n') {
            Some(body) => match body.strip_suffix('\r') {
                Some(body) => (body, "\r\n"),
                None => (body, "\n"),
            },
            None => (line, ""),
        };

        let caps = self.marker.captures(body)?;
        let setter = caps.name("setter")?.as_str();
        let Some(reference) = SetterRef::parse(setter) else {
            log::warn!("Ignoring malformed image policy marker '{}'", setter);
            return None;
        };
        let policy = policies.iter().find(|p| {
            p.namespace() == reference.namespace && p.name() == reference.policy
        })?;

        let raw = caps.name("value")?;
        let (quote, old) = match raw.as_str().chars().next() {
            Some(q @ ('"' | '\'')) => (Some(q), &raw.as_str()[1..raw.as_str().len() - 1]),
            _ => (None, raw.as_str()),
        };
        let new = value_for(&policy.spec.latest_image, reference.field);
        if new.is_empty() || new == old {
            return None;
        }

        let mut patched = String::with_capacity(line.len() + new.len());
        patched.push_str(&body[..raw.start()]);
        match quote {
            Some(q) => {
                patched.push(q);
                patched.push_str(new);
                patched.push(q);
            }
            None => patched.push_str(new),
        }
        patched.push_str(&body[raw.end()..]);
        patched.push_str(newline);

        Some((
            patched,
            Change {
                old_value: old.to_string(),
                new_value: new.to_string(),
                setter: setter.trim().to_string(),
            },
        ))
    }
}

impl Patcher for SetterPatcher {
    fn patch(&self, dir: &Path, policies: &[&ImagePolicy]) -> Result<StructuredDiff> {
        if !dir.is_dir() {
            return Err(SyncError::InvalidConfig(format!(
                "update path '{}' is not a directory",
                dir.display()
            )));
        }

        let mut diff = StructuredDiff::new();
        if policies.is_empty() {
            return Ok(diff);
        }

        for entry in WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !e
                        .file_name()
                        .to_str()
                        .map(|s| s.starts_with('.'))
                        .unwrap_or(false)
            })
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if ext != "yaml" && ext != "yml" {
                continue;
            }

            let contents = fs::read_to_string(path).map_err(|e| SyncError::ReadFile {
                path: path.to_path_buf(),
                source: e,
            })?;
            let relative = path
                .strip_prefix(dir)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");

            if let Some(patched) = self.patch_contents(&relative, &contents, policies, &mut diff) {
                fs::write(path, patched).map_err(|e| {
                    SyncError::FileOperation(format!("failed to write {}: {}", path.display(), e))
                })?;
                log::debug!("Patched {}", relative);
            }
        }

        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ImagePolicySpec, Resource, ResourceKind};
    use tempfile::TempDir;

    fn policy(namespace: &str, name: &str, latest: &str) -> ImagePolicy {
        Resource::new(
            ResourceKind::ImagePolicy,
            name,
            ImagePolicySpec {
                image_repository: split_image(latest).0.to_string(),
                latest_image: latest.to_string(),
            },
        )
        .in_namespace(namespace)
    }

    const DEPLOYMENT: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: podinfo
  namespace: apps
spec:
  template:
    spec:
      containers:
        - name: podinfo
          image: ghcr.io/stefanprodan/podinfo:5.0.0 # {"$imagepolicy": "apps:podinfo"}
        - name: sidecar
          image: "busybox:1.0" # {"$imagepolicy": "apps:busybox"}
"#;

    #[test]
    fn test_split_image() {
        assert_eq!(split_image("ghcr.io/org/app:1.2.3"), ("ghcr.io/org/app", "1.2.3"));
        assert_eq!(split_image("localhost:5000/app:v1"), ("localhost:5000/app", "v1"));
        assert_eq!(split_image("localhost:5000/app"), ("localhost:5000/app", ""));
        assert_eq!(
            split_image("app:1@sha256:abc"),
            ("app", "1@sha256:abc")
        );
        assert_eq!(split_image("app@sha256:abc"), ("app", "@sha256:abc"));
    }

    #[test]
    fn test_parse_setter_ref() {
        let r = SetterRef::parse("apps:podinfo:tag").unwrap();
        assert_eq!(r.namespace, "apps");
        assert_eq!(r.policy, "podinfo");
        assert_eq!(r.field, SetterField::Tag);
        assert_eq!(SetterRef::parse("apps:podinfo").unwrap().field, SetterField::Image);
        assert!(SetterRef::parse("podinfo").is_none());
        assert!(SetterRef::parse("apps:podinfo:digest").is_none());
        assert!(SetterRef::parse(":podinfo").is_none());
    }

    #[test]
    fn test_patch_contents_rewrites_marked_fields() {
        let patcher = SetterPatcher::new().unwrap();
        let p1 = policy("apps", "podinfo", "ghcr.io/stefanprodan/podinfo:5.2.1");
        let p2 = policy("apps", "busybox", "busybox:1.36");
        let mut diff = StructuredDiff::new();

        let patched = patcher
            .patch_contents("deploy.yaml", DEPLOYMENT, &[&p1, &p2], &mut diff)
            .unwrap();

        assert!(patched.contains(
            r#"image: ghcr.io/stefanprodan/podinfo:5.2.1 # {"$imagepolicy": "apps:podinfo"}"#
        ));
        assert!(patched.contains(r#"image: "busybox:1.36" # {"$imagepolicy": "apps:busybox"}"#));
        assert_eq!(diff.len(), 2);

        let result = diff.update_result();
        assert_eq!(result.files, vec!["deploy.yaml"]);
        assert_eq!(result.objects, vec!["Deployment/apps/podinfo"]);
        assert_eq!(
            result.images,
            vec!["busybox:1.36", "ghcr.io/stefanprodan/podinfo:5.2.1"]
        );
    }

    #[test]
    fn test_patch_contents_tag_and_name_setters() {
        let patcher = SetterPatcher::new().unwrap();
        let p = policy("apps", "podinfo", "ghcr.io/stefanprodan/podinfo:6.0.0");
        let contents = r#"apiVersion: helm.toolkit.fluxcd.io/v2
kind: HelmRelease
metadata:
  name: podinfo
spec:
  values:
    image:
      repository: docker.io/podinfo # {"$imagepolicy": "apps:podinfo:name"}
      tag: 5.0.0 # {"$imagepolicy": "apps:podinfo:tag"}
"#;
        let mut diff = StructuredDiff::new();
        let patched = patcher
            .patch_contents("release.yaml", contents, &[&p], &mut diff)
            .unwrap();

        assert!(patched.contains("repository: ghcr.io/stefanprodan/podinfo #"));
        assert!(patched.contains("tag: 6.0.0 #"));
        // Name and tag setters do not contribute images
        assert!(diff.update_result().images.is_empty());
        assert_eq!(diff.update_result().objects, vec!["HelmRelease/podinfo"]);
    }

    #[test]
    fn test_patch_contents_unchanged_and_unknown_policies() {
        let patcher = SetterPatcher::new().unwrap();
        let current = policy("apps", "podinfo", "ghcr.io/stefanprodan/podinfo:5.0.0");
        let other_ns = policy("other", "busybox", "busybox:2");
        let mut diff = StructuredDiff::new();

        assert!(patcher
            .patch_contents("deploy.yaml", DEPLOYMENT, &[&current, &other_ns], &mut diff)
            .is_none());
        assert!(diff.is_empty());
    }

    #[test]
    fn test_patch_contents_multiple_documents() {
        let patcher = SetterPatcher::new().unwrap();
        let p = policy("apps", "app", "app:2");
        let contents = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: first
data:
  image: app:1 # {\"$imagepolicy\": \"apps:app\"}
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: second
data:
  image: app:1 # {\"$imagepolicy\": \"apps:app\"}
";
        let mut diff = StructuredDiff::new();
        let patched = patcher
            .patch_contents("cm.yaml", contents, &[&p], &mut diff)
            .unwrap();

        assert_eq!(patched.matches("image: app:2").count(), 2);
        assert!(patched.contains("\n---\n"));
        assert_eq!(
            diff.update_result().objects,
            vec!["ConfigMap/first", "ConfigMap/second"]
        );
    }

    #[test]
    fn test_patch_directory() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("apps")).unwrap();
        fs::create_dir_all(temp.path().join(".hidden")).unwrap();
        fs::write(temp.path().join("apps/deploy.yaml"), DEPLOYMENT).unwrap();
        fs::write(temp.path().join(".hidden/deploy.yaml"), DEPLOYMENT).unwrap();
        fs::write(temp.path().join("apps/notes.txt"), DEPLOYMENT).unwrap();

        let patcher = SetterPatcher::new().unwrap();
        let p = policy("apps", "podinfo", "ghcr.io/stefanprodan/podinfo:5.2.1");
        let diff = patcher.patch(temp.path(), &[&p]).unwrap();

        assert_eq!(diff.update_result().files, vec!["apps/deploy.yaml"]);
        let written = fs::read_to_string(temp.path().join("apps/deploy.yaml")).unwrap();
        assert!(written.contains("podinfo:5.2.1"));
        let hidden = fs::read_to_string(temp.path().join(".hidden/deploy.yaml")).unwrap();
        assert!(hidden.contains("podinfo:5.0.0"));

        // A second pass over the patched tree finds nothing to do
        assert!(patcher.patch(temp.path(), &[&p]).unwrap().is_empty());
    }

    #[test]
    fn test_patch_missing_directory() {
        let temp = TempDir::new().unwrap();
        let patcher = SetterPatcher::new().unwrap();
        let result = patcher.patch(&temp.path().join("missing"), &[]);
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }
}
