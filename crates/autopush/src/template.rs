//! Commit message rendering.
//!
//! [`DefaultRenderer`] understands a small, deterministic subset of Go
//! template syntax: field actions such as `{{ .AutomationObject }}`,
//! `{{ range .Updated.Images }}...{{ end }}` blocks, `$` for the root value
//! inside a range, `{{/* comments */}}`, and `{{-`/`-}}` whitespace trimming.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::diff::{FileChange, StructuredDiff, UpdateResult};
use crate::error::{Result, SyncError};
use crate::resource::ObjectKey;

/// The view of a diff exposed as `.Changed`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangedView {
    pub changes: Vec<FileChange>,
}

/// Data a commit message template is rendered against.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateData {
    pub automation_object: ObjectKey,
    pub updated: UpdateResult,
    pub changed: ChangedView,
    pub values: BTreeMap<String, String>,
}

impl TemplateData {
    pub fn new(
        automation_object: ObjectKey,
        diff: &StructuredDiff,
        values: BTreeMap<String, String>,
    ) -> Self {
        Self {
            automation_object,
            updated: diff.update_result(),
            changed: ChangedView {
                changes: diff.changes(),
            },
            values,
        }
    }
}

/// Renders commit messages. Implementations must be deterministic.
pub trait MessageRenderer: Send + Sync {
    fn render(&self, template: &str, data: &TemplateData) -> Result<String>;
}

/// The built-in renderer.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRenderer;

impl MessageRenderer for DefaultRenderer {
    fn render(&self, template: &str, data: &TemplateData) -> Result<String> {
        let nodes = parse(template)?;
        let mut out = String::with_capacity(template.len());
        execute(&nodes, data, Scope::Root, &mut out)?;
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Field(Path),
    Range { path: Path, body: Vec<Node> },
}

/// A field path. `root` is set for `$`-prefixed paths.
#[derive(Debug, Clone, PartialEq)]
struct Path {
    root: bool,
    fields: Vec<String>,
}

impl Path {
    fn parse(raw: &str) -> Result<Self> {
        let (root, rest) = match raw.strip_prefix('$') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        if rest == "." || (root && rest.is_empty()) {
            return Ok(Self {
                root,
                fields: Vec::new(),
            });
        }
        let Some(rest) = rest.strip_prefix('.') else {
            return Err(template_error(format!("unsupported expression '{}'", raw)));
        };
        let fields: Vec<String> = rest.split('.').map(str::to_string).collect();
        if fields.iter().any(|f| f.is_empty()) {
            return Err(template_error(format!("malformed field path '{}'", raw)));
        }
        Ok(Self { root, fields })
    }

    fn display(&self) -> String {
        let prefix = if self.root { "$" } else { "" };
        if self.fields.is_empty() {
            format!("{}.", prefix)
        } else {
            format!("{}.{}", prefix, self.fields.join("."))
        }
    }
}

fn template_error(message: impl Into<String>) -> SyncError {
    SyncError::Template(message.into())
}

enum Action {
    Field(Path),
    Range(Path),
    End,
    Comment,
}

fn parse_action(raw: &str) -> Result<Action> {
    let action = raw.trim();
    if action.starts_with("/*") && action.ends_with("*/") {
        return Ok(Action::Comment);
    }
    let mut words = action.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some("end"), None, _) => Ok(Action::End),
        (Some("range"), Some(path), None) => Ok(Action::Range(Path::parse(path)?)),
        (Some(path), None, _) => Ok(Action::Field(Path::parse(path)?)),
        (None, _, _) => Err(template_error("empty action")),
        _ => Err(template_error(format!("unsupported action '{}'", action))),
    }
}

fn parse(template: &str) -> Result<Vec<Node>> {
    // Stack of open blocks: the range path and the nodes collected so far
    let mut stack: Vec<(Option<Path>, Vec<Node>)> = vec![(None, Vec::new())];
    let mut rest = template;
    let mut trim_next = false;

    loop {
        let (text, after) = match rest.find("{{") {
            Some(start) => (&rest[..start], Some(&rest[start + 2..])),
            None => (rest, None),
        };

        let mut text = if trim_next { text.trim_start() } else { text };
        let action_src = match after {
            Some(after) => after,
            None => {
                push_text(&mut stack, text);
                break;
            }
        };

        let (trim_before, action_src) = match action_src.strip_prefix('-') {
            Some(s) if s.starts_with(char::is_whitespace) => (true, s),
            _ => (false, action_src),
        };
        if trim_before {
            text = text.trim_end();
        }
        push_text(&mut stack, text);

        let Some(close) = action_src.find("}}") else {
            return Err(template_error("unclosed action"));
        };
        let mut body = &action_src[..close];
        trim_next = false;
        if let Some(stripped) = body.strip_suffix('-') {
            if stripped.ends_with(char::is_whitespace) {
                body = stripped;
                trim_next = true;
            }
        }
        rest = &action_src[close + 2..];

        match parse_action(body)? {
            Action::Comment => {}
            Action::Field(path) => current(&mut stack).push(Node::Field(path)),
            Action::Range(path) => stack.push((Some(path), Vec::new())),
            Action::End => {
                if stack.len() < 2 {
                    return Err(template_error("unexpected {{ end }}"));
                }
                let Some((Some(path), body)) = stack.pop() else {
                    return Err(template_error("unexpected {{ end }}"));
                };
                current(&mut stack).push(Node::Range { path, body });
            }
        }
    }

    if stack.len() != 1 {
        return Err(template_error("unclosed {{ range }} block"));
    }
    Ok(stack.pop().map(|(_, nodes)| nodes).unwrap_or_default())
}

fn current(stack: &mut [(Option<Path>, Vec<Node>)]) -> &mut Vec<Node> {
    // The stack always holds the root frame
    &mut stack[stack.len() - 1].1
}

fn push_text(stack: &mut [(Option<Path>, Vec<Node>)], text: &str) {
    if !text.is_empty() {
        current(stack).push(Node::Text(text.to_string()));
    }
}

/// The value `.` refers to during execution.
#[derive(Clone, Copy)]
enum Scope<'a> {
    Root,
    Text(&'a str),
    Change(&'a FileChange),
}

enum Items<'a> {
    Texts(&'a [String]),
    Changes(&'a [FileChange]),
}

fn lookup_scalar<'a>(path: &Path, data: &'a TemplateData, scope: Scope<'a>) -> Result<String> {
    let scope = if path.root { Scope::Root } else { scope };
    let fields: Vec<&str> = path.fields.iter().map(String::as_str).collect();
    let unknown = || template_error(format!("can't evaluate field path '{}'", path.display()));

    match (scope, fields.as_slice()) {
        (Scope::Text(text), []) => Ok(text.to_string()),
        (Scope::Root, ["AutomationObject"]) => Ok(data.automation_object.to_string()),
        (Scope::Root, ["AutomationObject", "Name"]) => Ok(data.automation_object.name.clone()),
        (Scope::Root, ["AutomationObject", "Namespace"]) => {
            Ok(data.automation_object.namespace.clone())
        }
        (Scope::Root, ["Values", key]) => data
            .values
            .get(*key)
            .cloned()
            .ok_or_else(|| template_error(format!("no value for key '{}'", key))),
        (Scope::Change(c), ["File"]) => Ok(c.file.clone()),
        (Scope::Change(c), ["Object"]) => Ok(c.object.clone()),
        (Scope::Change(c), ["OldValue"]) => Ok(c.old_value.clone()),
        (Scope::Change(c), ["NewValue"]) => Ok(c.new_value.clone()),
        (Scope::Change(c), ["Setter"]) => Ok(c.setter.clone()),
        _ => Err(unknown()),
    }
}

fn lookup_items<'a>(path: &Path, data: &'a TemplateData, scope: Scope<'a>) -> Result<Items<'a>> {
    let scope = if path.root { Scope::Root } else { scope };
    let fields: Vec<&str> = path.fields.iter().map(String::as_str).collect();

    match (scope, fields.as_slice()) {
        (Scope::Root, ["Updated", "Images"]) => Ok(Items::Texts(&data.updated.images)),
        (Scope::Root, ["Updated", "Files"]) => Ok(Items::Texts(&data.updated.files)),
        (Scope::Root, ["Updated", "Objects"]) => Ok(Items::Texts(&data.updated.objects)),
        (Scope::Root, ["Changed", "Changes"]) => Ok(Items::Changes(&data.changed.changes)),
        _ => Err(template_error(format!(
            "can't range over '{}'",
            path.display()
        ))),
    }
}

fn execute<'a>(
    nodes: &[Node],
    data: &'a TemplateData,
    scope: Scope<'a>,
    out: &mut String,
) -> Result<()> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Field(path) => out.push_str(&lookup_scalar(path, data, scope)?),
            Node::Range { path, body } => match lookup_items(path, data, scope)? {
                Items::Texts(items) => {
                    for item in items {
                        execute(body, data, Scope::Text(item), out)?;
                    }
                }
                Items::Changes(items) => {
                    for item in items {
                        execute(body, data, Scope::Change(item), out)?;
                    }
                }
            },
        }
    }
    Ok(())
}
