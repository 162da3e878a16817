//! Ephemeral working copies driven through the `git` executable.
//!
//! Every invocation runs under the plan's timeout with `kill_on_drop`, so an
//! exceeded deadline kills git and surfaces [`SyncError::GitTimeout`]. The
//! working directory is a [`TempDir`] and disappears with the [`WorkingCopy`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tempfile::TempDir;
use tokio::process::Command;

use super::parse::{format_git_error, parse_ls_remote, pick_semver_tag};
use crate::auth::{build_git_env, GitEnv};
use crate::error::{classify_commit_error, classify_git_error, Result, SyncError};
use crate::plan::{ReferenceDiscovery, ResolvedPlan};
use crate::resource::{CommitUser, GitRepositoryRef};
use crate::signing::SigningEntity;

/// What to clone, by precedence tag > semver > commit > branch > default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutStrategy {
    Tag(String),
    SemVer(String),
    Commit {
        commit: String,
        branch: Option<String>,
    },
    Branch(String),
    DefaultBranch,
}

impl CheckoutStrategy {
    /// Picks the strategy for a checkout reference.
    pub fn from_ref(reference: Option<&GitRepositoryRef>) -> Self {
        let non_empty = |s: &Option<String>| s.as_deref().filter(|v| !v.is_empty()).map(str::to_string);
        let Some(reference) = reference else {
            return CheckoutStrategy::DefaultBranch;
        };

        if let Some(tag) = non_empty(&reference.tag) {
            CheckoutStrategy::Tag(tag)
        } else if let Some(range) = non_empty(&reference.semver) {
            CheckoutStrategy::SemVer(range)
        } else if let Some(commit) = non_empty(&reference.commit) {
            CheckoutStrategy::Commit {
                commit,
                branch: non_empty(&reference.branch),
            }
        } else if let Some(branch) = non_empty(&reference.branch) {
            CheckoutStrategy::Branch(branch)
        } else {
            CheckoutStrategy::DefaultBranch
        }
    }
}

/// Per-call overrides for a clone.
#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    /// Overrides the shallow-clone feature gate.
    pub shallow: Option<bool>,
    /// Commit observed by the previous cycle.
    pub last_observed_commit: Option<String>,
}

/// The commit a clone ended up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckedOutCommit {
    /// The tree is checked out at this commit.
    Concrete(String),
    /// The remote tip still equals the last observed commit and nothing was
    /// downloaded. The working tree is empty and must not be read.
    Unchanged(String),
}

impl CheckedOutCommit {
    pub fn hash(&self) -> &str {
        match self {
            CheckedOutCommit::Concrete(h) | CheckedOutCommit::Unchanged(h) => h,
        }
    }

    pub fn is_concrete(&self) -> bool {
        matches!(self, CheckedOutCommit::Concrete(_))
    }
}

/// Builds the `git clone` arguments for a strategy.
pub fn clone_args(
    strategy: &CheckoutStrategy,
    discovery: ReferenceDiscovery,
    shallow: bool,
    url: &str,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["clone".into(), "--quiet".into()];

    let shallow = shallow && !matches!(strategy, CheckoutStrategy::Commit { .. });
    if shallow {
        args.extend(["--depth".into(), "1".into()]);
    }

    match strategy {
        CheckoutStrategy::Tag(tag) => {
            args.extend(["--branch".into(), tag.clone(), "--single-branch".into()]);
        }
        CheckoutStrategy::Commit { branch, .. } => {
            args.push("--no-checkout".into());
            if let Some(branch) = branch {
                args.extend(["--branch".into(), branch.clone()]);
            }
        }
        CheckoutStrategy::Branch(branch) => {
            args.extend(["--branch".into(), branch.clone()]);
        }
        CheckoutStrategy::SemVer(_) | CheckoutStrategy::DefaultBranch => {}
    }

    match discovery {
        ReferenceDiscovery::AllBranches => args.push("--no-single-branch".into()),
        ReferenceDiscovery::SingleBranch => args.push("--single-branch".into()),
    }

    args.extend(["--".into(), url.to_string(), ".".into()]);
    args
}

/// Runs git with the given environment under a deadline.
async fn run_git(
    dir: Option<&Path>,
    env: &GitEnv,
    args: &[String],
    timeout: Duration,
    stdin: Option<&str>,
) -> Result<Output> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd.args(args)
        .env("LC_ALL", "C")
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &env.env_vars {
        cmd.env(key, value);
    }

    let run = async {
        let mut child = cmd
            .spawn()
            .map_err(|e| SyncError::GitOperation(format!("failed to run git: {}", e)))?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            use tokio::io::AsyncWriteExt;
            pipe.write_all(input.as_bytes()).await?;
        }
        Ok::<_, SyncError>(child.wait_with_output().await?)
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(output) => output,
        Err(_) => Err(SyncError::GitTimeout(timeout.as_secs())),
    }
}

fn check(output: Output) -> Result<Output> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(classify_git_error(&format_git_error(&output)))
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A cloned repository in an ephemeral directory.
#[derive(Debug)]
pub struct WorkingCopy {
    dir: TempDir,
    env: GitEnv,
    url: String,
    timeout: Duration,
}

impl WorkingCopy {
    /// Clones the plan's source into a fresh directory under `work_root`.
    pub async fn clone(
        plan: &ResolvedPlan,
        work_root: Option<&Path>,
        options: &CloneOptions,
    ) -> Result<(Self, CheckedOutCommit)> {
        let prefix = format!("{}-{}-", plan.target.namespace, plan.target.name);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match work_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        let env = build_git_env(
            &plan.auth,
            plan.client.proxy.as_ref(),
            plan.client.insecure_http_allowed,
        )?;

        let wc = Self {
            dir,
            env,
            url: plan.url.clone(),
            timeout: plan.timeout,
        };

        let mut strategy = CheckoutStrategy::from_ref(plan.checkout.as_ref());
        if let CheckoutStrategy::SemVer(range) = &strategy {
            let tag = wc.resolve_semver(range).await?;
            log::debug!("{}: semver range '{}' resolved to tag '{}'", plan.target, range, tag);
            strategy = CheckoutStrategy::Tag(tag);
        }

        if let Some(last) = options.last_observed_commit.as_deref() {
            if !plan.switch_branch {
                if let Some(tip) = wc.remote_tip(&strategy).await? {
                    if tip == last {
                        log::debug!("{}: remote tip {} unchanged, skipping clone", plan.target, tip);
                        return Ok((wc, CheckedOutCommit::Unchanged(tip)));
                    }
                }
            }
        }

        let shallow = options.shallow.unwrap_or(plan.features.git_shallow_clone);
        let args = clone_args(&strategy, plan.client.discovery, shallow, &wc.url);
        check(wc.git(&args).await?)?;

        if let CheckoutStrategy::Commit { commit, .. } = &strategy {
            let output = wc
                .git(&["checkout".into(), "--quiet".into(), "--detach".into(), commit.clone()])
                .await?;
            if !output.status.success() {
                return Err(SyncError::ReferenceNotFound(format!(
                    "commit '{}': {}",
                    commit,
                    format_git_error(&output)
                )));
            }
        }

        if plan.switch_branch {
            wc.switch_branch(&plan.push_branch, plan.client.discovery)
                .await?;
        }

        let head = wc.head().await?;
        log::debug!("{}: checked out {} in {}", plan.target, head, wc.path().display());
        Ok((wc, CheckedOutCommit::Concrete(head)))
    }

    /// Returns the working directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Resolves a path relative to the working directory.
    pub fn join(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.dir.path().join(relative)
    }

    async fn git(&self, args: &[String]) -> Result<Output> {
        run_git(Some(self.dir.path()), &self.env, args, self.timeout, None).await
    }

    async fn git_checked(&self, args: &[&str]) -> Result<Output> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        check(self.git(&args).await?)
    }

    async fn ls_remote(&self, extra: &[&str]) -> Result<String> {
        let mut args: Vec<String> = vec!["ls-remote".into()];
        args.extend(extra.iter().map(|a| a.to_string()));
        args.push(self.url.clone());
        let output = check(run_git(None, &self.env, &args, self.timeout, None).await?)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn resolve_semver(&self, range: &str) -> Result<String> {
        let listing = self.ls_remote(&["--tags"]).await?;
        let refs = parse_ls_remote(&listing);
        pick_semver_tag(
            range,
            refs.iter().filter_map(|r| r.name.strip_prefix("refs/tags/")),
        )
    }

    /// Looks up the remote tip for branch, tag and default selections.
    async fn remote_tip(&self, strategy: &CheckoutStrategy) -> Result<Option<String>> {
        let wanted = match strategy {
            CheckoutStrategy::Branch(b) => format!("refs/heads/{}", b),
            CheckoutStrategy::Tag(t) => format!("refs/tags/{}", t),
            CheckoutStrategy::DefaultBranch => "HEAD".to_string(),
            _ => return Ok(None),
        };
        let listing = self.ls_remote(&[]).await?;
        Ok(parse_ls_remote(&listing)
            .into_iter()
            .find(|r| r.name == wanted)
            .map(|r| r.hash))
    }

    /// Switches to `branch` after the clone.
    ///
    /// With all-branch discovery the remote is asked whether the branch
    /// exists. An existing branch is fetched if the clone did not bring it
    /// along and checked out with its history; a branch the remote lacks is
    /// created at the current commit. With single-branch discovery only a
    /// branch the clone already fetched can be switched to.
    pub async fn switch_branch(&self, branch: &str, discovery: ReferenceDiscovery) -> Result<()> {
        let remote_ref = format!("refs/remotes/origin/{}", branch);
        let mut fetched = self.has_ref(&remote_ref).await?;

        if !fetched {
            match discovery {
                ReferenceDiscovery::SingleBranch => {
                    return Err(SyncError::GitOperation(format!(
                        "branch '{}' is not among the fetched references; \
                         the single-branch clone cannot tell whether it exists on the remote",
                        branch
                    )));
                }
                ReferenceDiscovery::AllBranches => {
                    if self.remote_has_branch(branch).await? {
                        self.git_checked(&[
                            "fetch",
                            "--quiet",
                            "origin",
                            &format!("+refs/heads/{}:{}", branch, remote_ref),
                        ])
                        .await?;
                        fetched = true;
                    }
                }
            }
        }

        let args: Vec<String> = if fetched {
            vec!["checkout".into(), "--quiet".into(), "-B".into(), branch.into(), remote_ref]
        } else {
            log::info!("Branch '{}' not present on remote, creating it from checkout", branch);
            vec!["checkout".into(), "--quiet".into(), "-B".into(), branch.into()]
        };

        let output = self.git(&args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SyncError::ReferenceNotFound(format!(
                "cannot switch to branch '{}': {}",
                branch,
                format_git_error(&output)
            )))
        }
    }

    async fn has_ref(&self, name: &str) -> Result<bool> {
        let output = self
            .git(&["rev-parse".into(), "--verify".into(), "--quiet".into(), name.into()])
            .await?;
        Ok(output.status.success())
    }

    async fn remote_has_branch(&self, branch: &str) -> Result<bool> {
        let wanted = format!("refs/heads/{}", branch);
        let listing = self.ls_remote(&["--heads"]).await?;
        Ok(parse_ls_remote(&listing).iter().any(|r| r.name == wanted))
    }

    /// Returns the commit at HEAD.
    pub async fn head(&self) -> Result<String> {
        let output = self.git_checked(&["rev-parse", "HEAD"]).await?;
        Ok(stdout(&output))
    }

    /// Stages every change in the tree.
    pub async fn stage_all(&self) -> Result<()> {
        self.git_checked(&["add", "--all"]).await?;
        Ok(())
    }

    /// Returns true if the index differs from HEAD.
    pub async fn has_staged_changes(&self) -> Result<bool> {
        let output = self.git_checked(&["diff", "--cached", "--name-only"]).await?;
        Ok(!stdout(&output).is_empty())
    }

    /// Commits the index and returns the new commit hash.
    pub async fn commit(
        &self,
        message: &str,
        author: &CommitUser,
        when: DateTime<Utc>,
        signing: Option<&SigningEntity>,
    ) -> Result<String> {
        let date = when.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut env = GitEnv::anonymous();
        env.env_vars.extend(self.env.env_vars.iter().cloned());
        for (key, value) in [
            ("GIT_AUTHOR_NAME", author.name.as_str()),
            ("GIT_AUTHOR_EMAIL", author.email.as_str()),
            ("GIT_AUTHOR_DATE", date.as_str()),
            ("GIT_COMMITTER_NAME", author.name.as_str()),
            ("GIT_COMMITTER_EMAIL", author.email.as_str()),
            ("GIT_COMMITTER_DATE", date.as_str()),
        ] {
            env.set(key, value);
        }

        let mut args = signing_config(signing);
        args.extend(["commit".into(), "--quiet".into(), "--no-verify".into()]);
        args.push(if signing.is_some() {
            "--gpg-sign".into()
        } else {
            "--no-gpg-sign".into()
        });
        args.extend(["--file".into(), "-".into()]);

        let output = run_git(Some(self.path()), &env, &args, self.timeout, Some(message)).await?;
        if !output.status.success() {
            return Err(classify_commit_error(
                &format_git_error(&output),
                signing.is_some(),
            ));
        }

        self.head().await
    }

    /// Verifies the signature on `rev` against the entity's key.
    pub async fn verify_commit(&self, rev: &str, signing: &SigningEntity) -> Result<()> {
        let mut args = signing_config(Some(signing));
        args.extend(["verify-commit".into(), rev.into()]);
        check(self.git(&args).await?)?;
        Ok(())
    }

    /// Pushes HEAD to `branch`.
    pub async fn push(
        &self,
        branch: &str,
        force: bool,
        options: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut args: Vec<String> = vec!["push".into(), "--porcelain".into()];
        if force {
            args.push("--force".into());
        }
        args.extend(push_option_args(options));
        args.extend(["origin".into(), format!("HEAD:refs/heads/{}", branch)]);
        check(self.git(&args).await?)?;

        // Keep a local ref for refspecs naming the push branch as source
        self.git_checked(&["update-ref", &format!("refs/heads/{}", branch), "HEAD"])
            .await?;
        Ok(())
    }

    /// Pushes an explicit refspec.
    pub async fn push_refspec(&self, refspec: &str, options: &BTreeMap<String, String>) -> Result<()> {
        let mut args: Vec<String> = vec!["push".into(), "--porcelain".into()];
        args.extend(push_option_args(options));
        args.extend(["origin".into(), refspec.to_string()]);
        check(self.git(&args).await?)?;
        Ok(())
    }
}

fn signing_config(signing: Option<&SigningEntity>) -> Vec<String> {
    signing
        .map(|s| {
            s.git_config()
                .into_iter()
                .flat_map(|(k, v)| ["-c".to_string(), format!("{}={}", k, v)])
                .collect()
        })
        .unwrap_or_default()
}

/// Builds `-o key=value` arguments; empty values pass the bare key.
pub fn push_option_args(options: &BTreeMap<String, String>) -> Vec<String> {
    options
        .iter()
        .flat_map(|(k, v)| {
            let value = if v.is_empty() {
                k.clone()
            } else {
                format!("{}={}", k, v)
            };
            ["-o".to_string(), value]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_precedence() {
        let all = GitRepositoryRef {
            branch: Some("main".into()),
            tag: Some("v1".into()),
            semver: Some(">=1".into()),
            commit: Some("abc".into()),
        };
        assert_eq!(CheckoutStrategy::from_ref(Some(&all)), CheckoutStrategy::Tag("v1".into()));

        let no_tag = GitRepositoryRef { tag: None, ..all.clone() };
        assert_eq!(
            CheckoutStrategy::from_ref(Some(&no_tag)),
            CheckoutStrategy::SemVer(">=1".into())
        );

        let commit = GitRepositoryRef { semver: None, ..no_tag };
        assert_eq!(
            CheckoutStrategy::from_ref(Some(&commit)),
            CheckoutStrategy::Commit {
                commit: "abc".into(),
                branch: Some("main".into())
            }
        );

        assert_eq!(
            CheckoutStrategy::from_ref(Some(&GitRepositoryRef::branch("main"))),
            CheckoutStrategy::Branch("main".into())
        );
        assert_eq!(CheckoutStrategy::from_ref(None), CheckoutStrategy::DefaultBranch);
        assert_eq!(
            CheckoutStrategy::from_ref(Some(&GitRepositoryRef::default())),
            CheckoutStrategy::DefaultBranch
        );
    }

    #[test]
    fn test_clone_args_branch_all_refs() {
        let args = clone_args(
            &CheckoutStrategy::Branch("main".into()),
            ReferenceDiscovery::AllBranches,
            true,
            "https://example.com/repo.git",
        );
        assert_eq!(
            args,
            vec![
                "clone",
                "--quiet",
                "--depth",
                "1",
                "--branch",
                "main",
                "--no-single-branch",
                "--",
                "https://example.com/repo.git",
                "."
            ]
        );
    }

    #[test]
    fn test_clone_args_commit_is_never_shallow() {
        let args = clone_args(
            &CheckoutStrategy::Commit {
                commit: "abc".into(),
                branch: None,
            },
            ReferenceDiscovery::SingleBranch,
            true,
            "u",
        );
        assert!(!args.contains(&"--depth".to_string()));
        assert!(args.contains(&"--no-checkout".to_string()));
    }

    #[test]
    fn test_clone_args_tag_follows_discovery() {
        let all = clone_args(
            &CheckoutStrategy::Tag("v1".into()),
            ReferenceDiscovery::AllBranches,
            false,
            "u",
        );
        assert_eq!(
            all,
            vec!["clone", "--quiet", "--branch", "v1", "--no-single-branch", "--", "u", "."]
        );

        let single = clone_args(
            &CheckoutStrategy::Tag("v1".into()),
            ReferenceDiscovery::SingleBranch,
            false,
            "u",
        );
        assert!(single.contains(&"--single-branch".to_string()));
        assert!(!single.contains(&"--no-single-branch".to_string()));
    }

    #[test]
    fn test_push_option_args() {
        let options = BTreeMap::from([
            ("ci.skip".to_string(), String::new()),
            ("merge_request.target".to_string(), "main".to_string()),
        ]);
        assert_eq!(
            push_option_args(&options),
            vec!["-o", "ci.skip", "-o", "merge_request.target=main"]
        );
    }

    #[test]
    fn test_checked_out_commit() {
        let c = CheckedOutCommit::Unchanged("abc".into());
        assert_eq!(c.hash(), "abc");
        assert!(!c.is_concrete());
        assert!(CheckedOutCommit::Concrete("abc".into()).is_concrete());
    }
}
