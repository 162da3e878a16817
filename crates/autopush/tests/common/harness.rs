//! Test harness for cycles against a local bare remote.
//!
//! The `RemoteHarness` owns a temporary directory holding:
//! - `remote.git`, a bare repository reached through a `file://` URL
//! - `work`, the parent directory for the engine's working copies
//! - `seed`, a scratch clone used to put commits on the remote

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tempfile::TempDir;

/// Marker-annotated deployment committed to every fresh remote.
pub const SEED_DEPLOYMENT: &str = r#"apiVersion: apps/v1
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
"#;

/// Path of the seeded deployment inside the repository.
pub const SEED_PATH: &str = "deploy/podinfo.yaml";

/// Returns true if a `git` executable can be run.
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Runs git in `dir` with a fixed identity and returns trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "Seeder")
        .env("GIT_AUTHOR_EMAIL", "seeder@example.com")
        .env("GIT_COMMITTER_NAME", "Seeder")
        .env("GIT_COMMITTER_EMAIL", "seeder@example.com")
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("LC_ALL", "C")
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn has_ref(dir: &Path, name: &str) -> bool {
    Command::new("git")
        .current_dir(dir)
        .args(["rev-parse", "--verify", "--quiet", name])
        .stdout(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// A bare remote with a seeded `main` branch.
pub struct RemoteHarness {
    temp_dir: TempDir,
    /// Path to the bare repository.
    pub remote: PathBuf,
    /// Parent directory for working copies.
    pub work_dir: PathBuf,
    seed: PathBuf,
}

impl RemoteHarness {
    /// Creates a remote whose `main` branch holds [`SEED_DEPLOYMENT`].
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let remote = temp_dir.path().join("remote.git");
        let work_dir = temp_dir.path().join("work");
        let seed = temp_dir.path().join("seed");
        std::fs::create_dir_all(&remote).expect("Failed to create remote dir");
        std::fs::create_dir_all(&work_dir).expect("Failed to create work dir");
        std::fs::create_dir_all(&seed).expect("Failed to create seed dir");

        git(&remote, &["init", "--quiet", "--bare"]);
        git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        git(&seed, &["init", "--quiet"]);
        git(&seed, &["remote", "add", "origin", remote.to_str().unwrap()]);

        let harness = Self {
            temp_dir,
            remote,
            work_dir,
            seed,
        };
        harness.commit_file("main", SEED_PATH, SEED_DEPLOYMENT, "Initial commit");
        harness
    }

    /// Returns the base temp directory path.
    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// URL the engine clones from.
    pub fn url(&self) -> String {
        format!("file://{}", self.remote.display())
    }

    /// Commits `content` at `path` on `branch` and pushes it to the remote.
    pub fn commit_file(&self, branch: &str, path: &str, content: &str, message: &str) -> String {
        git(&self.seed, &["fetch", "--quiet", "origin"]);
        let tracking = format!("refs/remotes/origin/{}", branch);
        if !has_ref(&self.seed, "HEAD") {
            git(&self.seed, &["symbolic-ref", "HEAD", &format!("refs/heads/{}", branch)]);
        } else if has_ref(&self.seed, &tracking) {
            git(&self.seed, &["checkout", "--quiet", "--force", "-B", branch, &tracking]);
        } else {
            git(&self.seed, &["checkout", "--quiet", "-B", branch]);
        }
        let file = self.seed.join(path);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        std::fs::write(&file, content).expect("Failed to write seed file");
        git(&self.seed, &["add", "--all"]);
        git(&self.seed, &["commit", "--quiet", "-m", message]);
        git(
            &self.seed,
            &["push", "--quiet", "origin", &format!("{}:refs/heads/{}", branch, branch)],
        );
        git(&self.seed, &["rev-parse", "HEAD"])
    }

    /// Creates `branch` on the remote at the tip of `from`.
    pub fn create_branch(&self, branch: &str, from: &str) {
        git(&self.remote, &["branch", branch, from]);
    }

    /// Tags the tip of `branch` on the remote and returns the tagged commit.
    pub fn tag(&self, name: &str, branch: &str) -> String {
        git(&self.remote, &["tag", name, branch]);
        self.rev(name)
    }

    /// Resolves any revision expression in the remote.
    pub fn rev(&self, revision: &str) -> String {
        git(&self.remote, &["rev-parse", revision])
    }

    /// Returns the commit at the tip of a remote branch, if it exists.
    pub fn head(&self, branch: &str) -> Option<String> {
        let output = Command::new("git")
            .current_dir(&self.remote)
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .output()
            .expect("Failed to run git");
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Reads a file from a remote branch.
    pub fn read_file(&self, branch: &str, path: &str) -> String {
        git(&self.remote, &["show", &format!("{}:{}", branch, path)])
    }

    /// Number of commits reachable from a remote branch.
    pub fn commit_count(&self, branch: &str) -> usize {
        git(&self.remote, &["rev-list", "--count", branch])
            .parse()
            .expect("rev-list count")
    }

    /// Full message of the tip commit of a remote branch.
    pub fn last_message(&self, branch: &str) -> String {
        git(&self.remote, &["log", "-1", "--format=%B", branch])
    }

    /// Author of the tip commit as `name <email>`.
    pub fn last_author(&self, branch: &str) -> String {
        git(&self.remote, &["log", "-1", "--format=%an <%ae>", branch])
    }

    /// Raw commit object of the tip of a remote branch.
    pub fn raw_commit(&self, branch: &str) -> String {
        git(&self.remote, &["cat-file", "commit", branch])
    }

    /// Number of entries currently in the work directory.
    pub fn working_copies(&self) -> usize {
        std::fs::read_dir(&self.work_dir)
            .expect("Failed to read work dir")
            .count()
    }
}

/// Generates a passphrase-protected ed25519 key and returns its armored
/// secret export, or `None` when gpg cannot be used here.
pub fn generate_signing_key(passphrase: &str) -> Option<String> {
    let available = Command::new("gpg")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if !available {
        eprintln!("gpg not available, skipping");
        return None;
    }

    let home = TempDir::new().expect("Failed to create gpg home");
    let gpg = |args: &[&str]| {
        Command::new("gpg")
            .arg("--homedir")
            .arg(home.path())
            .args(["--batch", "--pinentry-mode", "loopback", "--passphrase", passphrase])
            .args(args)
            .stderr(Stdio::null())
            .output()
            .ok()
    };

    let generated = gpg(&[
        "--quick-gen-key",
        "Automation Bot <bot@example.com>",
        "ed25519",
        "sign",
        "never",
    ])?;
    if !generated.status.success() {
        eprintln!("gpg key generation unavailable, skipping");
        return None;
    }
    let exported = gpg(&["--armor", "--export-secret-keys"])?;
    let _ = Command::new("gpgconf")
        .arg("--homedir")
        .arg(home.path())
        .args(["--kill", "gpg-agent"])
        .status();

    exported
        .status
        .success()
        .then(|| String::from_utf8_lossy(&exported.stdout).to_string())
}
