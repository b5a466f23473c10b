//! Git plumbing for the bridge: commit identity and pushes.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::protocol::{Author, PushSpec};
use crate::errors::{SandboxError, SandboxResult};
use crate::process::{ManagedProcess, TokioProcess};

/// Name and email recorded on commits made inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

/// Borrowed form of [`GitIdentity`] usable in `const` position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticIdentity {
    pub name: &'static str,
    pub email: &'static str,
}

impl StaticIdentity {
    pub fn to_identity(self) -> GitIdentity {
        GitIdentity {
            name: self.name.to_string(),
            email: self.email.to_string(),
        }
    }
}

/// Identity used when the prompt author has no SCM profile.
pub const FALLBACK_GIT_USER: StaticIdentity = StaticIdentity {
    name: "OpenInspect",
    email: "open-inspect@noreply.github.com",
};

/// Pick the commit identity for a prompt. Name and email fall back
/// independently.
pub fn resolve_identity(author: &Author, fallback: &GitIdentity) -> GitIdentity {
    GitIdentity {
        name: author
            .scm_name
            .clone()
            .unwrap_or_else(|| fallback.name.clone()),
        email: author
            .scm_email
            .clone()
            .unwrap_or_else(|| fallback.email.clone()),
    }
}

/// Arguments for `git push`. The credentialed remote goes straight to git and
/// never through a log line.
pub fn push_args(spec: &PushSpec) -> Vec<String> {
    let mut args = vec![
        "push".to_string(),
        spec.remote_url.clone(),
        spec.refspec.clone(),
    ];
    if spec.force {
        args.push("--force".to_string());
    }
    args
}

/// Run a git command to completion in `cwd`, returning stdout.
pub async fn run_git(cwd: &Path, args: &[&str]) -> SandboxResult<String> {
    let output = Command::new("git")
        .current_dir(cwd)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| SandboxError::Spawn {
            program: "git".to_string(),
            source,
        })?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(SandboxError::Git {
            args: args.first().copied().unwrap_or_default().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Git operations the bridge performs.
#[async_trait]
pub trait GitRunner: Send + Sync {
    async fn configure_identity(
        &self,
        repo_dir: &Path,
        identity: &GitIdentity,
    ) -> SandboxResult<()>;

    fn spawn_push(
        &self,
        repo_dir: &Path,
        spec: &PushSpec,
    ) -> SandboxResult<Box<dyn ManagedProcess>>;
}

/// [`GitRunner`] backed by the `git` CLI.
#[derive(Debug, Clone, Default)]
pub struct CliGit;

#[async_trait]
impl GitRunner for CliGit {
    async fn configure_identity(
        &self,
        repo_dir: &Path,
        identity: &GitIdentity,
    ) -> SandboxResult<()> {
        run_git(repo_dir, &["config", "--local", "user.name", &identity.name]).await?;
        run_git(repo_dir, &["config", "--local", "user.email", &identity.email]).await?;
        debug!(name = %identity.name, email = %identity.email, "Configured git identity");
        Ok(())
    }

    fn spawn_push(
        &self,
        repo_dir: &Path,
        spec: &PushSpec,
    ) -> SandboxResult<Box<dyn ManagedProcess>> {
        info!(
            remote = %spec.redacted_remote_url,
            refspec = %spec.refspec,
            force = spec.force,
            "Starting git push"
        );
        let mut command = Command::new("git");
        command
            .current_dir(repo_dir)
            .args(push_args(spec))
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let process = TokioProcess::spawn("git push", command)?;
        Ok(Box::new(process))
    }
}

/// First directory under `workspace` that is a git checkout.
pub fn find_repo_dir(workspace: &Path) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(workspace)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.join(".git").exists())
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}
