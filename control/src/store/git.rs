//! Git working copy driven through the `git` CLI
//!
//! The credential token is embedded in the remote URL and never leaves this
//! module unredacted: logged URLs go through [`redact_url`] and git's stderr
//! is scrubbed before it becomes an error message.

use super::VersionControl;
use crate::config::RepositoryConfig;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

const REDACTED: &str = "***";

/// Working copy of one branch of the load balancer config repository
pub struct GitRepo {
    remote: String,
    display_remote: String,
    branch: String,
    workdir: PathBuf,
    token: String,
    author_name: String,
    author_email: String,
}

impl GitRepo {
    pub fn new(config: &RepositoryConfig) -> Result<Self> {
        let remote = authenticated_url(&config.url, &config.token)?;

        Ok(Self {
            display_remote: redact_url(&remote),
            remote,
            branch: config.branch.clone(),
            workdir: config.workdir.clone(),
            token: config.token.clone(),
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
        })
    }

    fn scrub(&self, text: &str) -> String {
        let text = text.replace(&self.remote, &self.display_remote);
        if self.token.is_empty() {
            text
        } else {
            text.replace(&self.token, REDACTED)
        }
    }

    async fn output(&self, cwd: Option<&Path>, args: &[&str]) -> Result<Output> {
        let mut command = Command::new("git");
        if let Some(dir) = cwd {
            command.arg("-C").arg(dir);
        }
        // Identity for commit and rebase alike
        command
            .arg("-c")
            .arg(format!("user.name={}", self.author_name))
            .arg("-c")
            .arg(format!("user.email={}", self.author_email))
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);

        command
            .output()
            .await
            .map_err(|e| SyncError::git(args.first().copied().unwrap_or("git"), e.to_string()))
    }

    /// Run git in the working copy; non-zero exit is an error
    async fn run(&self, args: &[&str]) -> Result<Output> {
        self.run_in(Some(&self.workdir), args).await
    }

    async fn run_in(&self, cwd: Option<&Path>, args: &[&str]) -> Result<Output> {
        let output = self.output(cwd, args).await?;
        if output.status.success() {
            return Ok(output);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(SyncError::git(
            args.first().copied().unwrap_or("git"),
            self.scrub(stderr.trim()),
        ))
    }

    fn remote_branch(&self) -> String {
        format!("origin/{}", self.branch)
    }
}

#[async_trait]
impl VersionControl for GitRepo {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    async fn prepare(&self) -> Result<()> {
        if self.workdir.join(".git").exists() {
            info!(remote = %self.display_remote, branch = %self.branch, "Updating working copy");
            self.run(&["remote", "set-url", "origin", &self.remote]).await?;
            self.run(&["fetch", "origin", &self.branch]).await?;
            self.run(&["checkout", "-f", "-B", &self.branch, &self.remote_branch()])
                .await?;
            return Ok(());
        }

        info!(remote = %self.display_remote, branch = %self.branch, "Cloning working copy");
        if let Some(parent) = self.workdir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let workdir = self.workdir.to_string_lossy().into_owned();
        self.run_in(
            None,
            &[
                "clone",
                "--branch",
                &self.branch,
                "--single-branch",
                &self.remote,
                &workdir,
            ],
        )
        .await?;
        Ok(())
    }

    async fn stage(&self, path: &Path) -> Result<bool> {
        let path = path.to_string_lossy().into_owned();
        self.run(&["add", "--", &path]).await?;

        // exit 0: index matches HEAD, exit 1: staged changes
        let output = self
            .output(Some(&self.workdir), &["diff", "--cached", "--quiet", "--", &path])
            .await?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(SyncError::git(
                "diff",
                self.scrub(String::from_utf8_lossy(&output.stderr).trim()),
            )),
        }
    }

    async fn commit(&self, message: &str) -> Result<()> {
        self.run(&["commit", "-m", message]).await?;
        Ok(())
    }

    async fn push(&self) -> Result<()> {
        if let Err(e) = self.run(&["pull", "--rebase", "origin", &self.branch]).await {
            warn!(error = %e, "Rebase onto remote failed, resetting to remote head");
            // Either may fail when there is nothing to abort; the reset
            // below is what matters.
            let _ = self.output(Some(&self.workdir), &["rebase", "--abort"]).await;
            self.run(&["reset", "--mixed", &self.remote_branch()]).await?;
            return Err(e);
        }

        let refspec = format!("HEAD:refs/heads/{}", self.branch);
        self.run(&["push", "origin", &refspec]).await?;
        debug!(branch = %self.branch, "Pushed routing document");
        Ok(())
    }
}

/// Embed `token` as the user part of an http(s) remote. Other remotes
/// (ssh, scp-style, local paths) are returned unchanged.
pub fn authenticated_url(remote: &str, token: &str) -> Result<String> {
    let Ok(mut url) = Url::parse(remote) else {
        return Ok(remote.to_string());
    };

    if !matches!(url.scheme(), "http" | "https") || token.is_empty() {
        return Ok(remote.to_string());
    }

    url.set_username(token).map_err(|_| {
        SyncError::config(format!("cannot add credentials to {}", redact_url(remote)))
    })?;
    Ok(url.to_string())
}

/// Replace any credentials in a URL with a placeholder
pub fn redact_url(remote: &str) -> String {
    match Url::parse(remote) {
        Ok(mut url) if !url.username().is_empty() || url.password().is_some() => {
            let _ = url.set_username(REDACTED);
            let _ = url.set_password(None);
            url.to_string()
        }
        _ => remote.to_string(),
    }
}
