//! Thin async wrapper over the `git` binary

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{Result, WorktreeError};

/// Captured result of one git invocation
#[derive(Debug)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl GitOutput {
    fn into_stdout(self, command: String) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(WorktreeError::Git {
                command,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Render arguments for logs and error messages
fn joined<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let parts: Vec<_> = args
        .into_iter()
        .map(|a| a.as_ref().to_string_lossy().into_owned())
        .collect();
    parts.join(" ")
}

/// Run git in `dir`. A non-zero exit is reported in the output, not as an error.
pub async fn git_command<I, S>(dir: &Path, args: I) -> Result<GitOutput>
where
    I: IntoIterator<Item = S> + Clone,
    S: AsRef<OsStr>,
{
    debug!(dir = %dir.display(), "git {}", joined(args.clone()));

    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(WorktreeError::GitUnavailable)?;

    let result = GitOutput {
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        success: out.status.success(),
    };
    trace!(success = result.success, stderr = %result.stderr.trim(), "git finished");
    Ok(result)
}

/// Run git in `dir` and return stdout; a non-zero exit becomes [`WorktreeError::Git`]
pub async fn git_command_checked<I, S>(dir: &Path, args: I) -> Result<String>
where
    I: IntoIterator<Item = S> + Clone,
    S: AsRef<OsStr>,
{
    git_command(dir, args.clone())
        .await?
        .into_stdout(joined(args))
}

/// Whether `path` is an existing directory inside a git work tree
pub async fn is_git_repository(path: &Path) -> Result<bool> {
    if !path.is_dir() {
        return Ok(false);
    }
    Ok(git_command(path, ["rev-parse", "--git-dir"]).await?.success)
}

/// Whether a local branch named `branch` exists
pub async fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    let reference = format!("refs/heads/{}", branch);
    let out = git_command(repo, ["rev-parse", "--verify", "--quiet", reference.as_str()]).await?;
    Ok(out.success)
}

/// Name of the checked-out branch, `None` on a detached HEAD
pub async fn current_branch(repo: &Path) -> Result<Option<String>> {
    let out = git_command(repo, ["symbolic-ref", "--quiet", "--short", "HEAD"]).await?;
    Ok(out.success.then(|| out.stdout.trim().to_string()))
}

pub async fn delete_branch(repo: &Path, branch: &str, force: bool) -> Result<()> {
    let flag = if force { "-D" } else { "-d" };
    git_command_checked(repo, ["branch", flag, branch]).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Fresh repository on `main` with one commit
    pub(crate) async fn init_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let setup: [&[&str]; 4] = [
            &["init", "--quiet"],
            &["config", "user.email", "agtop@example.com"],
            &["config", "user.name", "agtop"],
            &["checkout", "--quiet", "-b", "main"],
        ];
        for args in setup {
            git_command_checked(dir.path(), args.iter().copied()).await.unwrap();
        }

        tokio::fs::write(dir.path().join("test.txt"), "seed\n").await.unwrap();
        git_command_checked(dir.path(), ["add", "."]).await.unwrap();
        git_command_checked(dir.path(), ["commit", "--quiet", "-m", "seed"])
            .await
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_is_git_repository() {
        let dir = init_test_repo().await;
        assert!(is_git_repository(dir.path()).await.unwrap());

        let plain = TempDir::new().unwrap();
        assert!(!is_git_repository(plain.path()).await.unwrap());
        assert!(!is_git_repository(&plain.path().join("missing")).await.unwrap());
    }

    #[tokio::test]
    async fn test_branch_exists() {
        let dir = init_test_repo().await;
        assert!(branch_exists(dir.path(), "main").await.unwrap());
        assert!(!branch_exists(dir.path(), "agtop/none").await.unwrap());
    }

    #[tokio::test]
    async fn test_current_branch_and_delete() {
        let dir = init_test_repo().await;
        assert_eq!(current_branch(dir.path()).await.unwrap().as_deref(), Some("main"));

        git_command_checked(dir.path(), ["branch", "scratch"]).await.unwrap();
        delete_branch(dir.path(), "scratch", false).await.unwrap();
        assert!(!branch_exists(dir.path(), "scratch").await.unwrap());

        git_command_checked(dir.path(), ["checkout", "--quiet", "--detach"])
            .await
            .unwrap();
        assert_eq!(current_branch(dir.path()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_checked_failure_reports_command() {
        let dir = init_test_repo().await;
        let err = git_command_checked(dir.path(), ["rev-parse", "no-such-ref"])
            .await
            .unwrap_err();
        assert!(matches!(&err, WorktreeError::Git { command, .. } if command == "rev-parse no-such-ref"));
        assert!(err.to_string().starts_with("`git rev-parse no-such-ref` failed"));
    }
}
