//! Best-effort git helpers.
//!
//! Every operation here is advisory: a missing `git` binary, a directory that
//! is not a repository, or an unreachable remote degrades to a logged warning
//! and never fails the caller.

use std::path::Path;

use log::{debug, warn};
use tokio::process::Command;

/// Update a working tree from its remote. Returns whether the pull succeeded.
pub async fn pull(dir: &Path) -> bool {
    match Command::new("git")
        .arg("-C")
        .arg(dir)
        .arg("pull")
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            debug!("pulled latest changes in {}", dir.display());
            true
        }
        Ok(output) => {
            warn!(
                "git pull failed in {}: {}",
                dir.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            false
        }
        Err(e) => {
            warn!("could not run git pull in {}: {e}", dir.display());
            false
        }
    }
}

/// Check out a branch in a working tree. Returns whether the checkout
/// succeeded; the tree stays on its current branch otherwise.
pub async fn checkout(dir: &Path, branch: &str) -> bool {
    match Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["checkout", branch])
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            debug!("checked out branch {branch} in {}", dir.display());
            true
        }
        Ok(output) => {
            warn!(
                "branch checkout {branch} failed in {}: {}",
                dir.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            false
        }
        Err(e) => {
            warn!("could not run git checkout in {}: {e}", dir.display());
            false
        }
    }
}

/// List local branch names of a repository. Empty when the directory is not
/// a git repository or `git` is unavailable.
pub async fn branches(dir: &Path) -> Vec<String> {
    match Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["branch", "--format=%(refname:short)"])
        .output()
        .await
    {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}
