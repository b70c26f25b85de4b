//! Project materialization backed by speculative hot copies.
//!
//! Cloning a repository by full tree copy is the dominant latency of starting
//! a project-backed conversation. The cache keeps at most one pre-copied
//! staging tree per repository name under the hot-copy root; consuming it is
//! a rename, after which a background task refills the slot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use log::{info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use walkdir::WalkDir;

use super::git;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced by project materialization.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The destination already exists; nothing was mutated.
    #[error("project already exists: {0}")]
    ProjectAlreadyExists(String),

    /// No source repository with the given name.
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// IO error while moving or copying trees.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A clonable source repository, as reported to the client.
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub branches: Vec<String>,
}

/// Repository cache over a repositories root and a hot-copy root.
pub struct RepoCache {
    repositories_dir: PathBuf,
    hot_copies_dir: PathBuf,
    /// Repository names with a preparation currently in flight. Guards the
    /// single-writer invariant on each hot-copy slot.
    preparing: DashMap<String, ()>,
}

impl RepoCache {
    pub fn new(repositories_dir: PathBuf, hot_copies_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            repositories_dir,
            hot_copies_dir,
            preparing: DashMap::new(),
        })
    }

    fn source_path(&self, name: &str) -> PathBuf {
        self.repositories_dir.join(name)
    }

    fn hot_path(&self, name: &str) -> PathBuf {
        self.hot_copies_dir.join(name)
    }

    /// Whether a source repository with this name exists.
    pub fn has_repository(&self, name: &str) -> bool {
        self.source_path(name).is_dir()
    }

    /// List source repositories with their branches.
    pub async fn list_repositories(&self) -> Vec<RepositoryInfo> {
        let mut repos = Vec::new();
        let mut entries = match fs::read_dir(&self.repositories_dir).await {
            Ok(entries) => entries,
            Err(_) => return repos,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let branches = git::branches(&path).await;
            repos.push(RepositoryInfo { name, branches });
        }
        repos.sort_by(|a, b| a.name.cmp(&b.name));
        repos
    }

    /// Materialize a project from a source repository.
    ///
    /// Prefers consuming the hot copy (an O(1) rename) over a full tree copy.
    /// Either way a background refill of the hot-copy slot is triggered.
    /// Remote updates and the optional branch checkout are best-effort.
    pub async fn resolve_project(
        self: &Arc<Self>,
        repository: &str,
        destination: &Path,
        branch: Option<&str>,
    ) -> CacheResult<()> {
        if destination.exists() {
            return Err(CacheError::ProjectAlreadyExists(
                destination.display().to_string(),
            ));
        }
        let source = self.source_path(repository);
        if !source.is_dir() {
            return Err(CacheError::RepositoryNotFound(repository.to_string()));
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let hot = self.hot_path(repository);
        if hot.is_dir() {
            // Cache hit: consume the slot, then freshen from the remote.
            fs::rename(&hot, destination).await?;
            info!(
                "moved hot copy of {repository} to {}",
                destination.display()
            );
            git::pull(destination).await;
        } else {
            git::pull(&source).await;
            if let Err(e) = copy_tree(source.clone(), destination.to_path_buf()).await {
                // A partial tree would make every retry fail as
                // already-existing.
                let _ = fs::remove_dir_all(destination).await;
                return Err(e.into());
            }
            info!("copied {repository} to {}", destination.display());
        }

        if let Some(branch) = branch {
            git::checkout(destination, branch).await;
        }

        self.prepare_hot_copy(repository);
        Ok(())
    }

    /// Speculatively duplicate a source repository into its hot-copy slot.
    ///
    /// No-op when the slot is occupied or a preparation is already running.
    /// Runs in the background; failures are logged and leave the slot empty
    /// for a later retry.
    pub fn prepare_hot_copy(self: &Arc<Self>, repository: &str) {
        let hot = self.hot_path(repository);
        if hot.exists() {
            return;
        }
        if self
            .preparing
            .insert(repository.to_string(), ())
            .is_some()
        {
            // Another preparation holds the slot.
            return;
        }

        let cache = Arc::clone(self);
        let repository = repository.to_string();
        tokio::spawn(async move {
            let source = cache.source_path(&repository);
            let result = async {
                fs::create_dir_all(&cache.hot_copies_dir).await?;
                copy_tree(source, hot.clone()).await
            }
            .await;
            match result {
                Ok(()) => info!("prepared hot copy for {repository}"),
                Err(e) => {
                    warn!("hot copy preparation failed for {repository}: {e}");
                    let _ = fs::remove_dir_all(&hot).await;
                }
            }
            cache.preparing.remove(&repository);
        });
    }
}

/// Recursively copy a directory tree. Runs on the blocking pool; the walk
/// preserves relative layout but not permissions beyond the platform default.
async fn copy_tree(source: PathBuf, destination: PathBuf) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        for entry in WalkDir::new(&source) {
            let entry = entry.map_err(std::io::Error::other)?;
            let relative = entry
                .path()
                .strip_prefix(&source)
                .map_err(std::io::Error::other)?;
            let target = destination.join(relative);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else if entry.file_type().is_symlink() {
                let link = std::fs::read_link(entry.path())?;
                std::os::unix::fs::symlink(link, &target)?;
            } else {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(entry.path(), &target)?;
            }
        }
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        cache: Arc<RepoCache>,
        repositories: PathBuf,
        projects: PathBuf,
        hot_copies: PathBuf,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let repositories = root.path().join("repositories");
        let hot_copies = root.path().join("hot-copies");
        let projects = root.path().join("projects");
        std::fs::create_dir_all(repositories.join("demo").join("src")).unwrap();
        std::fs::write(repositories.join("demo").join("README.md"), "# demo\n").unwrap();
        std::fs::write(repositories.join("demo").join("src").join("main.rs"), "fn main() {}\n")
            .unwrap();
        let cache = RepoCache::new(repositories.clone(), hot_copies.clone());
        Fixture {
            _root: root,
            cache,
            repositories,
            projects,
            hot_copies,
        }
    }

    async fn wait_for(path: &Path) {
        for _ in 0..100 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {}", path.display());
    }

    #[tokio::test]
    async fn existing_destination_fails_without_mutation() {
        let fx = fixture();
        let dest = fx.projects.join("demo1");
        std::fs::create_dir_all(&dest).unwrap();

        let err = fx
            .cache
            .resolve_project("demo", &dest, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::ProjectAlreadyExists(_)));
        // The pre-existing directory is untouched and no hot copy was staged.
        assert!(std::fs::read_dir(&dest).unwrap().next().is_none());
        assert!(!fx.hot_copies.join("demo").exists());
    }

    #[tokio::test]
    async fn unknown_repository_is_rejected() {
        let fx = fixture();
        let err = fx
            .cache
            .resolve_project("nope", &fx.projects.join("p"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::RepositoryNotFound(_)));
    }

    #[tokio::test]
    async fn cold_resolve_copies_and_refills_the_slot() {
        let fx = fixture();
        let dest = fx.projects.join("demo1");

        fx.cache.resolve_project("demo", &dest, None).await.unwrap();

        assert!(dest.join("src").join("main.rs").exists());
        assert!(dest.join("README.md").exists());
        // The speculative refill eventually stages a hot copy.
        wait_for(&fx.hot_copies.join("demo").join("README.md")).await;
    }

    #[tokio::test]
    async fn hot_resolve_consumes_the_slot_by_rename() {
        let fx = fixture();
        let hot = fx.hot_copies.join("demo");
        std::fs::create_dir_all(&hot).unwrap();
        std::fs::write(hot.join("MARKER"), "staged\n").unwrap();

        let dest = fx.projects.join("demo2");
        fx.cache.resolve_project("demo", &dest, None).await.unwrap();

        // The staged tree moved wholesale, so the marker travels with it.
        assert!(dest.join("MARKER").exists());
        // Slot was freed and then refilled from the source.
        wait_for(&fx.hot_copies.join("demo").join("README.md")).await;
        assert!(!fx.hot_copies.join("demo").join("MARKER").exists());
    }

    #[tokio::test]
    async fn failed_cold_copy_removes_the_partial_tree() {
        let fx = fixture();
        // A socket cannot be opened for copying, so the tree copy fails
        // partway through.
        let socket = fx.repositories.join("demo").join("control.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&socket).unwrap();

        let dest = fx.projects.join("demo1");
        let err = fx
            .cache
            .resolve_project("demo", &dest, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Io(_)));
        // No partial tree is left to block a retry.
        assert!(!dest.exists());

        std::fs::remove_file(&socket).unwrap();
        fx.cache.resolve_project("demo", &dest, None).await.unwrap();
        assert!(dest.join("README.md").exists());
        wait_for(&fx.hot_copies.join("demo").join("README.md")).await;
    }

    #[tokio::test]
    async fn concurrent_preparations_run_once() {
        let fx = fixture();
        fx.cache.prepare_hot_copy("demo");
        // Second call before the first completes must not start another copy.
        assert!(fx.cache.preparing.contains_key("demo"));
        fx.cache.prepare_hot_copy("demo");
        assert_eq!(fx.cache.preparing.len(), 1);

        wait_for(&fx.hot_copies.join("demo").join("README.md")).await;
        for _ in 0..100 {
            if !fx.cache.preparing.contains_key("demo") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Occupied slot: another call is a no-op and takes no guard.
        fx.cache.prepare_hot_copy("demo");
        assert!(fx.cache.preparing.is_empty());
    }

    #[tokio::test]
    async fn preparation_failure_leaves_slot_empty() {
        let fx = fixture();
        fx.cache.prepare_hot_copy("missing");
        for _ in 0..100 {
            if fx.cache.preparing.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!fx.hot_copies.join("missing").exists());
    }
}
