use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::command::{DEFAULT_GIT_TIMEOUT, GitRunner};
use super::diff::GitDiffManager;
use crate::errors::GroveError;
use crate::shared::naming::{format_branch_name, sanitize_name, validate_branch_name};

/// Where worktrees live and how their branches are named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeLayout {
    pub worktrees_dir: String,
    pub branch_prefix: String,
    pub remote_name: String,
}

impl Default for WorktreeLayout {
    fn default() -> Self {
        Self {
            worktrees_dir: "worktrees".to_string(),
            branch_prefix: String::new(),
            remote_name: "origin".to_string(),
        }
    }
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: Option<String>,
    pub branch: Option<String>,
    pub bare: bool,
    pub detached: bool,
    pub locked: bool,
    pub prunable: bool,
}

pub fn parse_worktree_porcelain(output: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            if let Some(info) = current.take() {
                worktrees.push(info);
            }
            continue;
        }

        let (key, value) = line.split_once(' ').unwrap_or((line, ""));
        if key == "worktree" {
            if let Some(info) = current.take() {
                worktrees.push(info);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(value),
                ..Default::default()
            });
            continue;
        }

        let Some(info) = current.as_mut() else {
            continue;
        };
        match key {
            "HEAD" => info.head = Some(value.to_string()),
            "branch" => {
                info.branch = Some(
                    value
                        .strip_prefix("refs/heads/")
                        .unwrap_or(value)
                        .to_string(),
                );
            }
            "bare" => info.bare = true,
            "detached" => info.detached = true,
            "locked" => info.locked = true,
            "prunable" => info.prunable = true,
            _ => {}
        }
    }

    if let Some(info) = current {
        worktrees.push(info);
    }
    worktrees
}

fn is_missing_worktree_output(output: &str) -> bool {
    let lowered = output.to_lowercase();
    lowered.contains("is not a working tree")
        || lowered.contains("does not exist")
        || lowered.contains("no such file or directory")
}

pub struct WorktreeManager {
    pub(crate) project_path: PathBuf,
    pub(crate) layout: WorktreeLayout,
    pub(crate) diff: GitDiffManager,
    pub(crate) timeout: Duration,
}

impl WorktreeManager {
    pub fn new(project_path: PathBuf, layout: WorktreeLayout) -> Self {
        Self {
            project_path,
            layout,
            diff: GitDiffManager::new(DEFAULT_GIT_TIMEOUT),
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.diff = GitDiffManager::new(timeout);
        self
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn diff_manager(&self) -> &GitDiffManager {
        &self.diff
    }

    pub(crate) fn runner(&self, dir: &Path) -> GitRunner {
        GitRunner::new(dir).with_timeout(self.timeout)
    }

    pub fn worktrees_root(&self) -> PathBuf {
        self.project_path.join(&self.layout.worktrees_dir)
    }

    pub fn worktree_path(&self, name: &str) -> PathBuf {
        self.worktrees_root().join(name)
    }

    pub fn branch_name(&self, name: &str) -> String {
        format_branch_name(&self.layout.branch_prefix, name)
    }

    fn sanitized(&self, name: &str) -> Result<String, GroveError> {
        let sanitized = sanitize_name(name);
        if sanitized.is_empty() {
            return Err(GroveError::invalid_input(
                "name",
                format!("'{name}' does not contain any usable characters"),
            ));
        }
        Ok(sanitized)
    }

    pub async fn branch_exists(&self, branch: &str) -> bool {
        self.runner(&self.project_path).branch_exists(branch).await
    }

    /// Creates `worktrees/<name>` on branch `<prefix>/<name>`. Any stale worktree
    /// at the target path is removed first, so calling this twice is safe.
    pub async fn create_worktree(&self, name: &str) -> Result<PathBuf, GroveError> {
        let name = self.sanitized(name)?;
        let branch = self.branch_name(&name);
        validate_branch_name(&branch).map_err(|msg| GroveError::invalid_input("branch", msg))?;
        let path = self.worktree_path(&name);
        let path_str = path.to_string_lossy().to_string();
        let runner = self.runner(&self.project_path);

        self.discard_stale_worktree(&path).await;

        let root = self.worktrees_root();
        std::fs::create_dir_all(&root)
            .map_err(|e| GroveError::io("create_dir_all", root.display(), e))?;
        self.ensure_worktrees_excluded().await;

        let args: Vec<&str> = if runner.branch_exists(&branch).await {
            debug!("Branch '{branch}' exists; attaching worktree to it");
            vec!["worktree", "add", &path_str, &branch]
        } else {
            vec!["worktree", "add", "-b", &branch, &path_str]
        };

        runner.run_checked("create_worktree", &args).await?;
        info!(
            "Created worktree '{name}' at {} on branch '{branch}'",
            path.display()
        );
        Ok(path)
    }

    /// Keeps the worktrees root out of the project's `git status`.
    async fn ensure_worktrees_excluded(&self) {
        let runner = self.runner(&self.project_path);
        let Some(output) = runner
            .run_quiet(&["rev-parse", "--git-common-dir"])
            .await
            .filter(|o| o.success())
        else {
            return;
        };

        let common_dir = PathBuf::from(output.stdout.trim());
        let common_dir = if common_dir.is_absolute() {
            common_dir
        } else {
            self.project_path.join(common_dir)
        };
        let exclude_path = common_dir.join("info").join("exclude");
        let pattern = format!("/{}/", self.layout.worktrees_dir.trim_matches('/'));

        let existing = std::fs::read_to_string(&exclude_path).unwrap_or_default();
        if existing.lines().any(|line| line.trim() == pattern) {
            return;
        }

        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&pattern);
        updated.push('\n');

        if let Some(parent) = exclude_path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            warn!("Failed to create {}: {e}", parent.display());
            return;
        }
        if let Err(e) = std::fs::write(&exclude_path, updated) {
            warn!(
                "Failed to add {pattern} to {}: {e}",
                exclude_path.display()
            );
        }
    }

    async fn discard_stale_worktree(&self, path: &Path) {
        let runner = self.runner(&self.project_path);
        let path_str = path.to_string_lossy().to_string();

        if let Some(output) = runner
            .run_quiet(&["worktree", "remove", "--force", &path_str])
            .await
            && output.success()
        {
            info!("Removed stale worktree at {}", path.display());
        }

        if path.exists() {
            if let Err(e) = std::fs::remove_dir_all(path) {
                warn!(
                    "Failed to remove leftover worktree directory {}: {e}",
                    path.display()
                );
            }
        }

        runner.run_quiet(&["worktree", "prune"]).await;
    }

    /// Force-removes `worktrees/<name>`. A worktree that is already gone is not an error.
    pub async fn remove_worktree(&self, name: &str) -> Result<(), GroveError> {
        let path = self.worktree_path(name);
        self.remove_worktree_at(&path).await
    }

    pub async fn remove_worktree_at(&self, path: &Path) -> Result<(), GroveError> {
        let runner = self.runner(&self.project_path);
        let path_str = path.to_string_lossy().to_string();
        let output = runner
            .run(&["worktree", "remove", "--force", &path_str])
            .await
            .map_err(|e| GroveError::git("remove_worktree", format!("{e:#}")))?;

        if output.success() {
            info!("Removed worktree at {}", path.display());
            return Ok(());
        }

        let combined = output.combined();
        if is_missing_worktree_output(&combined) {
            debug!(
                "Worktree at {} already gone: {combined}",
                path.display()
            );
            if path.exists()
                && let Err(e) = std::fs::remove_dir_all(path)
            {
                warn!("Failed to remove directory {}: {e}", path.display());
            }
            runner.run_quiet(&["worktree", "prune"]).await;
            return Ok(());
        }

        Err(output.into_error("remove_worktree"))
    }

    pub async fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GroveError> {
        let output = self
            .runner(&self.project_path)
            .run_checked("list_worktrees", &["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_porcelain(&output.stdout))
    }

    /// True when git knows a worktree at `path`.
    pub async fn is_registered(&self, path: &Path) -> Result<bool, GroveError> {
        let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        Ok(self.list_worktrees().await?.iter().any(|wt| {
            wt.path == path
                || wt
                    .path
                    .canonicalize()
                    .map(|p| p == target)
                    .unwrap_or(false)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::git::command::test_support::{git, init_repo};
    use tempfile::TempDir;

    fn manager(temp: &TempDir) -> WorktreeManager {
        let repo = temp.path().join("repo");
        init_repo(&repo);
        WorktreeManager::new(repo, WorktreeLayout::default())
    }

    #[test]
    fn parses_porcelain_listing() {
        let output = "worktree /repo\nHEAD abc123\nbranch refs/heads/main\n\n\
worktree /repo/worktrees/foo\nHEAD def456\nbranch refs/heads/foo\nlocked\n\n\
worktree /repo/worktrees/tmp\nHEAD 789\ndetached\nprunable gitdir file points to non-existent location\n";
        let parsed = parse_worktree_porcelain(output);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].branch.as_deref(), Some("main"));
        assert_eq!(parsed[1].path, PathBuf::from("/repo/worktrees/foo"));
        assert!(parsed[1].locked);
        assert!(parsed[2].detached);
        assert!(parsed[2].prunable);
        assert_eq!(parsed[2].branch, None);
    }

    #[test]
    fn recognises_missing_worktree_messages() {
        assert!(is_missing_worktree_output(
            "fatal: '/x/worktrees/foo' is not a working tree"
        ));
        assert!(!is_missing_worktree_output("fatal: permission denied"));
    }

    #[tokio::test]
    async fn create_worktree_uses_sanitized_name() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);

        let path = manager.create_worktree("Add a README").await.unwrap();
        assert_eq!(path, manager.worktree_path("add-a-readme"));
        assert!(path.join("README.md").exists());
        assert_eq!(git(&path, &["rev-parse", "--abbrev-ref", "HEAD"]), "add-a-readme");
    }

    #[tokio::test]
    async fn create_worktree_twice_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);

        let first = manager.create_worktree("foo").await.unwrap();
        std::fs::write(first.join("scratch.txt"), "stale").unwrap();

        let second = manager.create_worktree("foo").await.unwrap();
        assert_eq!(first, second);
        assert!(!second.join("scratch.txt").exists());
        git(&second, &["status", "--porcelain"]);
        assert!(manager.is_registered(&second).await.unwrap());
    }

    #[tokio::test]
    async fn create_worktree_recovers_from_unregistered_leftover_directory() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);
        let leftover = manager.worktree_path("foo");
        std::fs::create_dir_all(&leftover).unwrap();
        std::fs::write(leftover.join("junk"), "x").unwrap();

        let path = manager.create_worktree("foo").await.unwrap();
        assert!(path.join("README.md").exists());
        assert!(!path.join("junk").exists());
    }

    #[tokio::test]
    async fn remove_missing_worktree_is_not_an_error() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);

        manager.remove_worktree("never-created").await.unwrap();

        let path = manager.create_worktree("gone").await.unwrap();
        std::fs::remove_dir_all(&path).unwrap();
        manager.remove_worktree("gone").await.unwrap();
        assert!(!manager.is_registered(&path).await.unwrap());
    }

    #[tokio::test]
    async fn worktrees_root_is_excluded_from_project_status() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);
        manager.create_worktree("hidden").await.unwrap();
        manager.create_worktree("hidden-too").await.unwrap();

        let status = git(manager.project_path(), &["status", "--porcelain"]);
        assert!(status.is_empty(), "unexpected status: {status}");
        let exclude =
            std::fs::read_to_string(manager.project_path().join(".git/info/exclude")).unwrap();
        assert_eq!(exclude.matches("/worktrees/").count(), 1);
    }

    #[tokio::test]
    async fn lists_created_worktrees() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);
        manager.create_worktree("one").await.unwrap();
        manager.create_worktree("two").await.unwrap();

        let listed = manager.list_worktrees().await.unwrap();
        let branches: Vec<_> = listed.iter().filter_map(|w| w.branch.clone()).collect();
        assert!(branches.contains(&"main".to_string()));
        assert!(branches.contains(&"one".to_string()));
        assert!(branches.contains(&"two".to_string()));
    }

    #[tokio::test]
    async fn rejects_unusable_names() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);
        let err = manager.create_worktree("!!!").await.unwrap_err();
        assert!(matches!(err, GroveError::InvalidInput { .. }));
    }
}
