use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::diff::{DiffStats, parse_diff_stats};
use super::worktrees::WorktreeManager;
use crate::errors::GroveError;

const RECORD_SEPARATOR: char = '\u{1e}';
const FIELD_SEPARATOR: char = '\u{1f}';
const LOG_FORMAT: &str = "--format=%x1e%H%x1f%h%x1f%an%x1f%at%x1f%s";

/// Where the commit list was measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistorySource {
    /// `<remote>/<main>..HEAD`
    Remote,
    /// Plain `HEAD` history; no comparison branch was available.
    Local,
    /// `<main>..HEAD` against the local main branch.
    Branch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub hash: String,
    pub short_hash: String,
    pub author: String,
    pub timestamp: i64,
    pub subject: String,
    pub stats: DiffStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitHistory {
    pub source: HistorySource,
    pub comparison_ref: Option<String>,
    pub commits: Vec<CommitRecord>,
}

/// Parses `git log --shortstat` output produced with [`LOG_FORMAT`].
pub fn parse_commit_log(output: &str) -> Vec<CommitRecord> {
    output
        .split(RECORD_SEPARATOR)
        .filter_map(|record| {
            let mut lines = record.lines();
            let header = lines.next()?.trim_end();
            let mut fields = header.splitn(5, FIELD_SEPARATOR);
            let hash = fields.next()?.trim().to_string();
            if hash.is_empty() {
                return None;
            }
            let short_hash = fields.next()?.to_string();
            let author = fields.next()?.to_string();
            let timestamp = fields.next()?.trim().parse::<i64>().unwrap_or(0);
            let subject = fields.next().unwrap_or_default().to_string();
            let stats = parse_diff_stats(&lines.collect::<Vec<_>>().join("\n"));

            Some(CommitRecord {
                hash,
                short_hash,
                author,
                timestamp,
                subject,
                stats,
            })
        })
        .collect()
}

impl WorktreeManager {
    /// Picks the comparison point for `worktree_path`, preferring the remote
    /// main branch, then local main, then bare `HEAD`.
    async fn history_range(&self, worktree_path: &Path, main_branch: &str) -> (HistorySource, Option<String>) {
        let runner = self.runner(worktree_path);
        let remote_ref = format!("refs/remotes/{}/{main_branch}", self.layout.remote_name);
        if runner.rev_parse(&remote_ref).await.is_some() {
            return (HistorySource::Remote, Some(remote_ref));
        }

        let current = runner.current_branch().await;
        if runner.branch_exists(main_branch).await && current.as_deref() != Some(main_branch) {
            debug!("No {remote_ref}; comparing against local '{main_branch}'");
            return (HistorySource::Branch, Some(format!("refs/heads/{main_branch}")));
        }

        debug!("No comparison branch for {}; using local history", worktree_path.display());
        (HistorySource::Local, None)
    }

    /// The last `limit` commits of the worktree branch with line stats.
    pub async fn get_commit_history(
        &self,
        worktree_path: &Path,
        main_branch: &str,
        limit: usize,
    ) -> Result<CommitHistory, GroveError> {
        if !worktree_path.exists() {
            return Err(GroveError::WorktreeNotFound {
                path: worktree_path.display().to_string(),
            });
        }

        let runner = self.runner(worktree_path);
        if runner.head_commit().await.is_none() {
            return Ok(CommitHistory {
                source: HistorySource::Local,
                comparison_ref: None,
                commits: Vec::new(),
            });
        }

        let (source, comparison_ref) = self.history_range(worktree_path, main_branch).await;
        let range = match &comparison_ref {
            Some(base) => format!("{base}..HEAD"),
            None => "HEAD".to_string(),
        };
        let limit_arg = format!("-n{}", limit.max(1));

        let output = runner
            .run_checked(
                "commit_history",
                &["log", "--shortstat", LOG_FORMAT, &limit_arg, &range],
            )
            .await?;
        let commits = parse_commit_log(&output.stdout);

        info!(
            "Loaded {} commit(s) for {} from {range}",
            commits.len(),
            worktree_path.display()
        );
        Ok(CommitHistory {
            source,
            comparison_ref,
            commits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::git::command::test_support::{commit_file, git, init_repo};
    use crate::domains::git::worktrees::WorktreeLayout;
    use tempfile::TempDir;

    #[test]
    fn parses_records_with_and_without_stats() {
        let output = "\u{1e}aaaa\u{1f}aa\u{1f}Ada\u{1f}1700000000\u{1f}Add parser\n\n 2 files changed, 5 insertions(+), 1 deletion(-)\n\
\u{1e}bbbb\u{1f}bb\u{1f}Bob\u{1f}1699999999\u{1f}Empty commit\n";
        let commits = parse_commit_log(output);
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].subject, "Add parser");
        assert_eq!(commits[0].timestamp, 1_700_000_000);
        assert_eq!(commits[0].stats.files_changed, 2);
        assert_eq!(commits[0].stats.deletions, 1);
        assert_eq!(commits[1].author, "Bob");
        assert_eq!(commits[1].stats, DiffStats::default());
    }

    #[test]
    fn subject_may_contain_separators_of_its_own() {
        let output = "\u{1e}cc\u{1f}c\u{1f}Cy\u{1f}1\u{1f}fix: a | b\n";
        assert_eq!(parse_commit_log(output)[0].subject, "fix: a | b");
    }

    #[tokio::test]
    async fn worktree_history_compares_against_local_main() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        init_repo(&repo);
        let manager = WorktreeManager::new(repo.clone(), WorktreeLayout::default());
        let worktree = manager.create_worktree("topic").await.unwrap();
        commit_file(&worktree, "a.txt", "one\ntwo\n", "first");
        commit_file(&worktree, "b.txt", "three\n", "second");

        let history = manager
            .get_commit_history(&worktree, "main", 10)
            .await
            .unwrap();
        assert_eq!(history.source, HistorySource::Branch);
        assert_eq!(history.commits.len(), 2);
        assert_eq!(history.commits[0].subject, "second");
        assert_eq!(history.commits[1].stats.additions, 2);
    }

    #[tokio::test]
    async fn main_without_remote_falls_back_to_local_history() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        init_repo(&repo);
        commit_file(&repo, "x.txt", "x\n", "second");
        commit_file(&repo, "y.txt", "y\n", "third");
        let manager = WorktreeManager::new(repo.clone(), WorktreeLayout::default());

        let history = manager.get_commit_history(&repo, "main", 2).await.unwrap();
        assert_eq!(history.source, HistorySource::Local);
        assert_eq!(history.comparison_ref, None);
        assert_eq!(history.commits.len(), 2);
        assert_eq!(history.commits[0].subject, "third");
    }

    #[tokio::test]
    async fn remote_tracking_branch_is_preferred() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        init_repo(&repo);
        let head = git(&repo, &["rev-parse", "HEAD"]);
        git(&repo, &["update-ref", "refs/remotes/origin/main", &head]);
        commit_file(&repo, "z.txt", "z\n", "unpushed");
        let manager = WorktreeManager::new(repo.clone(), WorktreeLayout::default());

        let history = manager.get_commit_history(&repo, "main", 20).await.unwrap();
        assert_eq!(history.source, HistorySource::Remote);
        assert_eq!(history.commits.len(), 1);
        assert_eq!(history.commits[0].subject, "unpushed");
    }
}
