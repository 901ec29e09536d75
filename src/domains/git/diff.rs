use anyhow::Result;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use super::command::{DEFAULT_GIT_TIMEOUT, EMPTY_TREE_HASH, GitRunner};
use crate::errors::GroveError;

static FILES_CHANGED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s+files?\s+changed").expect("valid regex"));
static INSERTIONS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s+insertions?\(\+\)").expect("valid regex"));
static DELETIONS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s+deletions?\(-\)").expect("valid regex"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub additions: u64,
    pub deletions: u64,
    pub files_changed: u64,
}

impl DiffStats {
    pub fn is_empty(&self) -> bool {
        self.files_changed == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedDiff {
    pub diff: String,
    pub stats: DiffStats,
    pub changed_files: Vec<String>,
    pub before_hash: Option<String>,
    pub after_hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedDiff {
    pub diff: String,
    pub stats: DiffStats,
    pub changed_files: Vec<String>,
}

/// Parses the summary line of `git diff --stat` output, e.g.
/// `2 files changed, 10 insertions(+), 3 deletions(-)`. Missing fields are zero.
pub fn parse_diff_stats(stat_output: &str) -> DiffStats {
    let Some(summary) = stat_output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
    else {
        return DiffStats::default();
    };

    let capture = |re: &Regex| {
        re.captures(summary)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(0)
    };

    DiffStats {
        files_changed: capture(&FILES_CHANGED),
        additions: capture(&INSERTIONS),
        deletions: capture(&DELETIONS),
    }
}

/// Concatenates diffs in order. Additions and deletions are summed; files are
/// counted once no matter how many inputs touched them.
pub fn combine_diffs(diffs: &[CapturedDiff]) -> CombinedDiff {
    let mut seen = HashSet::new();
    let mut changed_files = Vec::new();
    let mut stats = DiffStats::default();
    let mut text = String::new();

    for diff in diffs {
        if !diff.diff.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&diff.diff);
        }
        stats.additions += diff.stats.additions;
        stats.deletions += diff.stats.deletions;
        for file in &diff.changed_files {
            if seen.insert(file.clone()) {
                changed_files.push(file.clone());
            }
        }
    }

    stats.files_changed = changed_files.len() as u64;
    CombinedDiff {
        diff: text,
        stats,
        changed_files,
    }
}

/// Splits unified diff text into per-file blocks keyed by the post-image path.
pub fn split_diff_by_file(diff: &str) -> Vec<(String, String)> {
    let mut blocks: Vec<(String, String)> = Vec::new();
    for line in diff.split_inclusive('\n') {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            let path = rest
                .trim_end()
                .rsplit_once(" b/")
                .map(|(_, b)| b.to_string())
                .unwrap_or_else(|| rest.trim_end().to_string());
            blocks.push((path, line.to_string()));
        } else if let Some((_, block)) = blocks.last_mut() {
            block.push_str(line);
        }
    }
    blocks
}

fn count_block_lines(block: &str) -> (u64, u64) {
    let mut additions = 0;
    let mut deletions = 0;
    for line in block.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if line.starts_with('+') {
            additions += 1;
        } else if line.starts_with('-') {
            deletions += 1;
        }
    }
    (additions, deletions)
}

/// Keeps only the files whose diff changed between `before` and `after`.
pub fn subtract_unchanged(before: &CapturedDiff, after: &CapturedDiff) -> CapturedDiff {
    let before_blocks: HashMap<String, String> =
        split_diff_by_file(&before.diff).into_iter().collect();

    let mut diff = String::new();
    let mut changed_files = Vec::new();
    let mut stats = DiffStats::default();
    for (path, block) in split_diff_by_file(&after.diff) {
        if before_blocks.get(&path) == Some(&block) {
            continue;
        }
        let (additions, deletions) = count_block_lines(&block);
        stats.additions += additions;
        stats.deletions += deletions;
        diff.push_str(&block);
        changed_files.push(path);
    }

    // Files reverted back to their committed state during the turn.
    let after_paths: HashSet<&String> = after.changed_files.iter().collect();
    for path in before.changed_files.iter() {
        if !after_paths.contains(path) && !changed_files.contains(path) {
            changed_files.push(path.clone());
        }
    }

    stats.files_changed = changed_files.len() as u64;
    CapturedDiff {
        diff,
        stats,
        changed_files,
        before_hash: before.before_hash.clone(),
        after_hash: after.after_hash.clone(),
    }
}

fn lines_to_files(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Stateless diff plumbing over the git CLI.
#[derive(Debug, Clone)]
pub struct GitDiffManager {
    timeout: Duration,
}

impl Default for GitDiffManager {
    fn default() -> Self {
        Self::new(DEFAULT_GIT_TIMEOUT)
    }
}

impl GitDiffManager {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn runner(&self, path: &Path) -> GitRunner {
        GitRunner::new(path).with_timeout(self.timeout)
    }

    pub fn parse_diff_stats(&self, stat_output: &str) -> DiffStats {
        parse_diff_stats(stat_output)
    }

    pub fn combine_diffs(&self, diffs: &[CapturedDiff]) -> CombinedDiff {
        combine_diffs(diffs)
    }

    pub async fn has_changes(&self, path: &Path) -> Result<bool, GroveError> {
        let output = self
            .runner(path)
            .run_checked("status", &["status", "--porcelain"])
            .await?;
        Ok(!output.stdout.trim().is_empty())
    }

    pub async fn head_commit(&self, path: &Path) -> Option<String> {
        self.runner(path).head_commit().await
    }

    /// Working tree (tracked and untracked files) against `HEAD`.
    pub async fn capture_working_directory_diff(
        &self,
        path: &Path,
    ) -> Result<CapturedDiff, GroveError> {
        let runner = self.runner(path);
        let head = runner.head_commit().await;
        let base = head.clone().unwrap_or_else(|| EMPTY_TREE_HASH.to_string());
        let mut captured = self.capture_against(&runner, &base).await?;
        captured.before_hash = head.clone();
        captured.after_hash = head;
        Ok(captured)
    }

    /// Working tree against an arbitrary commit, so commits made during a turn are included.
    pub async fn capture_working_directory_diff_since(
        &self,
        path: &Path,
        base_commit: &str,
    ) -> Result<CapturedDiff, GroveError> {
        let runner = self.runner(path);
        let mut captured = self.capture_against(&runner, base_commit).await?;
        captured.before_hash = Some(base_commit.to_string());
        captured.after_hash = runner.head_commit().await;
        Ok(captured)
    }

    async fn capture_against(
        &self,
        runner: &GitRunner,
        base: &str,
    ) -> Result<CapturedDiff, GroveError> {
        let diff = runner.run_checked("diff", &["diff", base]).await?;
        let stat = runner.run_checked("diff", &["diff", "--stat", base]).await?;
        let names = runner
            .run_checked("diff", &["diff", "--name-only", base])
            .await?;

        let mut captured = CapturedDiff {
            diff: diff.stdout,
            stats: parse_diff_stats(&stat.stdout),
            changed_files: lines_to_files(&names.stdout),
            before_hash: None,
            after_hash: None,
        };

        self.append_untracked(runner, &mut captured).await?;
        captured.stats.files_changed = captured.changed_files.len() as u64;
        Ok(captured)
    }

    async fn append_untracked(
        &self,
        runner: &GitRunner,
        captured: &mut CapturedDiff,
    ) -> Result<(), GroveError> {
        let listing = runner
            .run_checked(
                "ls-files",
                &["ls-files", "--others", "--exclude-standard"],
            )
            .await?;

        for file in lines_to_files(&listing.stdout) {
            let patch = runner
                .run(&["diff", "--no-index", "--", "/dev/null", &file])
                .await;
            let stat = runner
                .run(&["diff", "--no-index", "--stat", "--", "/dev/null", &file])
                .await;
            match (patch, stat) {
                (Ok(patch), Ok(stat)) => {
                    // --no-index exits 1 when the inputs differ.
                    if !matches!(patch.exit_code, Some(0) | Some(1)) {
                        warn!("Skipping untracked file {file}: {}", patch.combined());
                        continue;
                    }
                    let stats = parse_diff_stats(&stat.stdout);
                    captured.stats.additions += stats.additions;
                    captured.stats.deletions += stats.deletions;
                    if !captured.diff.is_empty() && !captured.diff.ends_with('\n') {
                        captured.diff.push('\n');
                    }
                    captured.diff.push_str(&patch.stdout);
                    if !captured.changed_files.contains(&file) {
                        captured.changed_files.push(file);
                    }
                }
                (Err(err), _) | (_, Err(err)) => {
                    warn!("Failed to diff untracked file {file}: {err:#}");
                }
            }
        }
        Ok(())
    }

    /// Diff between two points; `to` defaults to `HEAD`.
    pub async fn capture_commit_diff(
        &self,
        path: &Path,
        from: &str,
        to: Option<&str>,
    ) -> Result<CapturedDiff, GroveError> {
        let runner = self.runner(path);
        let to = to.unwrap_or("HEAD");

        let from_spec = if from == EMPTY_TREE_HASH {
            from.to_string()
        } else {
            runner.rev_parse(from).await.ok_or_else(|| {
                GroveError::git("diff", format!("unknown revision '{from}'"))
            })?
        };
        let to_spec = runner
            .rev_parse(to)
            .await
            .ok_or_else(|| GroveError::git("diff", format!("unknown revision '{to}'")))?;

        let (diff, stat, names) = if from_spec == EMPTY_TREE_HASH {
            (
                runner.run_checked("diff", &["diff", &from_spec, &to_spec]).await?,
                runner
                    .run_checked("diff", &["diff", "--stat", &from_spec, &to_spec])
                    .await?,
                runner
                    .run_checked("diff", &["diff", "--name-only", &from_spec, &to_spec])
                    .await?,
            )
        } else {
            let range = format!("{from_spec}..{to_spec}");
            (
                runner.run_checked("diff", &["diff", &range]).await?,
                runner.run_checked("diff", &["diff", "--stat", &range]).await?,
                runner
                    .run_checked("diff", &["diff", "--name-only", &range])
                    .await?,
            )
        };

        let changed_files = lines_to_files(&names.stdout);
        let mut stats = parse_diff_stats(&stat.stdout);
        stats.files_changed = changed_files.len() as u64;

        Ok(CapturedDiff {
            diff: diff.stdout,
            stats,
            changed_files,
            before_hash: Some(from_spec),
            after_hash: Some(to_spec),
        })
    }

    /// Net change introduced by the commits `oldest..=newest`. Diffs from the
    /// first parent of `oldest`, or the empty tree when it is a root commit.
    pub async fn capture_commit_range_diff(
        &self,
        path: &Path,
        oldest: &str,
        newest: &str,
    ) -> Result<CapturedDiff, GroveError> {
        let runner = self.runner(path);
        let base = match runner.rev_parse(&format!("{oldest}^1")).await {
            Some(parent) => parent,
            None => {
                debug!("Commit {oldest} has no parent; diffing from the empty tree");
                EMPTY_TREE_HASH.to_string()
            }
        };
        self.capture_commit_diff(path, &base, Some(newest)).await
    }
}
