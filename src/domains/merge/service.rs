use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use git2::{BranchType, MergeOptions, Oid, Repository};
use log::{debug, info, warn};
use tokio::task;

use super::types::{CommitSummary, ConflictCheck, ConflictingCommits, GitOperationReport};
use crate::domains::git::command::{GitOutput, GitRunner, format_git_command};
use crate::domains::git::worktrees::WorktreeManager;
use crate::errors::GroveError;

const OPERATION_LABEL: &str = "reconcile_worktree";
const COMMIT_LIST_LIMIT: usize = 50;

/// Dry 3-way merge of the worktree's HEAD with `main_branch` in memory.
/// Nothing on disk or in any ref changes.
pub fn compute_rebase_conflicts(worktree_path: &Path, main_branch: &str) -> Result<ConflictCheck> {
    let repo = Repository::open(worktree_path).with_context(|| {
        format!(
            "Failed to open git repository at {}",
            worktree_path.display()
        )
    })?;

    let head_oid = repo
        .head()
        .context("Failed to read HEAD")?
        .target()
        .ok_or_else(|| anyhow!("HEAD has no target"))?;
    let main_oid = resolve_branch_oid(&repo, main_branch)?;

    if head_oid == main_oid {
        return Ok(ConflictCheck::default());
    }

    let commits = divergent_commits(&repo, head_oid, main_oid)?;
    if commits.ours.is_empty() || commits.theirs.is_empty() {
        debug!(
            "{OPERATION_LABEL}: no divergence between HEAD and '{main_branch}' in {}",
            worktree_path.display()
        );
        return Ok(ConflictCheck::default());
    }

    let head_commit = repo.find_commit(head_oid)?;
    let main_commit = repo
        .find_commit(main_oid)
        .with_context(|| format!("Failed to find commit {main_oid} for '{main_branch}'"))?;

    let mut merge_opts = MergeOptions::new();
    merge_opts.fail_on_conflict(false);

    let index = repo
        .merge_commits(&head_commit, &main_commit, Some(&merge_opts))
        .with_context(|| format!("Failed to simulate merge with '{main_branch}'"))?;

    let files = if index.has_conflicts() {
        collect_conflicting_paths(&index)?
    } else {
        Vec::new()
    };

    if files.is_empty() {
        return Ok(ConflictCheck::default());
    }

    Ok(ConflictCheck {
        has_conflicts: true,
        conflicting_files: Some(files),
        conflicting_commits: Some(commits),
    })
}

fn divergent_commits(repo: &Repository, head_oid: Oid, main_oid: Oid) -> Result<ConflictingCommits> {
    Ok(ConflictingCommits {
        ours: commits_between(repo, head_oid, main_oid)?,
        theirs: commits_between(repo, main_oid, head_oid)?,
    })
}

fn commits_between(repo: &Repository, include: Oid, exclude: Oid) -> Result<Vec<CommitSummary>> {
    let mut revwalk = repo.revwalk()?;
    revwalk.push(include)?;
    revwalk.hide(exclude)?;

    let mut commits = Vec::new();
    for oid in revwalk.take(COMMIT_LIST_LIMIT) {
        let oid = oid?;
        let commit = repo.find_commit(oid)?;
        let hash = oid.to_string();
        commits.push(CommitSummary {
            short_hash: hash.chars().take(7).collect(),
            hash,
            subject: commit.summary().unwrap_or_default().to_string(),
            author: commit.author().name().unwrap_or_default().to_string(),
        });
    }
    Ok(commits)
}

fn collect_conflicting_paths(index: &git2::Index) -> Result<Vec<String>> {
    let mut seen = BTreeSet::new();
    let conflicts = index
        .conflicts()
        .with_context(|| "Failed to read merge conflicts")?;

    for conflict in conflicts {
        let conflict = conflict?;
        let path = conflict
            .our
            .as_ref()
            .and_then(index_entry_path)
            .or_else(|| conflict.their.as_ref().and_then(index_entry_path))
            .or_else(|| conflict.ancestor.as_ref().and_then(index_entry_path));
        if let Some(path) = path {
            seen.insert(path);
        }
    }

    Ok(seen.into_iter().collect())
}

fn index_entry_path(entry: &git2::IndexEntry) -> Option<String> {
    std::str::from_utf8(&entry.path)
        .ok()
        .map(|s| s.trim_end_matches(char::from(0)).to_string())
}

fn resolve_branch_oid(repo: &Repository, branch: &str) -> Result<Oid> {
    if let Ok(local) = repo.find_branch(branch, BranchType::Local)
        && let Some(oid) = local.get().target()
    {
        return Ok(oid);
    }

    let object = repo
        .revparse_single(branch)
        .with_context(|| format!("Branch '{branch}' not found"))?;
    Ok(object
        .peel_to_commit()
        .with_context(|| format!("'{branch}' does not point at a commit"))?
        .id())
}

fn is_not_fast_forwardable(output: &str) -> bool {
    let lowered = output.to_lowercase();
    lowered.contains("not possible to fast-forward")
        || lowered.contains("diverging branches")
        || lowered.contains("cannot fast-forward")
}

fn parse_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

async fn run_recorded(
    runner: &GitRunner,
    report: &mut GitOperationReport,
    args: &[&str],
) -> Result<GitOutput, GroveError> {
    match runner.run(args).await {
        Ok(output) => {
            report.record(&output.command, &output.combined());
            Ok(output)
        }
        Err(err) => {
            let mut commands = report.commands.clone();
            commands.push(format_git_command(args));
            Err(GroveError::GitCommandFailed {
                operation: report.operation.clone(),
                commands,
                output: format!("{err:#}"),
            })
        }
    }
}

async fn conflicted_files(runner: &GitRunner) -> Vec<String> {
    match runner
        .run(&["diff", "--name-only", "--diff-filter=U"])
        .await
    {
        Ok(output) if output.success() => parse_lines(&output.stdout),
        _ => Vec::new(),
    }
}

fn ensure_worktree_exists(path: &Path) -> Result<(), GroveError> {
    if path.exists() {
        Ok(())
    } else {
        Err(GroveError::WorktreeNotFound {
            path: path.display().to_string(),
        })
    }
}

fn failure(report: GitOperationReport) -> GroveError {
    GroveError::GitCommandFailed {
        operation: report.operation,
        commands: report.commands,
        output: report.output,
    }
}

impl WorktreeManager {
    pub async fn check_for_rebase_conflicts(
        &self,
        worktree_path: &Path,
        main_branch: &str,
    ) -> Result<ConflictCheck, GroveError> {
        ensure_worktree_exists(worktree_path)?;
        let path = worktree_path.to_path_buf();
        let main = main_branch.to_string();

        task::spawn_blocking(move || compute_rebase_conflicts(&path, &main))
            .await
            .map_err(|e| GroveError::git("check_for_rebase_conflicts", e))?
            .map_err(|e| GroveError::git("check_for_rebase_conflicts", format!("{e:#}")))
    }

    async fn commit_lists(&self, worktree_path: &Path, main_branch: &str) -> (Vec<String>, Vec<String>) {
        let path = worktree_path.to_path_buf();
        let main = main_branch.to_string();
        let result = task::spawn_blocking(move || -> Result<ConflictingCommits> {
            let repo = Repository::open(&path)?;
            let head = repo
                .head()?
                .target()
                .ok_or_else(|| anyhow!("HEAD has no target"))?;
            let main_oid = resolve_branch_oid(&repo, &main)?;
            divergent_commits(&repo, head, main_oid)
        })
        .await;

        let render = |commits: Vec<CommitSummary>| {
            commits
                .into_iter()
                .map(|c| format!("{} {}", c.short_hash, c.subject))
                .collect::<Vec<_>>()
        };

        match result {
            Ok(Ok(commits)) => (render(commits.ours), render(commits.theirs)),
            Ok(Err(err)) => {
                warn!("{OPERATION_LABEL}: failed to list divergent commits: {err:#}");
                (Vec::new(), Vec::new())
            }
            Err(err) => {
                warn!("{OPERATION_LABEL}: commit listing task failed: {err}");
                (Vec::new(), Vec::new())
            }
        }
    }

    /// Aborts whatever rebase is in progress and turns the failure into an error.
    async fn abort_rebase(
        &self,
        runner: &GitRunner,
        main_branch: &str,
        mut report: GitOperationReport,
        failed: &GitOutput,
    ) -> GroveError {
        let files = conflicted_files(runner).await;

        match runner.run(&["rebase", "--abort"]).await {
            Ok(output) => report.record(&output.command, &output.combined()),
            Err(err) => warn!("{OPERATION_LABEL}: git rebase --abort could not run: {err:#}"),
        }

        let head_now = runner.head_commit().await;
        if head_now != report.head_before {
            warn!(
                "{OPERATION_LABEL}: HEAD in {} is {:?} after abort, expected {:?}",
                runner.working_dir().display(),
                head_now,
                report.head_before
            );
        }

        if files.is_empty() && !failed.combined().contains("CONFLICT") {
            return failure(report);
        }

        let (ours, theirs) = self.commit_lists(runner.working_dir(), main_branch).await;
        GroveError::MergeConflict {
            files,
            ours,
            theirs,
            commands: report.commands,
            output: report.output,
        }
    }

    /// Cleans up after git itself failed mid-rebase (timeout or a failed
    /// launch). Hooks are skipped so a slow hook cannot stall the abort.
    async fn abort_interrupted_rebase(&self, runner: &GitRunner, head_before: Option<&str>) {
        match runner
            .run(&["-c", "core.hooksPath=/dev/null", "rebase", "--abort"])
            .await
        {
            Ok(output) if !output.success() => debug!(
                "{OPERATION_LABEL}: nothing to abort in {}: {}",
                runner.working_dir().display(),
                output.combined()
            ),
            Ok(_) => info!(
                "{OPERATION_LABEL}: aborted interrupted rebase in {}",
                runner.working_dir().display()
            ),
            Err(err) => warn!("{OPERATION_LABEL}: git rebase --abort could not run: {err:#}"),
        }

        let Some(expected) = head_before else {
            return;
        };
        let head_now = runner.head_commit().await;
        if head_now.as_deref() != Some(expected) {
            warn!(
                "{OPERATION_LABEL}: HEAD in {} is {head_now:?} after abort, resetting to {expected}",
                runner.working_dir().display()
            );
            self.reset_branch(runner, expected).await;
        }
    }

    /// `git rebase <main>` inside the worktree. On any failure the rebase is
    /// aborted before returning, so the worktree is never left mid-rebase.
    pub async fn rebase_main_into_worktree(
        &self,
        worktree_path: &Path,
        main_branch: &str,
    ) -> Result<GitOperationReport, GroveError> {
        ensure_worktree_exists(worktree_path)?;
        let runner = self.runner(worktree_path);
        let mut report = GitOperationReport::new("rebase");
        report.head_before = runner.head_commit().await;

        let output = match run_recorded(&runner, &mut report, &["rebase", main_branch]).await {
            Ok(output) => output,
            Err(err) => {
                self.abort_interrupted_rebase(&runner, report.head_before.as_deref())
                    .await;
                return Err(err);
            }
        };
        if !output.success() {
            return Err(self.abort_rebase(&runner, main_branch, report, &output).await);
        }

        report.head_after = runner.head_commit().await;
        report.changed = report.head_after != report.head_before;
        info!(
            "{OPERATION_LABEL}: rebased {} onto '{main_branch}'",
            worktree_path.display()
        );
        Ok(report)
    }

    async fn ensure_main_checked_out(
        &self,
        project: &GitRunner,
        main_branch: &str,
        operation: &str,
    ) -> Result<(), GroveError> {
        match project.current_branch().await {
            Some(branch) if branch == main_branch => Ok(()),
            other => Err(GroveError::git(
                operation,
                format!(
                    "'{main_branch}' must be checked out in {} (found {})",
                    project.working_dir().display(),
                    other.unwrap_or_else(|| "a detached HEAD".to_string())
                ),
            )),
        }
    }

    async fn commits_ahead(&self, runner: &GitRunner, main_branch: &str) -> Result<u64, GroveError> {
        let range = format!("{main_branch}..HEAD");
        let output = runner
            .run_checked("rev-list", &["rev-list", "--count", &range])
            .await?;
        Ok(output.stdout.trim().parse::<u64>().unwrap_or(0))
    }

    async fn worktree_branch(&self, runner: &GitRunner, operation: &str) -> Result<String, GroveError> {
        runner
            .current_branch()
            .await
            .ok_or_else(|| GroveError::git(operation, "worktree is on a detached HEAD"))
    }

    async fn reset_branch(&self, runner: &GitRunner, original_head: &str) -> Option<GitOutput> {
        match runner.run(&["reset", "--hard", original_head]).await {
            Ok(output) => {
                if !output.success() {
                    warn!(
                        "{OPERATION_LABEL}: failed to restore {} to {original_head}: {}",
                        runner.working_dir().display(),
                        output.combined()
                    );
                }
                Some(output)
            }
            Err(err) => {
                warn!("{OPERATION_LABEL}: restore could not run: {err:#}");
                None
            }
        }
    }

    /// Resets the worktree branch to `original_head` and reports the failure.
    async fn restore_branch(
        &self,
        runner: &GitRunner,
        original_head: &str,
        mut report: GitOperationReport,
    ) -> GroveError {
        if let Some(output) = self.reset_branch(runner, original_head).await {
            report.record(&output.command, &output.combined());
        }
        failure(report)
    }

    /// Passes `result` through, resetting the worktree branch to
    /// `original_head` first when git could not run.
    async fn or_restore<T>(
        &self,
        result: Result<T, GroveError>,
        runner: &GitRunner,
        original_head: &str,
    ) -> Result<T, GroveError> {
        if result.is_err() {
            self.reset_branch(runner, original_head).await;
        }
        result
    }

    /// Collapses the worktree branch into one commit on top of `main_branch`
    /// and fast-forwards main to it.
    pub async fn squash_and_merge_worktree_to_main(
        &self,
        project_path: &Path,
        worktree_path: &Path,
        main_branch: &str,
        commit_message: &str,
    ) -> Result<GitOperationReport, GroveError> {
        const OP: &str = "squash_merge";
        if commit_message.trim().is_empty() {
            return Err(GroveError::invalid_input(
                "commit_message",
                "a squash merge needs a commit message",
            ));
        }
        ensure_worktree_exists(worktree_path)?;

        let project = self.runner(project_path);
        let worktree = self.runner(worktree_path);
        self.ensure_main_checked_out(&project, main_branch, OP).await?;
        let branch = self.worktree_branch(&worktree, OP).await?;

        if self.diff.has_changes(worktree_path).await? {
            return Err(GroveError::git(
                OP,
                format!(
                    "worktree {} has uncommitted changes; commit or discard them first",
                    worktree_path.display()
                ),
            ));
        }

        let mut report = GitOperationReport::new(OP);
        let original_head = worktree
            .head_commit()
            .await
            .ok_or_else(|| GroveError::git(OP, "worktree has no commits"))?;
        report.head_before = project.head_commit().await;

        if self.commits_ahead(&worktree, main_branch).await? == 0 {
            info!("{OPERATION_LABEL}: branch '{branch}' has nothing to merge into '{main_branch}'");
            report.head_after = report.head_before.clone();
            return Ok(report);
        }

        let rebase = match run_recorded(&worktree, &mut report, &["rebase", main_branch]).await {
            Ok(output) => output,
            Err(err) => {
                self.abort_interrupted_rebase(&worktree, Some(&original_head))
                    .await;
                return Err(err);
            }
        };
        if !rebase.success() {
            let worktree_head = Some(original_head.clone());
            let mut rebase_report = report;
            rebase_report.head_before = worktree_head;
            return Err(self
                .abort_rebase(&worktree, main_branch, rebase_report, &rebase)
                .await);
        }

        let ahead = self.commits_ahead(&worktree, main_branch).await;
        if self.or_restore(ahead, &worktree, &original_head).await? == 0 {
            info!("{OPERATION_LABEL}: '{branch}' is already contained in '{main_branch}'");
            report.head_after = report.head_before.clone();
            return Ok(report);
        }

        let reset = run_recorded(&worktree, &mut report, &["reset", "--soft", main_branch]).await;
        let reset = self.or_restore(reset, &worktree, &original_head).await?;
        if !reset.success() {
            return Err(self.restore_branch(&worktree, &original_head, report).await);
        }

        let commit = run_recorded(&worktree, &mut report, &["commit", "-m", commit_message]).await;
        let commit = self.or_restore(commit, &worktree, &original_head).await?;
        if !commit.success() {
            return Err(self.restore_branch(&worktree, &original_head, report).await);
        }

        let merge = run_recorded(&project, &mut report, &["merge", &branch, "--ff-only"]).await;
        let merge = self.or_restore(merge, &worktree, &original_head).await?;
        if !merge.success() {
            return Err(self.restore_branch(&worktree, &original_head, report).await);
        }

        report.head_after = project.head_commit().await;
        report.changed = true;
        info!(
            "{OPERATION_LABEL}: squashed '{branch}' into '{main_branch}' at {:?}",
            report.head_after
        );
        Ok(report)
    }

    /// Merges the worktree branch into `main_branch`, fast-forwarding when
    /// possible and otherwise creating a merge commit that keeps history.
    pub async fn merge_worktree_to_main(
        &self,
        project_path: &Path,
        worktree_path: &Path,
        main_branch: &str,
    ) -> Result<GitOperationReport, GroveError> {
        const OP: &str = "merge";
        ensure_worktree_exists(worktree_path)?;

        let project = self.runner(project_path);
        let worktree = self.runner(worktree_path);
        self.ensure_main_checked_out(&project, main_branch, OP).await?;
        let branch = self.worktree_branch(&worktree, OP).await?;

        let mut report = GitOperationReport::new(OP);
        report.head_before = project.head_commit().await;

        if self.commits_ahead(&worktree, main_branch).await? == 0 {
            info!("{OPERATION_LABEL}: branch '{branch}' has nothing to merge into '{main_branch}'");
            report.head_after = report.head_before.clone();
            return Ok(report);
        }

        let fast_forward = run_recorded(&project, &mut report, &["merge", &branch, "--ff-only"]).await?;
        if fast_forward.success() {
            report.head_after = project.head_commit().await;
            report.changed = true;
            info!("{OPERATION_LABEL}: fast-forwarded '{main_branch}' to '{branch}'");
            return Ok(report);
        }

        if !is_not_fast_forwardable(&fast_forward.combined()) {
            return Err(failure(report));
        }

        let merge = run_recorded(
            &project,
            &mut report,
            &["merge", "--no-ff", "--no-edit", &branch],
        )
        .await?;
        if merge.success() {
            report.head_after = project.head_commit().await;
            report.changed = true;
            info!("{OPERATION_LABEL}: merged '{branch}' into '{main_branch}' with a merge commit");
            return Ok(report);
        }

        let files = conflicted_files(&project).await;
        match project.run(&["merge", "--abort"]).await {
            Ok(output) => report.record(&output.command, &output.combined()),
            Err(err) => warn!("{OPERATION_LABEL}: git merge --abort could not run: {err:#}"),
        }

        if files.is_empty() && !merge.combined().contains("CONFLICT") {
            return Err(failure(report));
        }

        let (ours, theirs) = self.commit_lists(worktree_path, main_branch).await;
        Err(GroveError::MergeConflict {
            files,
            ours,
            theirs,
            commands: report.commands,
            output: report.output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::git::command::test_support::{commit_file, git, init_repo};
    use crate::domains::git::worktrees::WorktreeLayout;
    use serial_test::serial;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn setup(temp: &TempDir) -> (WorktreeManager, PathBuf, PathBuf) {
        let repo = temp.path().join("repo");
        init_repo(&repo);
        let manager = WorktreeManager::new(repo.clone(), WorktreeLayout::default());
        let worktree = manager.create_worktree("feature").await.unwrap();
        (manager, repo, worktree)
    }

    fn create_conflict(repo: &Path, worktree: &Path) {
        commit_file(worktree, "README.md", "session version\n", "session edit");
        commit_file(repo, "README.md", "main version\n", "main edit");
    }

    #[tokio::test]
    #[serial]
    async fn no_divergence_reports_no_conflicts() {
        let temp = TempDir::new().unwrap();
        let (manager, _repo, worktree) = setup(&temp).await;

        let check = manager
            .check_for_rebase_conflicts(&worktree, "main")
            .await
            .unwrap();
        assert!(!check.has_conflicts);
        assert!(check.conflicting_files.is_none());

        commit_file(&worktree, "src/lib.rs", "pub fn a() {}\n", "session work");
        let check = manager
            .check_for_rebase_conflicts(&worktree, "main")
            .await
            .unwrap();
        assert!(!check.has_conflicts);
    }

    #[tokio::test]
    #[serial]
    async fn divergent_edits_to_same_file_are_reported() {
        let temp = TempDir::new().unwrap();
        let (manager, repo, worktree) = setup(&temp).await;
        create_conflict(&repo, &worktree);
        let head_before = git(&worktree, &["rev-parse", "HEAD"]);

        let check = manager
            .check_for_rebase_conflicts(&worktree, "main")
            .await
            .unwrap();

        assert!(check.has_conflicts);
        assert_eq!(check.conflicting_files, Some(vec!["README.md".to_string()]));
        let commits = check.conflicting_commits.unwrap();
        assert_eq!(commits.ours.len(), 1);
        assert_eq!(commits.ours[0].subject, "session edit");
        assert_eq!(commits.theirs.len(), 1);
        assert_eq!(commits.theirs[0].subject, "main edit");
        assert_eq!(git(&worktree, &["rev-parse", "HEAD"]), head_before);
    }

    #[tokio::test]
    #[serial]
    async fn divergent_but_disjoint_edits_do_not_conflict() {
        let temp = TempDir::new().unwrap();
        let (manager, repo, worktree) = setup(&temp).await;
        commit_file(&worktree, "a.txt", "a\n", "session file");
        commit_file(&repo, "b.txt", "b\n", "main file");

        let check = manager
            .check_for_rebase_conflicts(&worktree, "main")
            .await
            .unwrap();
        assert!(!check.has_conflicts);
    }

    #[tokio::test]
    #[serial]
    async fn conflicting_rebase_aborts_and_keeps_head() {
        let temp = TempDir::new().unwrap();
        let (manager, repo, worktree) = setup(&temp).await;
        create_conflict(&repo, &worktree);
        let head_before = git(&worktree, &["rev-parse", "HEAD"]);

        let err = manager
            .rebase_main_into_worktree(&worktree, "main")
            .await
            .unwrap_err();

        match err {
            GroveError::MergeConflict {
                files,
                commands,
                ours,
                theirs,
                ..
            } => {
                assert_eq!(files, vec!["README.md".to_string()]);
                assert_eq!(commands[0], "git rebase main");
                assert!(commands.iter().any(|c| c == "git rebase --abort"));
                assert_eq!(ours.len(), 1);
                assert_eq!(theirs.len(), 1);
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        assert_eq!(git(&worktree, &["rev-parse", "HEAD"]), head_before);
        let status = git(&worktree, &["status"]);
        assert!(!status.contains("rebase in progress"), "{status}");
        assert_eq!(
            std::fs::read_to_string(worktree.join("README.md")).unwrap(),
            "session version\n"
        );
    }

    #[tokio::test]
    #[serial]
    async fn clean_rebase_picks_up_main_commits() {
        let temp = TempDir::new().unwrap();
        let (manager, repo, worktree) = setup(&temp).await;
        commit_file(&worktree, "a.txt", "a\n", "session file");
        commit_file(&repo, "b.txt", "b\n", "main file");

        let report = manager
            .rebase_main_into_worktree(&worktree, "main")
            .await
            .unwrap();
        assert!(report.changed);
        assert_eq!(report.commands, vec!["git rebase main".to_string()]);
        assert!(worktree.join("b.txt").exists());
        assert!(worktree.join("a.txt").exists());
    }

    #[cfg(unix)]
    fn install_hook(repo: &Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let hooks = repo.join(".git").join("hooks");
        std::fs::create_dir_all(&hooks).unwrap();
        let hook = hooks.join(name);
        std::fs::write(&hook, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn timed_out_rebase_is_aborted() {
        let temp = TempDir::new().unwrap();
        let (_manager, repo, worktree) = setup(&temp).await;
        commit_file(&worktree, "a.txt", "a\n", "session file");
        commit_file(&repo, "b.txt", "b\n", "main file");
        let head_before = git(&worktree, &["rev-parse", "HEAD"]);
        install_hook(&repo, "post-checkout", "sleep 4");
        let manager = WorktreeManager::new(repo.clone(), WorktreeLayout::default())
            .with_timeout(Duration::from_secs(2));

        let err = manager
            .rebase_main_into_worktree(&worktree, "main")
            .await
            .unwrap_err();
        assert!(matches!(err, GroveError::GitCommandFailed { .. }), "{err:?}");

        let rebase_dir = worktree.join(git(&worktree, &["rev-parse", "--git-path", "rebase-merge"]));
        assert!(!rebase_dir.exists(), "worktree left mid-rebase");
        assert_eq!(git(&worktree, &["rev-parse", "HEAD"]), head_before);
        assert_eq!(git(&worktree, &["rev-parse", "--abbrev-ref", "HEAD"]), "feature");
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn squash_merge_restores_branch_when_git_times_out() {
        let temp = TempDir::new().unwrap();
        let (_manager, repo, worktree) = setup(&temp).await;
        commit_file(&worktree, "a.txt", "a\n", "first");
        let original_head = commit_file(&worktree, "b.txt", "b\n", "second");
        let main_before = git(&repo, &["rev-parse", "HEAD"]);
        install_hook(&repo, "post-commit", "sleep 4");
        let manager = WorktreeManager::new(repo.clone(), WorktreeLayout::default())
            .with_timeout(Duration::from_secs(2));

        let err = manager
            .squash_and_merge_worktree_to_main(&repo, &worktree, "main", "Squashed")
            .await
            .unwrap_err();
        match err {
            GroveError::GitCommandFailed { commands, .. } => {
                assert_eq!(commands.last().unwrap(), "git commit -m Squashed");
            }
            other => panic!("expected git failure, got {other:?}"),
        }

        assert_eq!(git(&worktree, &["rev-parse", "HEAD"]), original_head);
        assert_eq!(git(&worktree, &["status", "--porcelain"]), "");
        assert_eq!(git(&repo, &["rev-parse", "HEAD"]), main_before);
    }

    #[tokio::test]
    #[serial]
    async fn squash_merge_creates_single_commit_on_main() {
        let temp = TempDir::new().unwrap();
        let (manager, repo, worktree) = setup(&temp).await;
        commit_file(&worktree, "a.txt", "a\n", "first");
        commit_file(&worktree, "b.txt", "b\n", "second");
        let main_before = git(&repo, &["rev-parse", "HEAD"]);

        let report = manager
            .squash_and_merge_worktree_to_main(&repo, &worktree, "main", "Add a and b")
            .await
            .unwrap();

        assert!(report.changed);
        assert_eq!(
            report.commands,
            vec![
                "git rebase main".to_string(),
                "git reset --soft main".to_string(),
                "git commit -m 'Add a and b'".to_string(),
                "git merge feature --ff-only".to_string(),
            ]
        );
        assert_eq!(git(&repo, &["log", "-1", "--format=%s"]), "Add a and b");
        assert_eq!(git(&repo, &["rev-parse", "HEAD~1"]), main_before);
        assert!(repo.join("a.txt").exists());
        assert!(repo.join("b.txt").exists());
    }

    #[tokio::test]
    #[serial]
    async fn squash_merge_conflict_leaves_everything_untouched() {
        let temp = TempDir::new().unwrap();
        let (manager, repo, worktree) = setup(&temp).await;
        create_conflict(&repo, &worktree);
        let main_before = git(&repo, &["rev-parse", "HEAD"]);
        let worktree_before = git(&worktree, &["rev-parse", "HEAD"]);

        let err = manager
            .squash_and_merge_worktree_to_main(&repo, &worktree, "main", "squash")
            .await
            .unwrap_err();
        assert!(matches!(err, GroveError::MergeConflict { .. }));
        assert_eq!(git(&repo, &["rev-parse", "HEAD"]), main_before);
        assert_eq!(git(&worktree, &["rev-parse", "HEAD"]), worktree_before);
    }

    #[tokio::test]
    #[serial]
    async fn squash_merge_rejects_dirty_worktree_and_empty_message() {
        let temp = TempDir::new().unwrap();
        let (manager, repo, worktree) = setup(&temp).await;
        commit_file(&worktree, "a.txt", "a\n", "first");

        let err = manager
            .squash_and_merge_worktree_to_main(&repo, &worktree, "main", "  ")
            .await
            .unwrap_err();
        assert!(matches!(err, GroveError::InvalidInput { .. }));

        std::fs::write(worktree.join("a.txt"), "dirty\n").unwrap();
        let err = manager
            .squash_and_merge_worktree_to_main(&repo, &worktree, "main", "msg")
            .await
            .unwrap_err();
        assert!(matches!(err, GroveError::GitOperationFailed { .. }));
    }

    #[tokio::test]
    #[serial]
    async fn merge_fast_forwards_when_possible() {
        let temp = TempDir::new().unwrap();
        let (manager, repo, worktree) = setup(&temp).await;
        let session_head = commit_file(&worktree, "a.txt", "a\n", "session work");

        let report = manager
            .merge_worktree_to_main(&repo, &worktree, "main")
            .await
            .unwrap();
        assert!(report.changed);
        assert_eq!(report.commands, vec!["git merge feature --ff-only".to_string()]);
        assert_eq!(git(&repo, &["rev-parse", "HEAD"]), session_head);
    }

    #[tokio::test]
    #[serial]
    async fn merge_falls_back_to_merge_commit_on_divergence() {
        let temp = TempDir::new().unwrap();
        let (manager, repo, worktree) = setup(&temp).await;
        commit_file(&worktree, "a.txt", "a\n", "session work");
        commit_file(&repo, "b.txt", "b\n", "main work");

        let report = manager
            .merge_worktree_to_main(&repo, &worktree, "main")
            .await
            .unwrap();
        assert_eq!(report.commands.len(), 2);
        let parents = git(&repo, &["log", "-1", "--format=%P"]);
        assert_eq!(parents.split_whitespace().count(), 2);
        assert!(repo.join("a.txt").exists());
    }

    #[tokio::test]
    #[serial]
    async fn conflicting_merge_is_aborted() {
        let temp = TempDir::new().unwrap();
        let (manager, repo, worktree) = setup(&temp).await;
        create_conflict(&repo, &worktree);
        let main_before = git(&repo, &["rev-parse", "HEAD"]);

        let err = manager
            .merge_worktree_to_main(&repo, &worktree, "main")
            .await
            .unwrap_err();
        match err {
            GroveError::MergeConflict {
                files, commands, ..
            } => {
                assert_eq!(files, vec!["README.md".to_string()]);
                assert!(commands.iter().any(|c| c == "git merge --abort"));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(git(&repo, &["rev-parse", "HEAD"]), main_before);
        assert!(!repo.join(".git/MERGE_HEAD").exists());
    }

    #[tokio::test]
    #[serial]
    async fn missing_worktree_is_not_found() {
        let temp = TempDir::new().unwrap();
        let (manager, _repo, _worktree) = setup(&temp).await;
        let err = manager
            .rebase_main_into_worktree(&temp.path().join("nope"), "main")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
