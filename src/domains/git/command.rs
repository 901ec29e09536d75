use anyhow::{Context, Result, anyhow};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::errors::GroveError;

pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(180);

/// Hash of the empty tree, used to diff against "nothing" when a commit has no parent.
pub const EMPTY_TREE_HASH: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// Captured result of one git invocation, kept verbatim for diagnostics.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stderr and stdout joined, in that order, without surrounding whitespace.
    pub fn combined(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        match (stderr.is_empty(), stdout.is_empty()) {
            (true, _) => stdout.to_string(),
            (false, true) => stderr.to_string(),
            (false, false) => format!("{stderr}\n{stdout}"),
        }
    }

    pub fn into_error(self, operation: &str) -> GroveError {
        GroveError::GitCommandFailed {
            operation: operation.to_string(),
            output: self.combined(),
            commands: vec![self.command],
        }
    }
}

pub fn format_git_command(args: &[&str]) -> String {
    format!("git {}", shell_words::join(args))
}

#[derive(Debug, Clone)]
pub struct GitRunner {
    working_dir: PathBuf,
    timeout: Duration,
}

impl GitRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_dir(&self, dir: &Path) -> Self {
        Self {
            working_dir: dir.to_path_buf(),
            timeout: self.timeout,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Runs git and returns its output whatever the exit status. Only a failure to
    /// launch git or a timeout is an error here.
    pub async fn run(&self, args: &[&str]) -> Result<GitOutput> {
        let command = format_git_command(args);
        debug!(
            "Running {command} in {}",
            self.working_dir.display()
        );

        let child = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_EDITOR", "true")
            .kill_on_drop(true)
            .output();

        let output = timeout(self.timeout, child)
            .await
            .map_err(|_| {
                anyhow!(
                    "{command} timed out after {}s in {}",
                    self.timeout.as_secs(),
                    self.working_dir.display()
                )
            })?
            .with_context(|| format!("Failed to execute {command}"))?;

        let result = GitOutput {
            command,
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() {
            debug!(
                "{} exited with {:?}: {}",
                result.command,
                result.exit_code,
                result.stderr.trim()
            );
        }

        Ok(result)
    }

    /// Like [`GitRunner::run`] but a non-zero exit becomes a [`GroveError::GitCommandFailed`].
    pub async fn run_checked(&self, operation: &str, args: &[&str]) -> Result<GitOutput, GroveError> {
        let output = self.run(args).await.map_err(|err| GroveError::GitCommandFailed {
            operation: operation.to_string(),
            commands: vec![format_git_command(args)],
            output: format!("{err:#}"),
        })?;

        if output.success() {
            Ok(output)
        } else {
            warn!(
                "{operation}: {} failed in {}: {}",
                output.command,
                self.working_dir.display(),
                output.combined()
            );
            Err(output.into_error(operation))
        }
    }

    /// Best-effort variant for cleanup paths; failures are logged and swallowed.
    pub async fn run_quiet(&self, args: &[&str]) -> Option<GitOutput> {
        match self.run(args).await {
            Ok(output) => Some(output),
            Err(err) => {
                warn!("{err:#}");
                None
            }
        }
    }

    pub async fn rev_parse(&self, rev: &str) -> Option<String> {
        let output = self.run(&["rev-parse", "--verify", "--quiet", rev]).await.ok()?;
        if output.success() {
            let hash = output.stdout.trim();
            (!hash.is_empty()).then(|| hash.to_string())
        } else {
            None
        }
    }

    pub async fn head_commit(&self) -> Option<String> {
        self.rev_parse("HEAD").await
    }

    pub async fn current_branch(&self) -> Option<String> {
        let output = self
            .run(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .ok()?;
        let branch = output.stdout.trim();
        (output.success() && !branch.is_empty() && branch != "HEAD").then(|| branch.to_string())
    }

    pub async fn branch_exists(&self, branch: &str) -> bool {
        self.rev_parse(&format!("refs/heads/{branch}")).await.is_some()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::process::Command as StdCommand;

    pub fn git(dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("failed to spawn git");
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    pub fn init_repo(path: &Path) {
        std::fs::create_dir_all(path).unwrap();
        git(path, &["init"]);
        git(path, &["config", "user.email", "test@example.com"]);
        git(path, &["config", "user.name", "Test User"]);
        git(path, &["config", "commit.gpgsign", "false"]);
        std::fs::write(path.join("README.md"), "initial\n").unwrap();
        git(path, &["add", "README.md"]);
        git(path, &["commit", "-m", "Initial commit"]);
        git(path, &["branch", "-M", "main"]);
    }

    pub fn commit_file(dir: &Path, name: &str, contents: &str, message: &str) -> String {
        let file_path = dir.join(name);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(file_path, contents).unwrap();
        git(dir, &["add", "--", name]);
        git(dir, &["commit", "-m", message]);
        git(dir, &["rev-parse", "HEAD"])
    }
}
