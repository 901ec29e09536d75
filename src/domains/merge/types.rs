use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub hash: String,
    pub short_hash: String,
    pub subject: String,
    pub author: String,
}

/// Commits unique to each side of a divergence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictingCommits {
    pub ours: Vec<CommitSummary>,
    pub theirs: Vec<CommitSummary>,
}

/// Result of a dry conflict check; never mutates the worktree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictCheck {
    pub has_conflicts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicting_files: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicting_commits: Option<ConflictingCommits>,
}

/// What a reconciliation ran and what git said, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitOperationReport {
    pub operation: String,
    pub commands: Vec<String>,
    pub output: String,
    pub head_before: Option<String>,
    pub head_after: Option<String>,
    pub changed: bool,
}

impl GitOperationReport {
    pub(crate) fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn record(&mut self, command: &str, output: &str) {
        self.commands.push(command.to_string());
        let output = output.trim();
        if !output.is_empty() {
            if !self.output.is_empty() {
                self.output.push('\n');
            }
            self.output.push_str(output);
        }
    }
}
