use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

fn default_worktrees_dir() -> String {
    "worktrees".to_string()
}

fn default_main_branch() -> String {
    "main".to_string()
}

fn default_remote_name() -> String {
    "origin".to_string()
}

fn default_history_limit() -> usize {
    20
}

fn default_git_timeout_secs() -> u64 {
    180
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec![
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ]
}

fn default_prompt_flag() -> String {
    "-p".to_string()
}

fn default_resume_flag() -> String {
    "--resume".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    #[serde(default = "default_prompt_flag")]
    pub prompt_flag: String,
    #[serde(default = "default_resume_flag")]
    pub resume_flag: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
            prompt_flag: default_prompt_flag(),
            resume_flag: default_resume_flag(),
            env: HashMap::new(),
        }
    }
}

/// One entry of a project's run-command sequence.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RunCommand {
    #[serde(default)]
    pub name: Option<String>,
    pub command: String,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl RunCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            name: None,
            command: command.into(),
            working_directory: None,
            env: HashMap::new(),
        }
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.command)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GroveSettings {
    #[serde(default = "default_worktrees_dir")]
    pub worktrees_dir: String,
    #[serde(default)]
    pub branch_prefix: String,
    #[serde(default = "default_main_branch")]
    pub main_branch: String,
    #[serde(default = "default_remote_name")]
    pub remote_name: String,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_git_timeout_secs")]
    pub git_timeout_secs: u64,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub run_commands: Vec<RunCommand>,
}

impl Default for GroveSettings {
    fn default() -> Self {
        Self {
            worktrees_dir: default_worktrees_dir(),
            branch_prefix: String::new(),
            main_branch: default_main_branch(),
            remote_name: default_remote_name(),
            history_limit: default_history_limit(),
            git_timeout_secs: default_git_timeout_secs(),
            agent: AgentSettings::default(),
            run_commands: Vec::new(),
        }
    }
}

impl GroveSettings {
    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs.max(1))
    }
}
