pub mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE_NAME: &str = "grove.toml";

impl GroveSettings {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse grove settings")
    }

    /// Reads settings from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents)
                .with_context(|| format!("Invalid settings file {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::debug!(
                    "No settings file at {}; using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(err) => {
                Err(err).with_context(|| format!("Failed to read settings file {}", path.display()))
            }
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize grove settings")
    }
}

/// Per-user settings location, e.g. `~/.config/grove/grove.toml`.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("grove").join(SETTINGS_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_document_uses_defaults() {
        let settings = GroveSettings::from_toml_str("").unwrap();
        assert_eq!(settings, GroveSettings::default());
        assert_eq!(settings.worktrees_dir, "worktrees");
        assert_eq!(settings.main_branch, "main");
        assert_eq!(settings.agent.command, "claude");
    }

    #[test]
    fn parses_run_commands_and_agent_overrides() {
        let settings = GroveSettings::from_toml_str(
            r#"
            main_branch = "trunk"

            [agent]
            command = "my-agent"
            args = ["--json"]

            [[run_commands]]
            name = "install"
            command = "npm install"

            [[run_commands]]
            command = "npm run dev"
            working_directory = "web"
            "#,
        )
        .unwrap();

        assert_eq!(settings.main_branch, "trunk");
        assert_eq!(settings.agent.command, "my-agent");
        assert_eq!(settings.agent.args, vec!["--json".to_string()]);
        assert_eq!(settings.agent.prompt_flag, "-p");
        assert_eq!(settings.run_commands.len(), 2);
        assert_eq!(settings.run_commands[0].label(), "install");
        assert_eq!(settings.run_commands[1].label(), "npm run dev");
        assert_eq!(
            settings.run_commands[1].working_directory,
            Some(PathBuf::from("web"))
        );
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let temp = TempDir::new().unwrap();
        let settings = GroveSettings::load(&temp.path().join("missing.toml")).unwrap();
        assert_eq!(settings, GroveSettings::default());
    }

    #[test]
    fn load_round_trips_written_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(SETTINGS_FILE_NAME);
        let mut settings = GroveSettings::default();
        settings.branch_prefix = "grove".to_string();
        std::fs::write(&path, settings.to_toml_string().unwrap()).unwrap();

        let loaded = GroveSettings::load(&path).unwrap();
        assert_eq!(loaded.branch_prefix, "grove");
    }
}
