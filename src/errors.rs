use serde::Serialize;
use std::fmt;

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum GroveError {
    SessionNotFound {
        session_id: String,
    },
    WorktreeNotFound {
        path: String,
    },
    ExecutionNotFound {
        session_id: String,
    },
    ProcessNotFound {
        session_id: String,
    },
    ProcessFailure {
        session_id: String,
        exit_code: Option<i32>,
        signal: Option<String>,
        last_output: Vec<String>,
    },
    GitCommandFailed {
        operation: String,
        commands: Vec<String>,
        output: String,
    },
    GitOperationFailed {
        operation: String,
        message: String,
    },
    MergeConflict {
        files: Vec<String>,
        ours: Vec<String>,
        theirs: Vec<String>,
        commands: Vec<String>,
        output: String,
    },
    InvalidSessionState {
        session_id: String,
        current_state: String,
        expected_state: String,
    },
    InvalidInput {
        field: String,
        message: String,
    },
    NameCollision {
        name: String,
        attempts: u32,
    },
    ScriptFailed {
        command: String,
        index: usize,
        exit_code: Option<i32>,
    },
    DatabaseError {
        message: String,
    },
    IoError {
        operation: String,
        path: String,
        message: String,
    },
}

impl GroveError {
    pub fn from_session_lookup(session_id: &str, error: impl ToString) -> Self {
        let message = error.to_string();
        let normalized = message.to_lowercase();
        if normalized.contains("query returned no rows") || normalized.contains("session not found")
        {
            GroveError::SessionNotFound {
                session_id: session_id.to_string(),
            }
        } else {
            GroveError::DatabaseError { message }
        }
    }

    pub fn git(operation: &str, error: impl ToString) -> Self {
        GroveError::GitOperationFailed {
            operation: operation.to_string(),
            message: error.to_string(),
        }
    }

    pub fn io(operation: &str, path: impl ToString, error: impl ToString) -> Self {
        GroveError::IoError {
            operation: operation.to_string(),
            path: path.to_string(),
            message: error.to_string(),
        }
    }

    pub fn invalid_input(field: &str, message: impl ToString) -> Self {
        GroveError::InvalidInput {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub fn database(error: impl ToString) -> Self {
        GroveError::DatabaseError {
            message: error.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound { .. }
                | Self::WorktreeNotFound { .. }
                | Self::ExecutionNotFound { .. }
                | Self::ProcessNotFound { .. }
        )
    }
}

impl fmt::Display for GroveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::SessionNotFound { session_id } => {
                write!(f, "Session '{session_id}' not found")
            }
            Self::WorktreeNotFound { path } => {
                write!(f, "Worktree not found at path: {path}")
            }
            Self::ExecutionNotFound { session_id } => {
                write!(f, "No execution in flight for session '{session_id}'")
            }
            Self::ProcessNotFound { session_id } => {
                write!(f, "Process not found for session '{session_id}'")
            }
            Self::ProcessFailure {
                session_id,
                exit_code,
                signal,
                last_output,
            } => {
                write!(f, "Process for session '{session_id}' failed")?;
                if let Some(code) = exit_code {
                    write!(f, " with exit code {code}")?;
                }
                if let Some(signal) = signal {
                    write!(f, " (signal {signal})")?;
                }
                if !last_output.is_empty() {
                    write!(f, "; last output:\n{}", last_output.join("\n"))?;
                }
                Ok(())
            }
            Self::GitCommandFailed {
                operation,
                commands,
                output,
            } => {
                write!(
                    f,
                    "Git operation '{operation}' failed.\nCommands: {}\nOutput: {output}",
                    commands.join(" && ")
                )
            }
            Self::GitOperationFailed { operation, message } => {
                write!(f, "Git operation '{operation}' failed: {message}")
            }
            Self::MergeConflict {
                files,
                commands,
                output,
                ..
            } => {
                write!(f, "Merge conflict in {} file(s)", files.len())?;
                if !files.is_empty() {
                    write!(f, " ({})", files.join(", "))?;
                }
                write!(f, ".\nCommands: {}\nOutput: {output}", commands.join(" && "))
            }
            Self::InvalidSessionState {
                session_id,
                current_state,
                expected_state,
            } => {
                write!(
                    f,
                    "Session '{session_id}' is in state '{current_state}', expected '{expected_state}'"
                )
            }
            Self::InvalidInput { field, message } => {
                write!(f, "Invalid input for field '{field}': {message}")
            }
            Self::NameCollision { name, attempts } => {
                write!(
                    f,
                    "Unable to allocate a worktree for '{name}' after {attempts} attempts"
                )
            }
            Self::ScriptFailed {
                command,
                index,
                exit_code,
            } => match exit_code {
                Some(code) => write!(
                    f,
                    "Run command #{} '{command}' exited with code {code}",
                    index + 1
                ),
                None => write!(
                    f,
                    "Run command #{} '{command}' was terminated by a signal",
                    index + 1
                ),
            },
            Self::DatabaseError { message } => {
                write!(f, "Database error: {message}")
            }
            Self::IoError {
                operation,
                path,
                message,
            } => {
                write!(f, "I/O error during '{operation}' on '{path}': {message}")
            }
        }
    }
}

impl std::error::Error for GroveError {}

impl From<GroveError> for String {
    fn from(error: GroveError) -> Self {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_lookup_maps_missing_rows_to_not_found() {
        let err = GroveError::from_session_lookup("abc", "Query returned no rows");
        assert_eq!(
            err,
            GroveError::SessionNotFound {
                session_id: "abc".to_string()
            }
        );
        assert!(err.is_not_found());

        let err = GroveError::from_session_lookup("abc", "disk I/O error");
        assert!(matches!(err, GroveError::DatabaseError { .. }));
    }

    #[test]
    fn git_command_failure_includes_commands_and_output() {
        let err = GroveError::GitCommandFailed {
            operation: "merge".to_string(),
            commands: vec!["git merge feature --ff-only".to_string()],
            output: "fatal: Not possible to fast-forward, aborting.".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("git merge feature --ff-only"));
        assert!(rendered.contains("Not possible to fast-forward"));
    }

    #[test]
    fn serializes_with_tag_and_content() {
        let err = GroveError::ProcessNotFound {
            session_id: "s1".to_string(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "ProcessNotFound");
        assert_eq!(json["data"]["session_id"], "s1");
    }
}
