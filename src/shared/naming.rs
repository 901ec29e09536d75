/// Fallback used when a requested name sanitises to nothing.
pub const DEFAULT_SESSION_NAME: &str = "session";

const MAX_NAME_LEN: usize = 30;

/// Lowercases, replaces anything outside `[a-z0-9]` with `-`, collapses runs of
/// dashes, trims them from both ends and caps the result at 30 characters.
pub fn sanitize_name(input: &str) -> String {
    let mut collapsed = String::with_capacity(input.len());
    let mut prev_hyphen = false;
    for ch in input.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            collapsed.push(ch);
            prev_hyphen = false;
        } else {
            if !prev_hyphen {
                collapsed.push('-');
            }
            prev_hyphen = true;
        }
    }
    let trimmed: String = collapsed
        .trim_matches('-')
        .chars()
        .take(MAX_NAME_LEN)
        .collect();
    trimmed.trim_end_matches('-').to_string()
}

/// Like [`sanitize_name`] but never empty.
pub fn sanitize_or_default(input: &str) -> String {
    let sanitized = sanitize_name(input);
    if sanitized.is_empty() {
        DEFAULT_SESSION_NAME.to_string()
    } else {
        sanitized
    }
}

pub fn format_branch_name(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim().trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Git's refname rules, reduced to the cases a sanitised name can still hit.
pub fn validate_branch_name(branch: &str) -> Result<(), String> {
    if branch.is_empty() {
        return Err("Branch name cannot be empty".to_string());
    }
    if branch.starts_with('-') || branch.starts_with('/') || branch.ends_with('/') {
        return Err(format!("Branch name '{branch}' has an invalid leading or trailing character"));
    }
    if branch.contains("..") || branch.contains("//") || branch.ends_with(".lock") {
        return Err(format!("Branch name '{branch}' contains an invalid sequence"));
    }
    if branch
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return Err(format!("Branch name '{branch}' contains invalid characters"));
    }
    Ok(())
}
