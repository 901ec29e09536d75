use once_cell::sync::Lazy;
use regex::Regex;

use super::entity::PromptMarker;

static PROMPT_ECHO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:>|Human:|User:)\s+(?P<text>\S.*?)\s*$").expect("valid regex")
});

const MAX_PROMPT_LEN: usize = 2000;

/// Text recovered from a line that echoes user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptText(pub String);

impl PromptText {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn strip_ansi_codes(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                for ch in chars.by_ref() {
                    if ch.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}

/// Best-effort: `None` for anything that does not look like a prompt echo.
pub fn extract_prompt_text(line: &str) -> Option<PromptText> {
    let clean = strip_ansi_codes(line);
    let caps = PROMPT_ECHO.captures(&clean)?;
    let text = caps.name("text")?.as_str().trim();
    if text.is_empty() || text.starts_with('>') {
        return None;
    }
    Some(PromptText(text.chars().take(MAX_PROMPT_LEN).collect()))
}

/// Mined prompts are skipped when they repeat the most recent marker, which
/// happens when the agent echoes a prompt that was already marked explicitly.
pub fn is_duplicate_of_last(markers: &[PromptMarker], text: &PromptText) -> bool {
    markers
        .iter()
        .max_by_key(|m| (m.output_index, m.id))
        .is_some_and(|last| last.prompt_text.trim() == text.as_str())
}
