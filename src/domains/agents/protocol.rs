//! Decoder for the agent's line-delimited `stream-json` output.
//!
//! Bytes arrive in arbitrary chunks from the PTY. Only complete lines are
//! decoded. Every line becomes at least one output record: JSON objects are
//! forwarded as `json` and, when they describe something a human would want to
//! read, also rendered as a `stdout` line. Anything that is not a JSON object is
//! passed through verbatim as `stdout`.

use log::{debug, trace};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::events::OutputKind;

const TOOL_CALL_TTL: Duration = Duration::from_secs(300);
const SNIPPET_CHARS: usize = 200;
const INPUT_SUMMARY_CHARS: usize = 120;
const INPUT_SUMMARY_KEYS: [&str; 6] = ["file_path", "path", "command", "pattern", "url", "query"];

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    System(SystemMessage),
    Assistant { message: MessageBody },
    User { message: MessageBody },
    Result(ResultMessage),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemMessage {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultMessage {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u64>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub content: Option<MessageContent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// What the supervisor does with one decoded line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    Output { kind: OutputKind, data: String },
    /// The agent announced its own session id (`system/init`).
    Initialized { agent_session_id: String },
    /// The agent reported the end of a turn (`result`).
    TurnCompleted,
}

impl StreamSignal {
    fn stdout(data: impl Into<String>) -> Self {
        StreamSignal::Output {
            kind: OutputKind::Stdout,
            data: data.into(),
        }
    }
}

struct PendingTool {
    name: String,
    registered_at: Instant,
}

/// Pairs `tool_result` blocks with the `tool_use` that started them.
/// Entries expire after a TTL so abandoned calls do not accumulate.
pub struct ToolCorrelator {
    pending: HashMap<String, PendingTool>,
    ttl: Duration,
}

impl Default for ToolCorrelator {
    fn default() -> Self {
        Self::new(TOOL_CALL_TTL)
    }
}

impl ToolCorrelator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            ttl,
        }
    }

    pub fn register(&mut self, id: &str, name: &str) {
        self.prune(Instant::now());
        self.pending.insert(
            id.to_string(),
            PendingTool {
                name: name.to_string(),
                registered_at: Instant::now(),
            },
        );
    }

    /// Removes and returns the tool name for `id`, if it is still pending.
    pub fn resolve(&mut self, id: &str) -> Option<String> {
        self.prune(Instant::now());
        self.pending.remove(id).map(|p| p.name)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.pending.retain(|id, pending| {
            let keep = now.duration_since(pending.registered_at) < ttl;
            if !keep {
                trace!("Dropping expired tool call {id} ({})", pending.name);
            }
            keep
        });
    }
}

#[derive(Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    tools: ToolCorrelator,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool_ttl(ttl: Duration) -> Self {
        Self {
            buffer: Vec::new(),
            tools: ToolCorrelator::new(ttl),
        }
    }

    /// Feeds a raw chunk and returns signals for every line it completed.
    /// A trailing partial line stays buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamSignal> {
        self.buffer.extend_from_slice(chunk);
        let mut signals = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            signals.extend(self.decode_line(text.trim_end_matches('\r')));
        }
        signals
    }

    /// Decodes whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Vec<StreamSignal> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest);
        self.decode_line(text.trim_end_matches('\r'))
    }

    pub fn decode_line(&mut self, line: &str) -> Vec<StreamSignal> {
        if line.trim().is_empty() {
            return Vec::new();
        }

        let value = match serde_json::from_str::<Value>(line) {
            Ok(value @ Value::Object(_)) => value,
            _ => return vec![StreamSignal::stdout(line)],
        };

        let mut signals = vec![StreamSignal::Output {
            kind: OutputKind::Json,
            data: line.to_string(),
        }];

        match serde_json::from_value::<StreamMessage>(value) {
            Ok(message) => self.render(message, &mut signals),
            Err(err) => debug!("Unrecognised stream message shape: {err}"),
        }
        signals
    }

    fn render(&mut self, message: StreamMessage, out: &mut Vec<StreamSignal>) {
        match message {
            StreamMessage::System(system) => match system.subtype.as_str() {
                "init" => {
                    out.push(StreamSignal::stdout(format!(
                        "[system] session started ({} tools available)",
                        system.tools.len()
                    )));
                    if let Some(id) = system.session_id.filter(|id| !id.is_empty()) {
                        out.push(StreamSignal::Initialized {
                            agent_session_id: id,
                        });
                    }
                }
                "result" => {
                    out.push(StreamSignal::stdout(render_result(
                        None,
                        system.duration_ms,
                        system.num_turns,
                        false,
                    )));
                    out.push(StreamSignal::TurnCompleted);
                }
                other => trace!("Not rendering system/{other}"),
            },
            StreamMessage::Result(result) => {
                out.push(StreamSignal::stdout(render_result(
                    result.subtype.as_deref(),
                    result.duration_ms,
                    result.num_turns,
                    result.is_error,
                )));
                out.push(StreamSignal::TurnCompleted);
            }
            StreamMessage::Assistant { message } => self.render_content(message, false, out),
            StreamMessage::User { message } => self.render_content(message, true, out),
            StreamMessage::Unknown => {}
        }
    }

    fn render_content(&mut self, message: MessageBody, from_user: bool, out: &mut Vec<StreamSignal>) {
        let blocks = match message.content {
            None => return,
            Some(MessageContent::Text(text)) => vec![ContentBlock::Text { text }],
            Some(MessageContent::Blocks(blocks)) => blocks,
        };

        for block in blocks {
            match block {
                ContentBlock::Text { text } => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    let rendered = if from_user {
                        format!("> {}", text.trim())
                    } else {
                        format!("[assistant] {}", text.trim_end())
                    };
                    out.push(StreamSignal::stdout(rendered));
                }
                ContentBlock::ToolUse { id, name, input } => {
                    self.tools.register(&id, &name);
                    let summary = summarize_input(&input);
                    let rendered = if summary.is_empty() {
                        format!("[tool] {name}")
                    } else {
                        format!("[tool] {name} {summary}")
                    };
                    out.push(StreamSignal::stdout(rendered));
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    let label = if is_error { "tool error" } else { "tool result" };
                    let snippet = snippet(&result_text(&content));
                    let rendered = match self.tools.resolve(&tool_use_id) {
                        Some(name) => format!("[{label}] {name}: {snippet}"),
                        None => format!("[{label}] (orphaned {tool_use_id}) {snippet}"),
                    };
                    out.push(StreamSignal::stdout(rendered.trim_end().to_string()));
                }
                ContentBlock::Other => {}
            }
        }
    }
}

fn render_result(
    subtype: Option<&str>,
    duration_ms: Option<u64>,
    num_turns: Option<u64>,
    is_error: bool,
) -> String {
    let mut rendered = if is_error {
        "[result] failed".to_string()
    } else {
        "[result] completed".to_string()
    };
    if let Some(subtype) = subtype.filter(|s| *s != "success") {
        rendered.push_str(&format!(" ({subtype})"));
    }
    if let Some(ms) = duration_ms {
        rendered.push_str(&format!(" in {:.1}s", ms as f64 / 1000.0));
    }
    if let Some(turns) = num_turns {
        rendered.push_str(&format!(", {turns} turn(s)"));
    }
    rendered
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}

fn summarize_input(input: &Value) -> String {
    if let Value::Object(map) = input {
        for key in INPUT_SUMMARY_KEYS {
            if let Some(Value::String(value)) = map.get(key) {
                return truncate_chars(value, INPUT_SUMMARY_CHARS);
            }
        }
        if map.is_empty() {
            return String::new();
        }
    }
    if input.is_null() {
        return String::new();
    }
    truncate_chars(&input.to_string(), INPUT_SUMMARY_CHARS)
}

fn result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn snippet(text: &str) -> String {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let Some(first) = lines.next() else {
        return String::new();
    };
    let remaining = lines.count();
    let head = truncate_chars(first.trim(), SNIPPET_CHARS);
    if remaining > 0 {
        format!("{head} (+{remaining} more lines)")
    } else {
        head
    }
}
