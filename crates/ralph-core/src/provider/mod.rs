//! Provider adapters for the external AI coding CLIs.
//!
//! Each provider is a tagged variant with a single dispatch surface:
//! argv construction, per-line stream-event parsing, and a display name.
//! The CLIs all stream newline-delimited JSON on stdout; the parsers
//! normalize their event shapes into [`StreamEvent`] values.

pub mod runner;

use serde::{Deserialize, Serialize};

/// The supported provider CLIs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Claude,
    Gemini,
    Cursor,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Claude => write!(f, "claude"),
            Self::Gemini => write!(f, "gemini"),
            Self::Cursor => write!(f, "cursor"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "claude" => Ok(Self::Claude),
            "gemini" => Ok(Self::Gemini),
            "cursor" => Ok(Self::Cursor),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Agent operating mode (only Cursor distinguishes these on its argv).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    #[default]
    Agent,
    Plan,
    Ask,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Plan => write!(f, "plan"),
            Self::Ask => write!(f, "ask"),
        }
    }
}

impl std::str::FromStr for AgentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "agent" => Ok(Self::Agent),
            "plan" => Ok(Self::Plan),
            "ask" => Ok(Self::Ask),
            other => Err(format!("unknown agent mode: {other}")),
        }
    }
}

/// A fully-resolved provider invocation target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub model: String,
    #[serde(default)]
    pub mode: AgentMode,
    /// Override for the CLI binary path; defaults to the provider's
    /// well-known name resolved via `$PATH`. Used heavily by tests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            mode: AgentMode::default(),
            binary: None,
        }
    }

    /// The binary to spawn.
    pub fn binary_path(&self) -> &str {
        self.binary.as_deref().unwrap_or(self.kind.binary())
    }

    /// The rate-limiter slot this config occupies.
    pub fn slot(&self) -> (String, String) {
        (self.kind.to_string(), self.model.clone())
    }
}

/// A normalized event parsed from one stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A text chunk from the model. The last one seen is the "final
    /// message" used for the task summary.
    Text { content: String },
    /// The agent invoked a tool.
    ToolUse { tool: String },
    /// The provider reported an error.
    Error { message: String },
}

impl ProviderKind {
    /// Human-readable name for logs and status lines.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Claude => "Claude Code",
            Self::Gemini => "Gemini CLI",
            Self::Cursor => "Cursor Agent",
        }
    }

    /// The well-known CLI binary name.
    pub fn binary(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Cursor => "cursor-agent",
        }
    }

    /// Build the fixed argv pattern for this provider.
    pub fn build_args(&self, prompt: &str, model: &str, mode: AgentMode) -> Vec<String> {
        match self {
            Self::Claude => vec![
                "--print".into(),
                "--verbose".into(),
                "--output-format".into(),
                "stream-json".into(),
                "--dangerously-skip-permissions".into(),
                "--model".into(),
                model.into(),
                "--max-turns".into(),
                "50".into(),
                prompt.into(),
            ],
            Self::Gemini => vec![
                "-p".into(),
                prompt.into(),
                "-m".into(),
                model.into(),
                "--output-format".into(),
                "stream-json".into(),
                "-y".into(),
            ],
            Self::Cursor => vec![
                "-p".into(),
                prompt.into(),
                "--model".into(),
                model.into(),
                "--output-format".into(),
                "json".into(),
                format!("--mode={mode}"),
            ],
        }
    }

    /// Parse one stdout line into zero or more normalized events.
    ///
    /// Returns `Err` only for lines that are not JSON at all; callers
    /// treat that as a non-event (plain text output) and keep reading.
    pub fn parse_event(&self, line: &str) -> Result<Vec<StreamEvent>, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        Ok(match self {
            Self::Claude => parse_claude_event(&value),
            Self::Gemini => parse_gemini_event(&value),
            Self::Cursor => parse_cursor_event(&value),
        })
    }
}

/// Claude Code stream-json: `assistant` messages carry content blocks,
/// `result` carries the final text, `error` carries failures.
fn parse_claude_event(value: &serde_json::Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    match value.get("type").and_then(|t| t.as_str()).unwrap_or("") {
        "assistant" => {
            let blocks = value
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array());
            for block in blocks.into_iter().flatten() {
                match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "text" => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            events.push(StreamEvent::Text {
                                content: text.to_string(),
                            });
                        }
                    }
                    "tool_use" => {
                        let tool = block
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or("unknown");
                        events.push(StreamEvent::ToolUse {
                            tool: tool.to_string(),
                        });
                    }
                    _ => {}
                }
            }
        }
        "tool_use" => {
            let tool = value
                .get("name")
                .or_else(|| value.get("tool"))
                .and_then(|n| n.as_str())
                .unwrap_or("unknown");
            events.push(StreamEvent::ToolUse {
                tool: tool.to_string(),
            });
        }
        "result" => {
            if let Some(text) = value.get("result").and_then(|r| r.as_str()) {
                events.push(StreamEvent::Text {
                    content: text.to_string(),
                });
            }
        }
        "error" => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .or_else(|| value.get("message").and_then(|m| m.as_str()))
                .unwrap_or("unknown error");
            events.push(StreamEvent::Error {
                message: message.to_string(),
            });
        }
        _ => {}
    }
    events
}

/// Gemini CLI stream-json: content chunks under `content`/`text`,
/// tool calls as `tool_use`/`tool_call` events.
fn parse_gemini_event(value: &serde_json::Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    match value.get("type").and_then(|t| t.as_str()).unwrap_or("") {
        "content" | "assistant" | "message" => {
            let text = value
                .get("content")
                .or_else(|| value.get("text"))
                .and_then(|t| t.as_str());
            if let Some(text) = text {
                events.push(StreamEvent::Text {
                    content: text.to_string(),
                });
            }
        }
        "tool_use" | "tool_call" => {
            let tool = value
                .get("name")
                .or_else(|| value.get("tool"))
                .and_then(|n| n.as_str())
                .unwrap_or("unknown");
            events.push(StreamEvent::ToolUse {
                tool: tool.to_string(),
            });
        }
        "error" => {
            let message = value
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            events.push(StreamEvent::Error {
                message: message.to_string(),
            });
        }
        _ => {}
    }
    events
}

/// Cursor agent json output: `result` events carry the final text,
/// `tool_call` events carry tool invocations.
fn parse_cursor_event(value: &serde_json::Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    match value.get("type").and_then(|t| t.as_str()).unwrap_or("") {
        "result" => {
            if let Some(text) = value.get("result").and_then(|r| r.as_str()) {
                events.push(StreamEvent::Text {
                    content: text.to_string(),
                });
            }
        }
        "assistant" | "message" => {
            let text = value
                .get("text")
                .or_else(|| value.get("content"))
                .and_then(|t| t.as_str());
            if let Some(text) = text {
                events.push(StreamEvent::Text {
                    content: text.to_string(),
                });
            }
        }
        "tool_call" | "tool_use" => {
            let tool = value
                .get("name")
                .or_else(|| value.get("tool"))
                .and_then(|n| n.as_str())
                .unwrap_or("unknown");
            events.push(StreamEvent::ToolUse {
                tool: tool.to_string(),
            });
        }
        "error" => {
            let message = value
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            events.push(StreamEvent::Error {
                message: message.to_string(),
            });
        }
        _ => {}
    }
    events
}
