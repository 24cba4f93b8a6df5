use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Function,
    Tool,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Function => "function",
            ChatRole::Tool => "tool",
        }
    }
}

/// One assembled chat message, ready for a provider payload. Produced by
/// the token budgeter from history blocks.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub role: ChatRole,
    pub content: String,
    /// Function name, for function-call and function-output messages.
    pub name: Option<String>,
    /// Serialized arguments of an assistant function call.
    pub arguments: Option<String>,
    pub tool_call_id: Option<String>,
}

impl HistoryEntry {
    pub fn text(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            arguments: None,
            tool_call_id: None,
        }
    }
}

/// A tool the model may call. `native_shell` marks the provider-defined
/// shell tool that replaces our own `command` function on models that
/// advertise one; it has no schema of ours.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub native_shell: bool,
}

impl ToolSchema {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
            native_shell: false,
        }
    }

    pub fn shell() -> Self {
        Self {
            name: "shell".to_string(),
            description: String::new(),
            parameters: serde_json::Value::Null,
            native_shell: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub cancel: CancellationToken,
    pub prompt: String,
    pub system_message: String,
    pub history: Vec<HistoryEntry>,
    pub model: String,
    pub max_tokens: usize,
    pub temperature: f32,
    pub tools: Vec<ToolSchema>,
    /// Max idle time between streamed tokens before the request errors.
    pub token_timeout: Duration,
    pub verbose: bool,
}

impl CompletionRequest {
    pub fn new(model: &str, prompt: &str) -> Self {
        Self {
            cancel: CancellationToken::new(),
            prompt: prompt.to_string(),
            system_message: String::new(),
            history: Vec::new(),
            model: model.to_string(),
            max_tokens: 1024,
            temperature: 0.7,
            tools: Vec::new(),
            token_timeout: Duration::from_secs(10),
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON argument text as the model produced it. Parsed leniently
    /// downstream; models emit unescaped quotes often enough that strict
    /// parsing here would lose calls.
    pub arguments: String,
    pub call_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCall {
    pub call_id: String,
    pub commands: Vec<String>,
    pub max_output_length: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub completion: String,
    pub function_call: Option<FunctionCall>,
    pub shell_calls: Vec<ShellCall>,
    pub error: Option<String>,
}

/// Marker error for a request that ended because its cancellation token
/// fired. Callers treat this as normal shutdown, not a failure.
#[derive(Debug)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "request cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// True when `err` is (or wraps) a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Cancelled>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_strings() {
        assert_eq!(ChatRole::Assistant.as_str(), "assistant");
        assert_eq!(ChatRole::Function.as_str(), "function");
    }

    #[test]
    fn test_is_cancelled() {
        let err = anyhow::Error::new(Cancelled);
        assert!(is_cancelled(&err));
        let other = anyhow::anyhow!("network down");
        assert!(!is_cancelled(&other));
    }

    #[test]
    fn test_tool_schema_shell_marker() {
        assert!(ToolSchema::shell().native_shell);
        let f = ToolSchema::function("command", "run a command", serde_json::json!({}));
        assert!(!f.native_shell);
        assert_eq!(f.name, "command");
    }
}
