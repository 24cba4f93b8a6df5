use remora_llm::{ChatRole, ShellCall};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockTag {
    UserPrompt,
    ShellInput,
    ShellOutput,
    LlmOutput,
    FunctionOutput,
    ToolOutput,
}

impl BlockTag {
    /// The chat role this block plays when assembled into a request.
    pub fn role(&self) -> ChatRole {
        match self {
            BlockTag::UserPrompt | BlockTag::ShellInput => ChatRole::User,
            BlockTag::ShellOutput => ChatRole::System,
            BlockTag::LlmOutput => ChatRole::Assistant,
            BlockTag::FunctionOutput => ChatRole::Function,
            BlockTag::ToolOutput => ChatRole::Tool,
        }
    }
}

/// Cached tokenization of a block's content under one encoder. Valid
/// only while `input_len` still equals the content length; any append
/// since then invalidates it.
#[derive(Debug, Clone)]
pub struct TokenCache {
    pub input_len: usize,
    pub token_count: usize,
    pub truncated: String,
}

#[derive(Debug)]
pub struct HistoryBlock {
    pub tag: BlockTag,
    content: String,
    pub function_name: Option<String>,
    pub call_id: Option<String>,
    /// Serialized arguments of an LLM-issued function call.
    pub function_args: Option<String>,
    pub shell_call: Option<ShellCall>,
    token_cache: HashMap<String, TokenCache>,
}

impl HistoryBlock {
    pub fn new(tag: BlockTag, content: &str) -> Self {
        Self {
            tag,
            content: content.to_string(),
            function_name: None,
            call_id: None,
            function_args: None,
            shell_call: None,
            token_cache: HashMap::new(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn append_content(&mut self, text: &str) {
        self.content.push_str(text);
    }

    /// Cached tokenization for `encoder`, if still valid for the current
    /// content length.
    pub fn cached_tokens(&self, encoder: &str) -> Option<&TokenCache> {
        self.token_cache
            .get(encoder)
            .filter(|c| c.input_len == self.content.len())
    }

    pub fn store_tokens(&mut self, encoder: &str, cache: TokenCache) {
        self.token_cache.insert(encoder.to_string(), cache);
    }
}
