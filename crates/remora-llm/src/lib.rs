pub mod anthropic;
pub mod backoff;
pub mod client;
pub mod factory;
pub mod openai_compat;
pub mod tokenizer;
pub mod types;

pub use client::{LlmClient, StreamSink};
pub use tokenizer::{HeuristicTokenizer, Tokenizer};
pub use types::{
    ChatRole, CompletionRequest, CompletionResponse, FunctionCall, HistoryEntry, ShellCall,
    ToolSchema,
};
