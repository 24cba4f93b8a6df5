use crate::types::{CompletionRequest, CompletionResponse};
use anyhow::Result;
use async_trait::async_trait;

/// Receives streamed completion text as it arrives. Implemented by the
/// shell's style-aware terminal writer; tests use a plain String sink.
#[async_trait]
pub trait StreamSink: Send {
    async fn write_text(&mut self, chunk: &str) -> Result<()>;
}

#[async_trait]
impl StreamSink for String {
    async fn write_text(&mut self, chunk: &str) -> Result<()> {
        self.push_str(chunk);
        Ok(())
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Blocking completion; returns the full response.
    async fn completion(&self, req: &CompletionRequest) -> Result<CompletionResponse>;

    /// Streaming completion; text chunks go to `sink` as they arrive and
    /// the accumulated response is returned at the end.
    async fn completion_stream(
        &self,
        req: &CompletionRequest,
        sink: &mut dyn StreamSink,
    ) -> Result<CompletionResponse>;

    async fn embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn edits(&self, content: &str, instruction: &str) -> Result<String>;

    fn name(&self) -> &str;
}
