use crate::backoff::{rate_limit_help, retryable_status, Backoff};
use crate::client::{LlmClient, StreamSink};
use crate::types::{
    Cancelled, ChatRole, CompletionRequest, CompletionResponse, FunctionCall, ShellCall,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicBackend {
    pub api_key: String,
    pub client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn build_messages(req: &CompletionRequest) -> Vec<Value> {
        let mut messages = Vec::new();
        for entry in &req.history {
            match entry.role {
                ChatRole::Assistant => {
                    if let (Some(name), Some(args)) = (&entry.name, &entry.arguments) {
                        let input: Value =
                            serde_json::from_str(args).unwrap_or_else(|_| json!({"raw": args}));
                        messages.push(json!({
                            "role": "assistant",
                            "content": [{
                                "type": "tool_use",
                                "id": entry.tool_call_id.clone().unwrap_or_default(),
                                "name": name,
                                "input": input,
                            }],
                        }));
                    } else {
                        messages.push(json!({"role": "assistant", "content": entry.content}));
                    }
                }
                ChatRole::Function | ChatRole::Tool => {
                    messages.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": entry.tool_call_id.clone().unwrap_or_default(),
                            "content": entry.content,
                        }],
                    }));
                }
                _ => messages.push(json!({"role": "user", "content": entry.content})),
            }
        }
        messages.push(json!({"role": "user", "content": req.prompt}));
        messages
    }

    fn build_body(req: &CompletionRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "messages": Self::build_messages(req),
        });
        if !req.system_message.is_empty() {
            body["system"] = Value::String(req.system_message.clone());
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .filter(|t| !t.native_shell)
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        if stream {
            body["stream"] = Value::Bool(true);
        }
        body
    }

    async fn send(&self, body: &Value, cancel: &tokio_util::sync::CancellationToken) -> Result<reqwest::Response> {
        let mut backoff = Backoff::new();
        loop {
            let send = self
                .client
                .post(API_URL)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .header("content-type", "application/json")
                .json(body)
                .send();

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(anyhow::Error::new(Cancelled)),
                r = send => r,
            };

            match result {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let json: Value = resp.json().await.unwrap_or(Value::Null);
                    let error_type = json["error"]["type"].as_str().unwrap_or("unknown");
                    let error_msg = json["error"]["message"].as_str().unwrap_or("no detail");
                    if status.as_u16() == 429 {
                        if !backoff.wait().await {
                            return Err(anyhow!("{}", rate_limit_help(error_type, error_msg)));
                        }
                        continue;
                    }
                    if retryable_status(status) && backoff.wait().await {
                        tracing::warn!(%status, "server error, retrying");
                        continue;
                    }
                    return Err(anyhow!(
                        "Anthropic API error ({status}): {error_type} - {error_msg}"
                    ));
                }
                Err(e) => {
                    if backoff.wait().await {
                        continue;
                    }
                    return Err(anyhow!("request failed: {e}"));
                }
            }
        }
    }
}

#[async_trait]
impl LlmClient for AnthropicBackend {
    async fn completion(&self, req: &CompletionRequest) -> Result<CompletionResponse> {
        let body = Self::build_body(req, false);
        let resp = self.send(&body, &req.cancel).await?;
        let json: Value = resp.json().await?;

        let mut completion = String::new();
        let mut function_call = None;
        for block in json["content"].as_array().map(|a| a.as_slice()).unwrap_or(&[]) {
            match block["type"].as_str() {
                Some("text") => {
                    completion.push_str(block["text"].as_str().unwrap_or(""));
                }
                Some("tool_use") if function_call.is_none() => {
                    function_call = Some(FunctionCall {
                        name: block["name"].as_str().unwrap_or("").to_string(),
                        arguments: block["input"].to_string(),
                        call_id: block["id"].as_str().unwrap_or("").to_string(),
                    });
                }
                _ => {}
            }
        }

        Ok(CompletionResponse {
            completion,
            function_call,
            shell_calls: Vec::new(),
            error: None,
        })
    }

    async fn completion_stream(
        &self,
        req: &CompletionRequest,
        sink: &mut dyn StreamSink,
    ) -> Result<CompletionResponse> {
        let body = Self::build_body(req, true);
        let resp = self.send(&body, &req.cancel).await?;

        let mut stream = resp.bytes_stream();
        let mut line_buf = String::new();
        let mut completion = String::new();
        let mut tool_name = String::new();
        let mut tool_id = String::new();
        let mut tool_args = String::new();
        let mut in_tool_block = false;

        loop {
            let next = tokio::select! {
                _ = req.cancel.cancelled() => return Err(anyhow::Error::new(Cancelled)),
                n = tokio::time::timeout(req.token_timeout, stream.next()) => n,
            };
            let chunk = match next {
                Err(_) => {
                    return Err(anyhow!(
                        "no tokens received in {} seconds",
                        req.token_timeout.as_secs()
                    ))
                }
                Ok(None) => break,
                Ok(Some(c)) => c?,
            };

            line_buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = line_buf.find('\n') {
                let line = line_buf[..pos].trim().to_string();
                line_buf.drain(..=pos);
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                let Ok(event) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                match event["type"].as_str() {
                    Some("content_block_start") => {
                        if event["content_block"]["type"] == "tool_use" {
                            in_tool_block = true;
                            tool_name = event["content_block"]["name"]
                                .as_str()
                                .unwrap_or("")
                                .to_string();
                            tool_id = event["content_block"]["id"]
                                .as_str()
                                .unwrap_or("")
                                .to_string();
                        }
                    }
                    Some("content_block_delta") => {
                        if let Some(text) = event["delta"]["text"].as_str() {
                            completion.push_str(text);
                            sink.write_text(text).await?;
                        }
                        if let Some(partial) = event["delta"]["partial_json"].as_str() {
                            tool_args.push_str(partial);
                        }
                    }
                    Some("content_block_stop") => {
                        // tool block fully accumulated; nothing else to do
                    }
                    Some("message_stop") => break,
                    _ => {}
                }
            }
        }

        let function_call = if in_tool_block {
            Some(FunctionCall {
                name: tool_name,
                arguments: tool_args,
                call_id: tool_id,
            })
        } else {
            None
        };

        Ok(CompletionResponse {
            completion,
            function_call,
            shell_calls: Vec::<ShellCall>::new(),
            error: None,
        })
    }

    async fn embeddings(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(anyhow!("anthropic backend does not provide embeddings"))
    }

    async fn edits(&self, content: &str, instruction: &str) -> Result<String> {
        let mut req = CompletionRequest::new("claude-sonnet-4-5", content);
        req.system_message = instruction.to_string();
        let resp = self.completion(&req).await?;
        Ok(resp.completion)
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HistoryEntry, ToolSchema};

    #[test]
    fn test_system_goes_in_top_level_field() {
        let mut req = CompletionRequest::new("claude-sonnet-4-5", "hi");
        req.system_message = "be brief".to_string();
        let body = AnthropicBackend::build_body(&req, false);
        assert_eq!(body["system"], "be brief");
        // no system message in the messages array
        for m in body["messages"].as_array().unwrap() {
            assert_ne!(m["role"], "system");
        }
    }

    #[test]
    fn test_tool_output_becomes_tool_result() {
        let mut req = CompletionRequest::new("claude-sonnet-4-5", "next");
        let mut entry = HistoryEntry::text(ChatRole::Function, "exit code 0");
        entry.tool_call_id = Some("toolu_1".to_string());
        req.history = vec![entry];
        let body = AnthropicBackend::build_body(&req, false);
        let first = &body["messages"][0];
        assert_eq!(first["role"], "user");
        assert_eq!(first["content"][0]["type"], "tool_result");
        assert_eq!(first["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn test_native_shell_tool_not_forwarded() {
        let mut req = CompletionRequest::new("claude-sonnet-4-5", "go");
        req.tools = vec![
            ToolSchema::shell(),
            ToolSchema::function("finish", "done", json!({"type": "object"})),
        ];
        let body = AnthropicBackend::build_body(&req, false);
        let tools = body["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "finish");
    }
}
