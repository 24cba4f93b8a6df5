use crate::backoff::{rate_limit_help, retryable_status, Backoff};
use crate::client::{LlmClient, StreamSink};
use crate::types::{
    Cancelled, ChatRole, CompletionRequest, CompletionResponse, FunctionCall, ShellCall,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub struct OpenAiCompatBackend {
    pub api_key: String,
    pub base_url: String,
    pub client: reqwest::Client,
}

impl OpenAiCompatBackend {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url,
            client: reqwest::Client::new(),
        }
    }

    fn build_messages(req: &CompletionRequest) -> Vec<Value> {
        let mut messages = Vec::new();
        if !req.system_message.is_empty() {
            messages.push(json!({"role": "system", "content": req.system_message}));
        }
        for entry in &req.history {
            let msg = match entry.role {
                ChatRole::Assistant => {
                    if let (Some(name), Some(args)) = (&entry.name, &entry.arguments) {
                        json!({
                            "role": "assistant",
                            "content": entry.content,
                            "tool_calls": [{
                                "id": entry.tool_call_id.clone().unwrap_or_default(),
                                "type": "function",
                                "function": {"name": name, "arguments": args},
                            }],
                        })
                    } else {
                        json!({"role": "assistant", "content": entry.content})
                    }
                }
                ChatRole::Function => json!({
                    "role": "function",
                    "name": entry.name.clone().unwrap_or_default(),
                    "content": entry.content,
                }),
                ChatRole::Tool => json!({
                    "role": "tool",
                    "tool_call_id": entry.tool_call_id.clone().unwrap_or_default(),
                    "content": entry.content,
                }),
                role => json!({"role": role.as_str(), "content": entry.content}),
            };
            messages.push(msg);
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
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    if t.native_shell {
                        json!({"type": "shell"})
                    } else {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            },
                        })
                    }
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        if stream {
            body["stream"] = Value::Bool(true);
        }
        body
    }

    /// Send the request, retrying transient failures. Non-retryable
    /// errors come back with the provider's message attached.
    async fn send(&self, body: &Value, cancel: &tokio_util::sync::CancellationToken) -> Result<reqwest::Response> {
        let mut backoff = Backoff::new();
        loop {
            let send = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
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
                        tracing::warn!(%status, "rate limited, retrying");
                        continue;
                    }
                    if retryable_status(status) {
                        if backoff.wait().await {
                            tracing::warn!(%status, "server error, retrying");
                            continue;
                        }
                    }
                    return Err(anyhow!("API error ({status}): {error_type} - {error_msg}"));
                }
                Err(e) => {
                    if backoff.wait().await {
                        tracing::warn!(error = %e, "request failed, retrying");
                        continue;
                    }
                    return Err(anyhow!("request failed: {e}"));
                }
            }
        }
    }
}

/// Pull the first function call and any shell calls out of a message's
/// `tool_calls` array.
fn parse_tool_calls(tool_calls: &Value) -> (Option<FunctionCall>, Vec<ShellCall>) {
    let mut function_call = None;
    let mut shell_calls = Vec::new();
    for tc in tool_calls.as_array().map(|a| a.as_slice()).unwrap_or(&[]) {
        match tc["type"].as_str() {
            Some("function") => {
                if function_call.is_none() {
                    function_call = Some(FunctionCall {
                        name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                        arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
                        call_id: tc["id"].as_str().unwrap_or("").to_string(),
                    });
                }
            }
            Some("shell") | Some("shell_call") => {
                let commands = tc["shell"]["commands"]
                    .as_array()
                    .or_else(|| tc["commands"].as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|c| c.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                shell_calls.push(ShellCall {
                    call_id: tc["id"].as_str().unwrap_or("").to_string(),
                    commands,
                    max_output_length: tc["shell"]["max_output_length"]
                        .as_u64()
                        .or_else(|| tc["max_output_length"].as_u64())
                        .map(|n| n as usize),
                });
            }
            _ => {}
        }
    }
    (function_call, shell_calls)
}

/// Accumulates streamed tool-call fragments keyed by their index.
#[derive(Default)]
struct ToolCallAccum {
    id: String,
    kind: String,
    name: String,
    arguments: String,
}

#[async_trait]
impl LlmClient for OpenAiCompatBackend {
    async fn completion(&self, req: &CompletionRequest) -> Result<CompletionResponse> {
        let body = Self::build_body(req, false);
        let resp = self.send(&body, &req.cancel).await?;
        let json: Value = resp.json().await?;

        let message = &json["choices"][0]["message"];
        let (function_call, shell_calls) = parse_tool_calls(&message["tool_calls"]);
        Ok(CompletionResponse {
            completion: message["content"].as_str().unwrap_or("").to_string(),
            function_call,
            shell_calls,
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
        let mut tool_accum: BTreeMap<u64, ToolCallAccum> = BTreeMap::new();

        'read: loop {
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
                if data == "[DONE]" {
                    break 'read;
                }
                let Ok(event) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                let delta = &event["choices"][0]["delta"];
                if let Some(text) = delta["content"].as_str() {
                    completion.push_str(text);
                    sink.write_text(text).await?;
                }
                for tc in delta["tool_calls"].as_array().map(|a| a.as_slice()).unwrap_or(&[]) {
                    let idx = tc["index"].as_u64().unwrap_or(0);
                    let accum = tool_accum.entry(idx).or_default();
                    if let Some(id) = tc["id"].as_str() {
                        accum.id.push_str(id);
                    }
                    if let Some(kind) = tc["type"].as_str() {
                        accum.kind = kind.to_string();
                    }
                    if let Some(name) = tc["function"]["name"].as_str() {
                        accum.name.push_str(name);
                    }
                    if let Some(args) = tc["function"]["arguments"].as_str() {
                        accum.arguments.push_str(args);
                    }
                }
            }
        }

        // Reassemble accumulated tool calls into the response shape.
        let assembled: Vec<Value> = tool_accum
            .into_values()
            .map(|a| {
                json!({
                    "id": a.id,
                    "type": if a.kind.is_empty() { "function".to_string() } else { a.kind },
                    "function": {"name": a.name, "arguments": a.arguments},
                })
            })
            .collect();
        let (function_call, shell_calls) = parse_tool_calls(&Value::Array(assembled));

        Ok(CompletionResponse {
            completion,
            function_call,
            shell_calls,
            error: None,
        })
    }

    async fn embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({
            "model": "text-embedding-3-small",
            "input": texts,
        });
        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;
        let json: Value = resp.json().await?;
        let mut out = Vec::new();
        for item in json["data"].as_array().map(|a| a.as_slice()).unwrap_or(&[]) {
            let vec: Vec<f32> = item["embedding"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect()
                })
                .unwrap_or_default();
            out.push(vec);
        }
        Ok(out)
    }

    async fn edits(&self, content: &str, instruction: &str) -> Result<String> {
        let mut req = CompletionRequest::new("gpt-4o", content);
        req.system_message = instruction.to_string();
        let resp = self.completion(&req).await?;
        Ok(resp.completion)
    }

    fn name(&self) -> &str {
        "openai-compat"
    }
}
