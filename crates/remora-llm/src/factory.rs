use crate::anthropic::AnthropicBackend;
use crate::client::LlmClient;
use crate::openai_compat::OpenAiCompatBackend;
use anyhow::{anyhow, Result};
use remora_common::config::{LlmBackendConfig, LlmConfig};
use std::process::Command;
use std::sync::Arc;

/// Resolve an API key from the configured env var or key command.
fn resolve_api_key(config: &LlmBackendConfig) -> Result<String> {
    if let Some(ref var) = config.api_key_env {
        if let Ok(key) = std::env::var(var) {
            if !key.is_empty() {
                return Ok(key);
            }
        }
    }
    if let Some(ref cmd) = config.api_key_cmd {
        let output = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .output()
            .map_err(|e| anyhow!("failed to execute api_key_cmd: {e}"))?;
        if !output.status.success() {
            return Err(anyhow!(
                "api_key_cmd failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        let key = String::from_utf8(output.stdout)?.trim().to_string();
        if key.is_empty() {
            return Err(anyhow!("api_key_cmd returned empty key"));
        }
        return Ok(key);
    }
    Err(anyhow!("no api_key_env or api_key_cmd configured"))
}

pub fn create_backend(config: &LlmBackendConfig) -> Result<Arc<dyn LlmClient>> {
    let api_key = resolve_api_key(config)?;
    match config.backend_type.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicBackend::new(api_key))),
        "openai-compat" => {
            let base_url = config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
            Ok(Arc::new(OpenAiCompatBackend::new(api_key, base_url)))
        }
        other => Err(anyhow!("unknown backend type: {other}")),
    }
}

/// Build the default backend from config, falling back to an
/// OpenAI-compatible backend keyed by `OPENAI_API_KEY` when the config
/// names no backends at all.
pub fn default_backend(llm: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    if let Some(backend) = llm.backends.get(&llm.default) {
        return create_backend(backend);
    }
    let key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| anyhow!("no [llm.backends] configured and OPENAI_API_KEY is not set"))?;
    Ok(Arc::new(OpenAiCompatBackend::new(
        key,
        "https://api.openai.com/v1".to_string(),
    )))
}

/// Whether `model` advertises a provider-native shell tool that replaces
/// our own `command` function in goal mode.
pub fn has_native_shell_tool(model: &str) -> bool {
    model.starts_with("gpt-5")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_api_key_from_cmd() {
        let config = LlmBackendConfig {
            backend_type: "openai-compat".to_string(),
            api_key_cmd: Some("echo test-key".to_string()),
            api_key_env: None,
            base_url: None,
        };
        assert_eq!(resolve_api_key(&config).unwrap(), "test-key");
    }

    #[test]
    fn test_resolve_api_key_cmd_failure() {
        let config = LlmBackendConfig {
            backend_type: "openai-compat".to_string(),
            api_key_cmd: Some("false".to_string()),
            api_key_env: None,
            base_url: None,
        };
        assert!(resolve_api_key(&config).is_err());
    }

    #[test]
    fn test_unknown_backend_type() {
        let config = LlmBackendConfig {
            backend_type: "mystery".to_string(),
            api_key_cmd: Some("echo k".to_string()),
            api_key_env: None,
            base_url: None,
        };
        assert!(create_backend(&config).is_err());
    }

    #[test]
    fn test_native_shell_tool_models() {
        assert!(has_native_shell_tool("gpt-5-codex"));
        assert!(!has_native_shell_tool("gpt-4o"));
        assert!(!has_native_shell_tool("claude-sonnet-4-5"));
    }
}
