use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
pub struct RemoraConfig {
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub color: ColorConfig,
    /// 0 = quiet, 1 = info, 2 = debug.
    #[serde(default)]
    pub verbose: u8,
}

impl Default for RemoraConfig {
    fn default() -> Self {
        Self {
            shell: ShellConfig::default(),
            llm: LlmConfig::default(),
            color: ColorConfig::default(),
            verbose: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ShellConfig {
    #[serde(default = "default_shell_binary")]
    pub binary: String,
    #[serde(default = "default_prompt_model")]
    pub prompt_model: String,
    #[serde(default = "default_autosuggest_model")]
    pub autosuggest_model: String,
    #[serde(default = "default_max_prompt_tokens")]
    pub max_prompt_tokens: usize,
    #[serde(default = "default_max_response_tokens")]
    pub max_response_tokens: usize,
    #[serde(default = "default_max_history_block_tokens")]
    pub max_history_block_tokens: usize,
    #[serde(default = "default_true")]
    pub autosuggest_enabled: bool,
    /// Delay before an in-command autosuggest request fires.
    #[serde(default = "default_autosuggest_timeout_ms")]
    pub autosuggest_timeout_ms: u64,
    /// Delay after a fresh prompt appears. Negative disables.
    #[serde(default = "default_newline_autosuggest_timeout_ms")]
    pub newline_autosuggest_timeout_ms: i64,
    /// Skip the PS1 rewrite entirely (disables mode icons and exit-code
    /// visibility).
    #[serde(default)]
    pub leave_prompt_alone: bool,
    /// How long the cached child-process liveness check stays valid.
    #[serde(default = "default_liveness_cache_ms")]
    pub liveness_cache_ms: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            binary: default_shell_binary(),
            prompt_model: default_prompt_model(),
            autosuggest_model: default_autosuggest_model(),
            max_prompt_tokens: default_max_prompt_tokens(),
            max_response_tokens: default_max_response_tokens(),
            max_history_block_tokens: default_max_history_block_tokens(),
            autosuggest_enabled: true,
            autosuggest_timeout_ms: default_autosuggest_timeout_ms(),
            newline_autosuggest_timeout_ms: default_newline_autosuggest_timeout_ms(),
            leave_prompt_alone: false,
            liveness_cache_ms: default_liveness_cache_ms(),
        }
    }
}

impl ShellConfig {
    /// Effective prompt-token budget for `model`. The stock default scales
    /// up for the large-context "gpt-5" family, but an explicit value in
    /// the config file always wins.
    pub fn max_prompt_tokens_for(&self, model: &str) -> usize {
        if self.max_prompt_tokens == default_max_prompt_tokens() && model.starts_with("gpt-5") {
            65536
        } else {
            self.max_prompt_tokens
        }
    }
}

fn default_shell_binary() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

fn default_prompt_model() -> String {
    "gpt-4o".to_string()
}

fn default_autosuggest_model() -> String {
    "gpt-3.5-turbo-instruct".to_string()
}

fn default_max_prompt_tokens() -> usize {
    16384
}

fn default_max_response_tokens() -> usize {
    1024
}

fn default_max_history_block_tokens() -> usize {
    512
}

fn default_autosuggest_timeout_ms() -> u64 {
    400
}

fn default_newline_autosuggest_timeout_ms() -> i64 {
    3000
}

fn default_liveness_cache_ms() -> u64 {
    250
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_name")]
    pub default: String,
    #[serde(default)]
    pub backends: HashMap<String, LlmBackendConfig>,
    /// Max idle seconds between streamed tokens before the completion
    /// errors out.
    #[serde(default = "default_token_timeout_secs")]
    pub token_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct LlmBackendConfig {
    pub backend_type: String,
    #[serde(default)]
    pub api_key_cmd: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_token_timeout_secs() -> u64 {
    10
}

fn default_llm_name() -> String {
    "openai".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default: default_llm_name(),
            backends: HashMap::new(),
            token_timeout_secs: default_token_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ColorConfig {
    #[serde(default = "default_true")]
    pub dark: bool,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self { dark: true }
    }
}

/// Per-user data directory (logs, caches).
pub fn remora_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".remora")
}

pub fn load_config() -> Result<RemoraConfig> {
    let path = std::env::var("REMORA_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("/etc"))
                .join("remora/config.toml")
        });
    if path.exists() {
        let contents = std::fs::read_to_string(&path)?;
        Ok(toml::from_str(&contents)?)
    } else {
        Ok(RemoraConfig::default())
    }
}
