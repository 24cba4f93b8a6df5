use remora_common::config::RemoraConfig;

#[test]
fn test_parse_full_config() {
    let toml_str = r#"
verbose = 2

[shell]
binary = "/bin/zsh"
prompt_model = "claude-sonnet-4-5"
autosuggest_model = "gpt-3.5-turbo-instruct"
max_prompt_tokens = 8192
max_response_tokens = 2048
max_history_block_tokens = 256
autosuggest_enabled = false
autosuggest_timeout_ms = 250
newline_autosuggest_timeout_ms = -1
leave_prompt_alone = true

[llm]
default = "anthropic"
token_timeout_secs = 20

[llm.backends.anthropic]
backend_type = "anthropic"
api_key_env = "ANTHROPIC_API_KEY"

[color]
dark = false
"#;
    let config: RemoraConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(config.shell.binary, "/bin/zsh");
    assert_eq!(config.shell.max_prompt_tokens, 8192);
    assert!(!config.shell.autosuggest_enabled);
    assert_eq!(config.shell.newline_autosuggest_timeout_ms, -1);
    assert!(config.shell.leave_prompt_alone);
    assert_eq!(config.llm.default, "anthropic");
    assert_eq!(config.llm.token_timeout_secs, 20);
    assert!(!config.color.dark);
    assert_eq!(config.verbose, 2);
}

#[test]
fn test_partial_config_uses_defaults() {
    let toml_str = r#"
[shell]
prompt_model = "gpt-4o"
"#;
    let config: RemoraConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(config.shell.max_prompt_tokens, 16384);
    assert_eq!(config.shell.max_response_tokens, 1024);
    assert!(config.shell.autosuggest_enabled);
    assert_eq!(config.shell.liveness_cache_ms, 250);
    assert!(config.color.dark);
    assert_eq!(config.verbose, 0);
}

#[test]
fn test_empty_config_is_valid() {
    let config: RemoraConfig = toml::from_str("").unwrap();
    assert!(!config.shell.binary.is_empty());
    assert_eq!(config.llm.default, "openai");
}

#[test]
fn test_load_config_from_env_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[shell]\nprompt_model = \"test-model\"\n").unwrap();
    std::env::set_var("REMORA_CONFIG", &path);
    let cfg = remora_common::config::load_config().unwrap();
    assert_eq!(cfg.shell.prompt_model, "test-model");
    std::env::remove_var("REMORA_CONFIG");
}
