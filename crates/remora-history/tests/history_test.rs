use remora_history::{assemble, BlockTag, BudgetLimits, HistoryStore};
use remora_llm::{ChatRole, HeuristicTokenizer, ShellCall, Tokenizer};

/// A full session shape: commands, output, a prompt, an answer, then a
/// goal-mode tool exchange, assembled twice under a budget.
#[test]
fn test_session_round_trip_through_budget() {
    let store = HistoryStore::new();
    store.append(BlockTag::ShellInput, "cargo test\n");
    store.append(BlockTag::ShellOutput, "test result: FAILED. 1 failed\n");
    store.append(BlockTag::UserPrompt, "Why did the test fail?");
    store.append(BlockTag::LlmOutput, "The assertion on line 42 failed.");
    store.add_function_call("command", r#"{"cmd": "cargo test -- --nocapture"}"#, "c1");
    store.append_function_output("command", "c1", "assertion output...\nexit code: 101\n");

    let limits = BudgetLimits {
        max_prompt_tokens: 128,
        max_history_block_tokens: 64,
        max_total_tokens: 4096,
    };
    let out = assemble(
        "continue",
        "system message",
        "[]",
        &store,
        "gpt-4o",
        &HeuristicTokenizer,
        limits,
    )
    .unwrap();

    assert_eq!(out.history.len(), 6);
    assert_eq!(out.history[0].role, ChatRole::User);
    assert_eq!(out.history[4].role, ChatRole::Assistant);
    assert_eq!(out.history[4].name.as_deref(), Some("command"));
    assert_eq!(out.history[5].role, ChatRole::Function);
    assert!(out.used_tokens <= limits.max_total_tokens);

    // second assembly reuses the per-block token caches
    let again = assemble(
        "continue",
        "system message",
        "[]",
        &store,
        "gpt-4o",
        &HeuristicTokenizer,
        limits,
    )
    .unwrap();
    assert_eq!(again.history.len(), out.history.len());
}

#[test]
fn test_excerpt_skips_blocks_over_budget_boundary() {
    let store = HistoryStore::new();
    store.append(BlockTag::ShellOutput, &"big ".repeat(100));
    store.append(BlockTag::ShellInput, "ls\n");

    // only the small newest block fits
    let excerpt = store.get_last_n_bytes(10, 1024);
    assert_eq!(excerpt.len(), 1);
    assert_eq!(excerpt[0].0, BlockTag::ShellInput);
}

#[test]
fn test_shell_call_outputs_assemble_as_tool_entries() {
    let store = HistoryStore::new();
    let call = ShellCall {
        call_id: "sc_1".to_string(),
        commands: vec!["ls".to_string(), "pwd".to_string()],
        max_output_length: Some(4096),
    };
    store.add_shell_call(&call);
    store.append_shell_call_output("sc_1", "file.txt\n/home/user\nexit code: 0\n");

    let limits = BudgetLimits {
        max_prompt_tokens: 64,
        max_history_block_tokens: 64,
        max_total_tokens: 2048,
    };
    let out = assemble("", "", "", &store, "gpt-4o", &HeuristicTokenizer, limits).unwrap();
    assert_eq!(out.history.len(), 2);
    assert_eq!(out.history[1].role, ChatRole::Tool);
    assert_eq!(out.history[1].tool_call_id.as_deref(), Some("sc_1"));
}

#[test]
fn test_block_content_capped_before_encoding() {
    let tok = HeuristicTokenizer;
    let store = HistoryStore::new();
    store.append(BlockTag::ShellOutput, &"x".repeat(100_000));

    let limits = BudgetLimits {
        max_prompt_tokens: 64,
        max_history_block_tokens: 32,
        max_total_tokens: 8192,
    };
    let out = assemble("p", "", "", &store, "gpt-4o", &tok, limits).unwrap();
    assert_eq!(out.history.len(), 1);
    assert!(tok.count(&out.history[0].content) <= 32);
}
