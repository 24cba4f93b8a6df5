use remora_llm::{CompletionRequest, HeuristicTokenizer, StreamSink, Tokenizer, ToolSchema};

#[test]
fn test_completion_request_defaults() {
    let req = CompletionRequest::new("gpt-4o", "list the files here");
    assert_eq!(req.model, "gpt-4o");
    assert_eq!(req.prompt, "list the files here");
    assert!(req.history.is_empty());
    assert!(req.tools.is_empty());
    assert!(!req.cancel.is_cancelled());
}

#[tokio::test]
async fn test_string_sink_accumulates_chunks() {
    let mut sink = String::new();
    sink.write_text("hello ").await.unwrap();
    sink.write_text("world").await.unwrap();
    assert_eq!(sink, "hello world");
}

#[test]
fn test_tokenizer_truncate_count_agree() {
    let tok = HeuristicTokenizer;
    for budget in [1, 7, 32, 500] {
        let text = "some command output ".repeat(50);
        let cut = tok.truncate(&text, budget);
        assert!(tok.count(&cut) <= budget, "budget {budget} violated");
    }
}

#[test]
fn test_native_shell_tool_schema() {
    let shell = ToolSchema::shell();
    assert!(shell.native_shell);
    assert_eq!(shell.name, "shell");
}
