//! Single-flight autosuggest: a delayed, cancellable background
//! completion whose result is rendered as a dim overlay. A new request
//! cancels the outstanding one; results carry the input snapshot they
//! were generated from and are rejected when the buffer has moved on.

use remora_history::HistoryStore;
use remora_linebuf::LineBuffer;
use remora_llm::types::is_cancelled;
use remora_llm::{CompletionRequest, LlmClient};
use remora_prompts::{
    PromptLibrary, AUTOSUGGEST_COMMAND, AUTOSUGGEST_NEW_COMMAND, AUTOSUGGEST_PROMPT,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bytes of history interpolated into autosuggest prompts: a 1500-token
/// excerpt under the 4-bytes-per-token heuristic.
const HISTORY_EXCERPT_BYTES: usize = 1500 * 4;
const HISTORY_EXCERPT_BLOCK_BYTES: usize = 512;

const SUGGEST_MAX_TOKENS: usize = 64;
const SUGGEST_TEMPERATURE: f32 = 0.2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutosuggestResult {
    /// The input the suggestion was generated for.
    pub command: String,
    pub suggestion: String,
}

pub struct AutosuggestScheduler {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<dyn PromptLibrary>,
    history: Arc<HistoryStore>,
    model: String,
    token_timeout: Duration,
    enabled: bool,
    tx: mpsc::Sender<AutosuggestResult>,
    cancel: Option<CancellationToken>,
    /// Overlay text not yet accepted or invalidated.
    pending: Option<String>,
    last_shown: Option<String>,
}

impl AutosuggestScheduler {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompts: Arc<dyn PromptLibrary>,
        history: Arc<HistoryStore>,
        model: String,
        token_timeout: Duration,
        enabled: bool,
    ) -> (Self, mpsc::Receiver<AutosuggestResult>) {
        let (tx, rx) = mpsc::channel(8);
        (
            Self {
                llm,
                prompts,
                history,
                model,
                token_timeout,
                enabled,
                tx,
                cancel: None,
                pending: None,
                last_shown: None,
            },
            rx,
        )
    }

    /// Cancel the in-flight request, if any.
    pub fn cancel(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }

    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    pub fn take_pending(&mut self) -> Option<String> {
        self.pending.take()
    }

    pub fn clear_pending(&mut self) {
        self.pending = None;
    }

    /// Schedule a suggestion for `current_input` after `delay`. Cancels
    /// any outstanding request first.
    pub fn request(&mut self, delay: Duration, current_input: &str, goal_mode: bool) {
        if !self.enabled {
            return;
        }
        self.cancel();
        let token = CancellationToken::new();
        self.cancel = Some(token.clone());

        let llm = self.llm.clone();
        let prompts = self.prompts.clone();
        let history = self.history.clone();
        let model = self.model.clone();
        let token_timeout = self.token_timeout;
        let tx = self.tx.clone();
        let input = current_input.to_string();

        let prompt_completion = goal_mode
            || input
                .chars()
                .next()
                .map(|c| c.is_uppercase() || c == '!')
                .unwrap_or(false);

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let excerpt = history_excerpt(&history);
            let template = if input.is_empty() {
                AUTOSUGGEST_NEW_COMMAND
            } else if prompt_completion {
                AUTOSUGGEST_PROMPT
            } else {
                AUTOSUGGEST_COMMAND
            };
            let prompt =
                match prompts.get(template, &[("history", &excerpt), ("command", &input)]) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "autosuggest template missing");
                        return;
                    }
                };

            let mut req = CompletionRequest::new(&model, &prompt);
            req.cancel = token.clone();
            req.max_tokens = SUGGEST_MAX_TOKENS;
            req.temperature = SUGGEST_TEMPERATURE;
            req.token_timeout = token_timeout;

            match llm.completion(&req).await {
                Ok(resp) => {
                    let suggestion = trim_suggestion(&resp.completion);
                    if suggestion.is_empty() || token.is_cancelled() {
                        return;
                    }
                    let _ = tx
                        .send(AutosuggestResult {
                            command: input,
                            suggestion,
                        })
                        .await;
                }
                Err(e) if is_cancelled(&e) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "autosuggest completion failed");
                }
            }
        });
    }

    /// Validate a result against the anchor buffer and paint the overlay.
    /// Returns the bytes to write to the parent terminal, or `None` when
    /// the result was rejected.
    pub fn show(
        &mut self,
        buf: &mut LineBuffer,
        result: &AutosuggestResult,
        prompting: bool,
        color: &str,
    ) -> Option<Vec<u8>> {
        if result.suggestion.is_empty() {
            return None;
        }
        let current = buf.string();
        if result.command != current {
            return None; // stale: the buffer moved on
        }
        let suggestion = result.suggestion.lines().next().unwrap_or("").to_string();
        if suggestion.is_empty() {
            return None;
        }
        if self.last_shown.as_deref() == Some(suggestion.as_str()) {
            return None;
        }
        if suggestion == current {
            return None;
        }

        let remainder = if suggestion.to_lowercase().starts_with(&current.to_lowercase()) {
            suggestion.chars().skip(current.chars().count()).collect::<String>()
        } else if prompting {
            suggestion.clone()
        } else {
            // shell suggestions must extend the typed command
            return None;
        };
        if remainder.is_empty() {
            return None;
        }

        let mut out = buf.clear_last(color);
        let paint = buf.write_autosuggest(&remainder, 0, color);
        if paint.is_empty() {
            // no room for the overlay; make sure nothing stays pending
            self.pending = None;
            return if out.is_empty() { None } else { Some(out) };
        }
        out.extend(paint);
        self.pending = Some(remainder);
        self.last_shown = Some(suggestion);
        Some(out)
    }

    /// The user typed `c` while an overlay is pending. When it matches
    /// the overlay's first rune, the overlay is consumed in place (no
    /// repaint, no new request) and this returns true.
    pub fn consume_typed(&mut self, c: char, buf: &mut LineBuffer) -> bool {
        let Some(ref mut pending) = self.pending else {
            return false;
        };
        if pending.chars().next() == Some(c) {
            let rest: String = pending.chars().skip(1).collect();
            buf.eat_autosuggest_rune();
            if rest.is_empty() {
                self.pending = None;
            } else {
                *pending = rest;
            }
            true
        } else {
            false
        }
    }
}

/// Trim whitespace and one layer of matching surrounding quotes; models
/// love to quote commands.
pub fn trim_suggestion(raw: &str) -> String {
    let trimmed = raw.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'')
            || (first == b'`' && last == b'`')
        {
            return trimmed[1..trimmed.len() - 1].to_string();
        }
    }
    trimmed.to_string()
}

fn history_excerpt(history: &HistoryStore) -> String {
    use remora_history::BlockTag;
    let blocks = history.get_last_n_bytes(HISTORY_EXCERPT_BYTES, HISTORY_EXCERPT_BLOCK_BYTES);
    let mut out = String::new();
    for (tag, content) in blocks {
        if content.is_empty() {
            continue;
        }
        match tag {
            BlockTag::ShellInput => {
                out.push_str("$ ");
                out.push_str(&content);
            }
            _ => out.push_str(&content),
        }
        if !out.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(content: &str) -> LineBuffer {
        let mut b = LineBuffer::new();
        b.set_term_width(80);
        b.write(content.as_bytes());
        b
    }

    struct NoopLlm;

    #[async_trait::async_trait]
    impl LlmClient for NoopLlm {
        async fn completion(
            &self,
            _req: &CompletionRequest,
        ) -> anyhow::Result<remora_llm::CompletionResponse> {
            Ok(remora_llm::CompletionResponse::default())
        }
        async fn completion_stream(
            &self,
            _req: &CompletionRequest,
            _sink: &mut dyn remora_llm::StreamSink,
        ) -> anyhow::Result<remora_llm::CompletionResponse> {
            Ok(remora_llm::CompletionResponse::default())
        }
        async fn embeddings(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(vec![])
        }
        async fn edits(&self, _c: &str, _i: &str) -> anyhow::Result<String> {
            Ok(String::new())
        }
        fn name(&self) -> &str {
            "noop"
        }
    }

    fn scheduler() -> (AutosuggestScheduler, mpsc::Receiver<AutosuggestResult>) {
        AutosuggestScheduler::new(
            Arc::new(NoopLlm),
            Arc::new(remora_prompts::BuiltinPrompts),
            Arc::new(HistoryStore::new()),
            "test-model".to_string(),
            Duration::from_secs(5),
            true,
        )
    }

    #[test]
    fn test_trim_suggestion() {
        assert_eq!(trim_suggestion("  ls -la\n"), "ls -la");
        assert_eq!(trim_suggestion("\"ls -la\""), "ls -la");
        assert_eq!(trim_suggestion("'ls'"), "ls");
        assert_eq!(trim_suggestion("`ls`"), "ls");
        // unmatched quotes stay
        assert_eq!(trim_suggestion("\"ls"), "\"ls");
        assert_eq!(trim_suggestion("don't"), "don't");
    }

    #[tokio::test]
    async fn test_show_paints_suffix() {
        let (mut sched, _rx) = scheduler();
        let mut buf = buffer_with("ls");
        let result = AutosuggestResult {
            command: "ls".to_string(),
            suggestion: "ls -la".to_string(),
        };
        let out = sched.show(&mut buf, &result, false, "\x1b[2m");
        assert!(out.is_some());
        assert_eq!(sched.pending(), Some(" -la"));
    }

    #[tokio::test]
    async fn test_show_rejects_stale_result() {
        let (mut sched, _rx) = scheduler();
        let mut buf = buffer_with("ls");
        let result = AutosuggestResult {
            command: "ls".to_string(),
            suggestion: "ls -la".to_string(),
        };
        assert!(sched.show(&mut buf, &result, false, "").is_some());

        // user types one more character; same result is now stale
        buf.write(b"x");
        let out = sched.show(&mut buf, &result, false, "");
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_show_rejects_repeat() {
        let (mut sched, _rx) = scheduler();
        let mut buf = buffer_with("ls");
        let result = AutosuggestResult {
            command: "ls".to_string(),
            suggestion: "ls -la".to_string(),
        };
        assert!(sched.show(&mut buf, &result, false, "").is_some());
        assert!(sched.show(&mut buf, &result, false, "").is_none());
    }

    #[tokio::test]
    async fn test_show_rejects_identical_to_buffer() {
        let (mut sched, _rx) = scheduler();
        let mut buf = buffer_with("ls -la");
        let result = AutosuggestResult {
            command: "ls -la".to_string(),
            suggestion: "ls -la".to_string(),
        };
        assert!(sched.show(&mut buf, &result, false, "").is_none());
    }

    #[tokio::test]
    async fn test_show_rejects_non_extending_in_shell_state() {
        let (mut sched, _rx) = scheduler();
        let mut buf = buffer_with("git");
        let result = AutosuggestResult {
            command: "git".to_string(),
            suggestion: "ls -la".to_string(),
        };
        assert!(sched.show(&mut buf, &result, false, "").is_none());
        // but a prompting buffer may get a full replacement painted
        assert!(sched.show(&mut buf, &result, true, "").is_some());
    }

    #[tokio::test]
    async fn test_show_uses_first_line_only() {
        let (mut sched, _rx) = scheduler();
        let mut buf = buffer_with("ls");
        let result = AutosuggestResult {
            command: "ls".to_string(),
            suggestion: "ls -la\necho extra".to_string(),
        };
        assert!(sched.show(&mut buf, &result, false, "").is_some());
        assert_eq!(sched.pending(), Some(" -la"));
    }

    #[tokio::test]
    async fn test_show_case_insensitive_prefix_strip() {
        let (mut sched, _rx) = scheduler();
        let mut buf = buffer_with("GIT");
        let result = AutosuggestResult {
            command: "GIT".to_string(),
            suggestion: "git status".to_string(),
        };
        assert!(sched.show(&mut buf, &result, false, "").is_some());
        assert_eq!(sched.pending(), Some(" status"));
    }

    #[tokio::test]
    async fn test_consume_typed_shrinks_without_request() {
        let (mut sched, _rx) = scheduler();
        let mut buf = buffer_with("ls");
        let result = AutosuggestResult {
            command: "ls".to_string(),
            suggestion: "ls -la".to_string(),
        };
        sched.show(&mut buf, &result, false, "");

        buf.write(b" ");
        assert!(sched.consume_typed(' ', &mut buf));
        assert_eq!(sched.pending(), Some("-la"));

        buf.write(b"-");
        assert!(sched.consume_typed('-', &mut buf));

        // divergent keystroke is not consumed
        buf.write(b"x");
        assert!(!sched.consume_typed('x', &mut buf));
    }

    #[tokio::test]
    async fn test_request_cancels_prior() {
        let (mut sched, _rx) = scheduler();
        sched.request(Duration::from_secs(60), "a", false);
        let first = sched.cancel.clone().unwrap();
        sched.request(Duration::from_secs(60), "ab", false);
        assert!(first.is_cancelled());
        assert!(!sched.cancel.as_ref().unwrap().is_cancelled());
        sched.cancel();
        assert!(sched.cancel.is_none());
    }

    #[test]
    fn test_history_excerpt_prefixes_shell_input() {
        use remora_history::BlockTag;
        let history = HistoryStore::new();
        history.append(BlockTag::ShellInput, "ls -la");
        history.append(BlockTag::ShellOutput, "file.txt");
        let excerpt = history_excerpt(&history);
        assert!(excerpt.contains("$ ls -la"));
        assert!(excerpt.contains("file.txt"));
    }
}
