//! The central state machine. One cooperative loop selects across the
//! parent/child byte streams, cursor-position reports, SIGWINCH,
//! completion results, autosuggest results, and the error channel. The
//! loop is the sole mutator of `ShellState`, the line buffers, and
//! history ordering.

use crate::autosuggest::{AutosuggestResult, AutosuggestScheduler};
use crate::liveness::{LivenessCache, TuiTail};
use crate::state::{ShellState, State};
use crate::writer::{StyleWriter, TermWriter};
use anyhow::Result;
use remora_ansi::{incomplete_csi, parse_ps1, sanitize, Ps1Scan};
use remora_common::colors::{ColorScheme, RESET};
use remora_common::config::RemoraConfig;
use remora_history::{assemble, BlockTag, BudgetLimits, HistoryStore};
use remora_llm::types::is_cancelled;
use remora_llm::{CompletionRequest, CompletionResponse, LlmClient, Tokenizer};
use remora_prompts::PromptLibrary;
use remora_pty::ShellPty;
use regex_lite::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CURSOR_POSITION_TIMEOUT: Duration = Duration::from_secs(5);
const TAB_ECHO_WINDOW: Duration = Duration::from_millis(50);

/// Everything the loop selects over. Kept outside `Multiplexer` so the
/// select futures and the event handlers never borrow the same struct.
pub struct MuxChannels {
    pub parent_rx: mpsc::Receiver<Vec<u8>>,
    pub child_rx: mpsc::Receiver<Vec<u8>>,
    pub cursor_rx: mpsc::Receiver<(u16, u16)>,
    pub prompt_rx: mpsc::Receiver<CompletionResponse>,
    pub error_rx: mpsc::Receiver<String>,
    pub autosuggest_rx: mpsc::Receiver<AutosuggestResult>,
    pub winch: tokio::signal::unix::Signal,
    pub shutdown: CancellationToken,
}

enum Event {
    Parent(Vec<u8>),
    Child(Vec<u8>),
    Cursor((u16, u16)),
    Winch,
    Suggest(AutosuggestResult),
    PromptDone(CompletionResponse),
    Error(String),
    Shutdown,
    Eof,
}

pub struct Multiplexer {
    pub(crate) cfg: RemoraConfig,
    pub(crate) colors: ColorScheme,
    pub(crate) pty: Arc<ShellPty>,
    pub(crate) out: TermWriter,
    pub(crate) history: Arc<HistoryStore>,
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) prompts: Arc<dyn PromptLibrary>,
    pub(crate) tokenizer: Arc<dyn Tokenizer>,
    pub(crate) state: ShellState,
    pub(crate) liveness: LivenessCache,
    pub(crate) tui_tail: TuiTail,
    pub(crate) autosuggest: AutosuggestScheduler,
    pub(crate) prompt_tx: mpsc::Sender<CompletionResponse>,
    pub(crate) error_tx: mpsc::Sender<String>,
    pub(crate) term_size: (u16, u16),
    pub(crate) sysinfo: String,
    /// None when the PS1 rewrite is disabled (unknown shell or config).
    pub(crate) ps1_regex: Option<Regex>,
}

impl Multiplexer {
    pub async fn run(&mut self, ch: &mut MuxChannels) -> Result<()> {
        loop {
            let event = tokio::select! {
                _ = ch.shutdown.cancelled() => Event::Shutdown,
                Some(msg) = ch.error_rx.recv() => Event::Error(msg),
                Some(pos) = ch.cursor_rx.recv() => Event::Cursor(pos),
                _ = ch.winch.recv() => Event::Winch,
                Some(res) = ch.autosuggest_rx.recv() => Event::Suggest(res),
                Some(resp) = ch.prompt_rx.recv() => Event::PromptDone(resp),
                chunk = ch.child_rx.recv() => chunk.map(Event::Child).unwrap_or(Event::Eof),
                chunk = ch.parent_rx.recv() => chunk.map(Event::Parent).unwrap_or(Event::Eof),
            };

            match event {
                Event::Shutdown | Event::Eof => break,
                Event::Error(msg) => self.handle_error(&msg),
                Event::Cursor(pos) => self.handle_unsolicited_cursor(pos),
                Event::Winch => self.handle_winch(),
                Event::Suggest(res) => self.handle_autosuggest_result(ch, res).await,
                Event::PromptDone(resp) => self.handle_prompt_output(resp),
                Event::Child(chunk) => self.handle_child_out(&chunk),
                Event::Parent(chunk) => self.handle_parent_in(ch, chunk).await?,
            }
        }
        Ok(())
    }

    /// The mode icon currently substituted for PS1 sentinel groups.
    pub(crate) fn current_icon(&self) -> &'static str {
        remora_ansi::ps1::mode_icon(self.state.goal_mode, self.state.goal_unsafe)
    }

    // --- cursor position ---

    /// Ask the terminal where the cursor is and wait for the report. The
    /// loop genuinely blocks here (bounded at five seconds): without
    /// geometry we cannot paint, so a silent terminal is fatal.
    pub(crate) async fn get_cursor_position(&mut self, ch: &mut MuxChannels) -> Result<(u16, u16)> {
        // drain stale reports
        while ch.cursor_rx.try_recv().is_ok() {}
        self.out.write_str("\x1b[6n");
        match tokio::time::timeout(CURSOR_POSITION_TIMEOUT, ch.cursor_rx.recv()).await {
            Ok(Some(pos)) => Ok(pos),
            Ok(None) => anyhow::bail!("cursor channel closed"),
            Err(_) => panic!(
                "terminal did not answer a cursor position query within {}s",
                CURSOR_POSITION_TIMEOUT.as_secs()
            ),
        }
    }

    /// A report we did not ask for must be a child process querying the
    /// terminal: echo it through so the child's own protocol works.
    fn handle_unsolicited_cursor(&mut self, (row, col): (u16, u16)) {
        let _ = self.pty.write_all(format!("\x1b[{row};{col}R").as_bytes());
    }

    // --- signals, errors ---

    fn handle_winch(&mut self) {
        if let Some((rows, cols)) = remora_pty::terminal_size() {
            self.term_size = (rows, cols);
            self.state.prompt_buf.set_term_width(cols);
            self.state.command_buf.set_term_width(cols);
            let _ = self.pty.set_window_size(rows, cols);
        }
    }

    /// Completion-cycle errors: paint for the user, record for the
    /// model, reset to Normal, prod the child for a fresh prompt.
    pub(crate) fn handle_error(&mut self, msg: &str) {
        tracing::error!(%msg, "completion error");
        self.out
            .write_str(&format!("\r\n{}error: {msg}{RESET}\r\n", self.colors.error));
        self.history
            .append(BlockTag::ShellOutput, &format!("error: {msg}\n"));
        self.state.state = State::Normal;
        self.state.prompt_response_cancel = None;
        let _ = self.pty.write_all(b"\n");
    }

    // --- autosuggest ---

    pub(crate) async fn handle_autosuggest_result(
        &mut self,
        ch: &mut MuxChannels,
        res: AutosuggestResult,
    ) {
        let prompting = match self.state.state {
            State::Prompting => true,
            State::Normal | State::Shell => false,
            State::PromptResponse => return,
        };
        let Ok((_row, col)) = self.get_cursor_position(ch).await else {
            return;
        };
        let buf = if prompting {
            &mut self.state.prompt_buf
        } else {
            &mut self.state.command_buf
        };
        // reconcile the model's prompt offset with the real column
        let cursor_cols = buf.cursor_display_cols() as u16;
        buf.set_prompt_length(col.saturating_sub(1).saturating_sub(cursor_cols));
        if let Some(bytes) = self
            .autosuggest
            .show(buf, &res, prompting, self.colors.autosuggest)
        {
            self.out.write_raw(&bytes);
        }
    }

    /// Fire a delayed autosuggest for the current buffer content.
    pub(crate) fn refresh_autosuggest(&mut self, input: &str) {
        let delay = Duration::from_millis(self.cfg.shell.autosuggest_timeout_ms);
        self.autosuggest.request(delay, input, self.state.goal_mode);
    }

    /// Fresh-prompt autosuggest; a negative configured delay disables it.
    pub(crate) fn request_newline_autosuggest(&mut self) {
        let ms = self.cfg.shell.newline_autosuggest_timeout_ms;
        if ms < 0 {
            return;
        }
        self.autosuggest
            .request(Duration::from_millis(ms as u64), "", self.state.goal_mode);
    }

    // --- completion results ---

    pub(crate) fn handle_prompt_output(&mut self, resp: CompletionResponse) {
        self.state.prompt_response_cancel = None;
        if !resp.completion.is_empty() {
            self.history.append(BlockTag::LlmOutput, &resp.completion);
        }

        // replay child output held back during the stream
        let buffered = std::mem::take(&mut self.state.buffered_child_output);
        if !buffered.is_empty() {
            self.out.write_raw(&buffered);
        }
        let _ = self.pty.write_all(b"\n");

        if self.state.goal_mode {
            self.dispatch_goal_response(resp);
        } else {
            self.state.state = State::Normal;
            self.request_newline_autosuggest();
        }
    }

    // --- child output ---

    pub(crate) fn handle_child_out(&mut self, chunk: &[u8]) {
        let has_marker = contains_ps1_suffix(chunk);

        // TUI passthrough fast path: a full-screen program owns the
        // terminal, forward verbatim and keep a bounded sanitized tail.
        if self.state.state == State::Normal
            && !self.state.goal_mode
            && self.state.active_function.is_none()
            && self.state.active_shell_call.is_none()
        {
            let busy = self.liveness.cached();
            let stay = self.state.tui_passthrough && busy && !has_marker;
            let enter = !self.state.tui_passthrough && busy && !has_marker && is_tui_redraw(chunk);
            if stay || enter {
                self.state.tui_passthrough = true;
                self.tui_tail.push(&sanitize(chunk));
                self.out.write_raw(chunk);
                return;
            }
        }
        if self.state.tui_passthrough {
            self.flush_tui_tail();
        }

        let scan = match &self.ps1_regex {
            Some(re) => parse_ps1(
                &String::from_utf8_lossy(chunk),
                re,
                self.current_icon(),
            ),
            None => Ps1Scan {
                last_exit: 0,
                prompt_count: 0,
                cleaned: String::from_utf8_lossy(chunk).into_owned(),
            },
        };

        self.state.count_prompt_suffixes(scan.prompt_count);
        if scan.prompt_count > 0 {
            self.state.last_exit_code = scan.last_exit;
            self.liveness.force(false);
        }

        if scan.prompt_count >= 1
            && self.state.state == State::Normal
            && self.state.active_function.is_none()
            && self.state.active_shell_call.is_none()
        {
            self.request_newline_autosuggest();
        }

        let sanitized = sanitize(scan.cleaned.as_bytes());

        if self.state.goal_mode {
            self.state.goal_output.push_str(&sanitized);
        }

        if self.state.state != State::Shell && !is_zsh_clear_artifact(chunk) && !sanitized.is_empty()
        {
            if let Some((name, call_id)) = self.state.active_function.clone() {
                self.history
                    .append_function_output(&name, &call_id, &sanitized);
            } else if let Some(call_id) = self
                .state
                .active_shell_call
                .as_ref()
                .map(|c| c.call_id.clone())
            {
                self.history.append_shell_call_output(&call_id, &sanitized);
            } else {
                self.history.append(BlockTag::ShellOutput, &sanitized);
            }
        }

        if self.state.state == State::PromptResponse {
            // hold the bytes back until the stream finishes; goal mode
            // discards them (the rolling buffer already has the text)
            if !self.state.goal_mode {
                self.state
                    .buffered_child_output
                    .extend_from_slice(scan.cleaned.as_bytes());
            }
            return;
        }

        // Tab completions echo back from the child right after a
        // forwarded Tab; fold them into the command model.
        if self.state.state == State::Shell {
            let in_window = self
                .state
                .last_tab_passthrough
                .map(|t| t.elapsed() < TAB_ECHO_WINDOW)
                .unwrap_or(false);
            if in_window {
                self.state.command_buf.write(scan.cleaned.as_bytes());
                let input = self.state.command_buf.string();
                self.refresh_autosuggest(&input);
            }
        }

        self.out.write_raw(scan.cleaned.as_bytes());

        if self.state.goal_mode
            && self.state.prompt_suffix_counter >= 2
            && (self.state.active_function.is_some() || self.state.active_shell_call.is_some())
        {
            // the tool's command has run to completion
            self.out.write_str("\r\x1b[K");
            self.finish_goal_tool();
        }
    }

    fn flush_tui_tail(&mut self) {
        self.state.tui_passthrough = false;
        if self.tui_tail.is_empty() {
            return;
        }
        let tail = self.tui_tail.take();
        self.history.append(
            BlockTag::ShellOutput,
            &format!("[interactive session tail]\n{tail}\n"),
        );
    }

    // --- parent input ---

    async fn handle_parent_in(&mut self, ch: &mut MuxChannels, chunk: Vec<u8>) -> Result<()> {
        let mut data = std::mem::take(&mut self.state.parent_residue);
        data.extend_from_slice(&chunk);

        if incomplete_csi(&data) {
            self.state.parent_residue = data;
            return Ok(());
        }

        loop {
            let consumed = self.input_from_parent(ch, &data).await?;
            if consumed == 0 {
                // no progress; hold the bytes until more arrive
                self.state.parent_residue = data;
                break;
            }
            data.drain(..consumed);
            if data.is_empty() {
                break;
            }
        }
        Ok(())
    }

    // --- prompt dispatch ---

    /// Send a natural-language prompt; the completion streams into the
    /// terminal from a background task and the final response arrives on
    /// the prompt-output channel.
    pub(crate) fn send_prompt(&mut self, prompt_text: &str) {
        self.state.state = State::PromptResponse;
        let token = CancellationToken::new();
        self.state.prompt_response_cancel = Some(token.clone());

        let system = match self
            .prompts
            .get(remora_prompts::SHELL_SYSTEM, &[("sysinfo", &self.sysinfo)])
        {
            Ok(s) => s,
            Err(e) => {
                self.handle_error(&e.to_string());
                return;
            }
        };

        let model = self.cfg.shell.prompt_model.clone();
        let limits = self.budget_limits(&model);
        let assembled = match assemble(
            prompt_text,
            &system,
            "",
            &self.history,
            &model,
            self.tokenizer.as_ref(),
            limits,
        ) {
            Ok(a) => a,
            Err(e) => {
                self.handle_error(&e.to_string());
                return;
            }
        };

        self.history.append(BlockTag::UserPrompt, prompt_text);

        let mut req = CompletionRequest::new(&model, &assembled.prompt);
        req.cancel = token;
        req.system_message = system;
        req.history = assembled.history;
        req.max_tokens = self.cfg.shell.max_response_tokens;
        req.token_timeout = Duration::from_secs(self.cfg.llm.token_timeout_secs);
        req.verbose = self.cfg.verbose > 0;

        self.spawn_completion(req, self.colors.answer);
        self.state.prompt_buf.reset();
    }

    pub(crate) fn budget_limits(&self, model: &str) -> BudgetLimits {
        let window = self.cfg.shell.max_prompt_tokens_for(model);
        BudgetLimits {
            max_prompt_tokens: window,
            max_history_block_tokens: self.cfg.shell.max_history_block_tokens,
            max_total_tokens: window.saturating_sub(self.cfg.shell.max_response_tokens),
        }
    }

    /// Stream a completion in the background; the final response lands on
    /// the prompt-output channel, failures on the error channel, and a
    /// cancellation on neither.
    pub(crate) fn spawn_completion(&self, req: CompletionRequest, color: &'static str) {
        let llm = self.llm.clone();
        let prompt_tx = self.prompt_tx.clone();
        let error_tx = self.error_tx.clone();
        let out = self.out;
        tokio::spawn(async move {
            let mut sink = StyleWriter::new(out, color);
            match llm.completion_stream(&req, &mut sink).await {
                Ok(resp) => {
                    sink.close();
                    let _ = prompt_tx.send(resp).await;
                }
                Err(e) if is_cancelled(&e) => {}
                Err(e) => {
                    let _ = error_tx.send(e.to_string()).await;
                }
            }
        });
    }

    // --- local prompt keywords ---

    /// Handle `status` / `help` / `history` without touching the LLM.
    /// Returns true when the prompt was consumed locally.
    pub(crate) fn handle_local_command(&mut self, text: &str) -> bool {
        let answer = match text.trim().to_lowercase().as_str() {
            "help" => help_text(),
            "status" => self.status_text(),
            "history" => self.history_text(),
            _ => return false,
        };
        self.out.write_str(&format!(
            "{}{}{RESET}\r\n",
            self.colors.answer,
            answer.replace('\n', "\r\n")
        ));
        self.history.append(BlockTag::LlmOutput, &answer);
        self.state.state = State::Normal;
        self.state.prompt_buf.reset();
        let _ = self.pty.write_all(b"\n");
        true
    }

    fn status_text(&self) -> String {
        format!(
            "prompt model:      {}\n\
             autosuggest model: {}\n\
             autosuggest:       {}\n\
             goal mode:         {}{}\n\
             history blocks:    {}\n\
             last exit code:    {}",
            self.cfg.shell.prompt_model,
            self.cfg.shell.autosuggest_model,
            if self.cfg.shell.autosuggest_enabled {
                "enabled"
            } else {
                "disabled"
            },
            if self.state.goal_mode { "on" } else { "off" },
            if self.state.goal_unsafe { " (unsafe)" } else { "" },
            self.history.block_count(),
            self.state.last_exit_code,
        )
    }

    fn history_text(&self) -> String {
        let blocks = self.history.get_last_n_bytes(4096, 256);
        if blocks.is_empty() {
            return "history is empty".to_string();
        }
        let mut out = String::new();
        for (tag, content) in blocks {
            out.push_str(&format!("--- {tag:?} ---\n{content}\n"));
        }
        out
    }
}

fn help_text() -> String {
    "remora wraps your shell:\n\
     - Start a line with a capital letter to ask a question.\n\
     - Start with ! to give the agent a goal, !! to let it run commands
       without confirmation.\n\
     - Tab accepts the dim autosuggest text.\n\
     - Local keywords: help, status, history.\n\
     - Ctrl-C cancels a prompt, a response, or goal mode."
        .to_string()
}

/// Raw scan for the PS1 suffix sentinel.
pub(crate) fn contains_ps1_suffix(data: &[u8]) -> bool {
    data.windows(2).any(|w| w == [0x1b, b'R'])
}

/// CSI sequences typical of full-screen redraws. Plain line output uses
/// none of these; editors and pagers use them constantly.
pub(crate) fn is_tui_redraw(data: &[u8]) -> bool {
    use remora_ansi::{classify, ByteKind};
    let mut rest = data;
    while !rest.is_empty() {
        // jump to the next escape instead of classifying every rune
        match rest.iter().position(|&b| b == 0x1b) {
            None => return false,
            Some(pos) => rest = &rest[pos..],
        }
        match classify(rest) {
            Some((len, ByteKind::Csi(name))) => {
                if matches!(name, "CUP" | "HVP" | "ED" | "SM" | "RM" | "VPA" | "SU" | "SD") {
                    return true;
                }
                rest = &rest[len..];
            }
            Some((len, _)) => rest = &rest[len..],
            None => return false,
        }
    }
    false
}

/// zsh clears the screen with this exact artifact on some prompt
/// redraws; it carries no information worth storing.
pub(crate) fn is_zsh_clear_artifact(data: &[u8]) -> bool {
    data == b"\x1b[H\x1b[2J" || data == b"\x1b[2J\x1b[H" || data == b"\x1b[H\x1b[J"
}
