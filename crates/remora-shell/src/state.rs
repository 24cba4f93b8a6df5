use remora_linebuf::LineBuffer;
use remora_llm::ShellCall;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Normal,
    Shell,
    Prompting,
    PromptResponse,
}

/// Sentinel for "auto-resume disabled": set when the goal-mode agent asks
/// the user a question, so arriving prompt suffixes never trip the
/// two-suffix completion detector.
pub const SUFFIX_COUNTER_DISABLED: i64 = i64::MIN;

/// All mutable protocol state. Owned and mutated exclusively by the
/// multiplexer loop.
pub struct ShellState {
    pub state: State,

    pub goal_mode: bool,
    pub goal: String,
    pub goal_unsafe: bool,
    /// Child output accumulated since the last goal-mode tool call.
    pub goal_output: String,

    /// Active LLM function call: (name, call id).
    pub active_function: Option<(String, String)>,
    /// Active structured shell call, when the model used the native tool.
    pub active_shell_call: Option<ShellCall>,

    /// Prompt suffixes seen since the current tool command was typed.
    pub prompt_suffix_counter: i64,
    pub last_exit_code: i32,

    pub last_tab_passthrough: Option<Instant>,

    pub prompt_buf: LineBuffer,
    pub command_buf: LineBuffer,

    /// Unprocessed parent bytes ending in an incomplete escape sequence.
    pub parent_residue: Vec<u8>,

    /// Child output held back while a prompt response streams; replayed
    /// afterwards (discarded in goal mode).
    pub buffered_child_output: Vec<u8>,

    /// Cancels the outstanding prompt/goal completion task.
    pub prompt_response_cancel: Option<CancellationToken>,

    pub tui_passthrough: bool,
}

impl ShellState {
    pub fn new() -> Self {
        Self {
            state: State::Normal,
            goal_mode: false,
            goal: String::new(),
            goal_unsafe: false,
            goal_output: String::new(),
            active_function: None,
            active_shell_call: None,
            prompt_suffix_counter: 0,
            last_exit_code: 0,
            last_tab_passthrough: None,
            prompt_buf: LineBuffer::new(),
            command_buf: LineBuffer::new(),
            parent_residue: Vec::new(),
            buffered_child_output: Vec::new(),
            prompt_response_cancel: None,
            tui_passthrough: false,
        }
    }

    pub fn exit_goal_mode(&mut self) {
        self.goal_mode = false;
        self.goal.clear();
        self.goal_unsafe = false;
        self.goal_output.clear();
        self.active_function = None;
        self.active_shell_call = None;
        self.prompt_suffix_counter = 0;
    }

    /// Bump the suffix counter unless auto-resume is disabled.
    pub fn count_prompt_suffixes(&mut self, n: usize) {
        if self.prompt_suffix_counter != SUFFIX_COUNTER_DISABLED {
            self.prompt_suffix_counter = self.prompt_suffix_counter.saturating_add(n as i64);
        }
    }
}

impl Default for ShellState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_counter_disabled_stays_disabled() {
        let mut s = ShellState::new();
        s.prompt_suffix_counter = SUFFIX_COUNTER_DISABLED;
        s.count_prompt_suffixes(3);
        assert_eq!(s.prompt_suffix_counter, SUFFIX_COUNTER_DISABLED);
    }

    #[test]
    fn test_exit_goal_mode_resets_everything() {
        let mut s = ShellState::new();
        s.goal_mode = true;
        s.goal = "list files".to_string();
        s.goal_unsafe = true;
        s.goal_output = "out".to_string();
        s.active_function = Some(("command".to_string(), "c1".to_string()));
        s.prompt_suffix_counter = 2;
        s.exit_goal_mode();
        assert!(!s.goal_mode);
        assert!(s.goal.is_empty());
        assert!(!s.goal_unsafe);
        assert!(s.active_function.is_none());
        assert_eq!(s.prompt_suffix_counter, 0);
    }
}
