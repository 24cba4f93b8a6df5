//! Per-state handling of user input. Each handler consumes a prefix of
//! the chunk and returns how many bytes it took; the multiplexer loops
//! until the chunk is spent or no progress is made.

use crate::mux::{Multiplexer, MuxChannels};
use crate::state::State;
use anyhow::Result;
use remora_ansi::{classify, ByteKind};
use remora_common::colors::RESET;
use remora_history::BlockTag;
use std::time::Instant;

const CTRL_C: u8 = 0x03;

impl Multiplexer {
    pub(crate) async fn input_from_parent(
        &mut self,
        ch: &mut MuxChannels,
        data: &[u8],
    ) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        match self.state.state {
            State::PromptResponse => self.input_prompt_response(data),
            State::Normal => self.input_normal(ch, data).await,
            State::Prompting => self.input_prompting(data),
            State::Shell => self.input_shell(data),
        }
    }

    /// While a response streams, everything is swallowed except Ctrl-C,
    /// which cancels the completion (and goal mode with it).
    fn input_prompt_response(&mut self, data: &[u8]) -> Result<usize> {
        let first = data[0];
        let last = *data.last().unwrap();
        if first == CTRL_C || last == CTRL_C {
            if let Some(token) = self.state.prompt_response_cancel.take() {
                token.cancel();
            }
            self.state.exit_goal_mode();
            self.state.state = State::Normal;
            return Ok(if first == CTRL_C { 1 } else { data.len() });
        }
        Ok(data.len())
    }

    async fn input_normal(&mut self, ch: &mut MuxChannels, data: &[u8]) -> Result<usize> {
        // A running foreground command owns the byte stream.
        if self.liveness.has_running_children() {
            self.pty.write_all(data)?;
            return Ok(data.len());
        }

        let first = data[0];
        if first == CTRL_C {
            if self.state.goal_mode {
                self.out.write_str(&format!(
                    "\r\n{}exited goal mode{RESET}\r\n",
                    self.colors.goal_mode
                ));
                self.state.exit_goal_mode();
            }
            self.state.prompt_buf.reset();
            self.state.command_buf.reset();
            self.pty.write_all(&[CTRL_C])?;
            return Ok(1);
        }

        if let Some((len, ByteKind::Printable(c))) = classify(data) {
            if c.is_uppercase() || c == '!' {
                self.enter_prompting(ch, &data[..len], c).await?;
                return Ok(len);
            }
        }

        if first == b'\t' {
            if self.autosuggest.pending().is_some() {
                self.realize_suggestion_to_child();
                self.state.state = State::Shell;
            } else {
                self.state.last_tab_passthrough = Some(Instant::now());
                self.pty.write_all(&[b'\t'])?;
            }
            return Ok(1);
        }

        if first == b'\r' {
            let bytes = self.state.command_buf.clear_last(self.colors.command);
            self.out.write_raw(&bytes);
            self.autosuggest.clear_pending();
            self.pty.write_all(&[b'\r'])?;
            return Ok(1);
        }

        // Seed a fresh Command buffer. A chunk opening with ESC is taken
        // whole so control sequences reach the child unsplit.
        let consumed = if first == 0x1b {
            data.len()
        } else {
            classify(data).map(|(len, _)| len).unwrap_or(1)
        };
        self.state.command_buf.reset();
        self.state.command_buf.set_term_width(self.term_size.1);
        let _ = self.state.command_buf.write(&data[..consumed]);
        self.out.write_str(self.colors.command);
        self.pty.write_all(&data[..consumed])?;
        self.state.state = State::Shell;
        let input = self.state.command_buf.string();
        self.refresh_autosuggest(&input);
        Ok(consumed)
    }

    async fn enter_prompting(
        &mut self,
        ch: &mut MuxChannels,
        rune_bytes: &[u8],
        c: char,
    ) -> Result<()> {
        self.state.state = State::Prompting;

        let overlay = self.state.command_buf.clear_last(self.colors.command);
        self.out.write_raw(&overlay);
        self.autosuggest.clear_pending();

        let color = if self.state.goal_unsafe {
            self.colors.unsafe_goal_prompt
        } else if c == '!' || self.state.goal_mode {
            self.colors.goal_prompt
        } else {
            self.colors.prompt
        };
        self.state.prompt_buf.reset();
        self.state.prompt_buf.set_term_width(self.term_size.1);
        self.state.prompt_buf.set_color(color);
        let _ = self.state.prompt_buf.write(rune_bytes);
        self.out.write_str(color);
        self.out.write_raw(rune_bytes);

        // The shell printed its own PS1 before us; learn where the
        // editable region starts from the real cursor position.
        let (_row, col) = self.get_cursor_position(ch).await?;
        let size_cols = self.state.prompt_buf.cursor_display_cols() as u16;
        self.state
            .prompt_buf
            .set_prompt_length(col.saturating_sub(1).saturating_sub(size_cols));

        let input = self.state.prompt_buf.string();
        self.refresh_autosuggest(&input);
        Ok(())
    }

    fn input_prompting(&mut self, data: &[u8]) -> Result<usize> {
        if let Some(cr) = data.iter().position(|&b| b == b'\r') {
            let overlay = self.state.prompt_buf.clear_last(self.colors.prompt);
            self.out.write_raw(&overlay);
            self.autosuggest.clear_pending();
            self.autosuggest.cancel();
            if cr > 0 {
                let repaint = self.state.prompt_buf.write(&data[..cr]);
                self.out.write_raw(&repaint);
            }
            self.out.write_str("\n\r");

            let text = self.state.prompt_buf.string();
            if self.handle_local_command(&text) {
                return Ok(cr + 1);
            }
            if text.starts_with('!') {
                self.start_goal_mode(&text);
            } else if self.state.goal_mode {
                self.goal_chat_turn(&text);
            } else {
                self.send_prompt(&text);
            }
            return Ok(cr + 1);
        }

        // Second '!' on a bare '!' prompt: recolor to the unsafe shade.
        if data == b"!" && self.state.prompt_buf.string() == "!" {
            self.state
                .prompt_buf
                .set_color(self.colors.unsafe_goal_prompt);
            self.out.write_str(self.colors.unsafe_goal_prompt);
            let repaint = self.state.prompt_buf.write(b"!");
            self.out.write_raw(&repaint);
            return Ok(1);
        }

        if data[0] == b'\t' {
            self.realize_suggestion_to_display();
            return Ok(1);
        }

        if data[0] == CTRL_C {
            self.autosuggest.cancel();
            let overlay = self.state.prompt_buf.clear_last(self.colors.prompt);
            self.out.write_raw(&overlay);
            self.autosuggest.clear_pending();
            let bytes = self.state.prompt_buf.clear();
            self.out.write_raw(&bytes);
            self.state.state = State::Normal;
            return Ok(1);
        }

        let all_consumed = self.consume_against_overlay(data, true);
        let repaint = self.state.prompt_buf.write(data);
        self.out.write_raw(&repaint);

        if self.state.prompt_buf.is_empty() {
            self.state.state = State::Normal;
            return Ok(data.len());
        }
        if !all_consumed {
            let overlay = self.state.prompt_buf.clear_last(self.colors.prompt);
            self.out.write_raw(&overlay);
            self.autosuggest.clear_pending();
            let input = self.state.prompt_buf.string();
            self.refresh_autosuggest(&input);
        }
        Ok(data.len())
    }

    fn input_shell(&mut self, data: &[u8]) -> Result<usize> {
        if let Some(cr) = data.iter().position(|&b| b == b'\r') {
            let overlay = self.state.command_buf.clear_last(self.colors.command);
            self.out.write_raw(&overlay);
            self.autosuggest.clear_pending();
            // a paste burst may carry command text in front of the CR
            if cr > 0 {
                let _ = self.state.command_buf.write(&data[..cr]);
            }
            self.pty.write_all(&data[..=cr])?;

            let cmd = self.state.command_buf.string();
            if !cmd.is_empty() {
                self.history
                    .append(BlockTag::ShellInput, &format!("{cmd}\n"));
            }
            self.state.command_buf.reset();
            self.autosuggest.cancel();
            self.state.state = State::Normal;
            return Ok(cr + 1);
        }

        let first = data[0];
        if first == CTRL_C {
            self.state.command_buf.reset();
            self.state.state = State::Normal;
            self.pty.write_all(&[CTRL_C])?;
            self.autosuggest.cancel();
            self.autosuggest.clear_pending();
            return Ok(1);
        }

        if first == b'\t' {
            if self.autosuggest.pending().is_some() {
                self.realize_suggestion_to_child();
            } else {
                self.state.last_tab_passthrough = Some(Instant::now());
                self.pty.write_all(&[b'\t'])?;
            }
            return Ok(1);
        }

        let all_consumed = self.consume_against_overlay(data, false);
        let _ = self.state.command_buf.write(data);
        self.pty.write_all(data)?;

        if self.state.command_buf.is_empty() {
            self.state.state = State::Normal;
            return Ok(data.len());
        }
        if !all_consumed {
            let overlay = self.state.command_buf.clear_last(self.colors.command);
            self.out.write_raw(&overlay);
            self.autosuggest.clear_pending();
            let input = self.state.command_buf.string();
            self.refresh_autosuggest(&input);
        }
        Ok(data.len())
    }

    /// Try to absorb typed runes into the pending overlay. Returns true
    /// when every rune matched the overlay's head, meaning no repaint of
    /// the overlay and no new completion request is needed.
    fn consume_against_overlay(&mut self, data: &[u8], prompting: bool) -> bool {
        if self.autosuggest.pending().is_none() {
            return false;
        }
        let buf = if prompting {
            &mut self.state.prompt_buf
        } else {
            &mut self.state.command_buf
        };
        let mut all = true;
        let mut rest = data;
        while let Some((len, kind)) = classify(rest) {
            match kind {
                ByteKind::Printable(c) if c != '\r' && c != '\n' => {
                    if !(all && self.autosuggest.consume_typed(c, buf)) {
                        all = false;
                    }
                }
                _ => all = false,
            }
            rest = &rest[len..];
        }
        all
    }

    /// Accept the pending suggestion into the command line: move the
    /// child's cursor to end of line, then type the suggestion. The
    /// child's echo paints over the dim overlay.
    pub(crate) fn realize_suggestion_to_child(&mut self) {
        let Some(suggestion) = self.autosuggest.take_pending() else {
            return;
        };
        let buf = &mut self.state.command_buf;
        let _ = buf.clear_last("");
        let mut child_bytes = Vec::new();
        while buf.cursor() < buf.size() {
            child_bytes.extend_from_slice(b"\x1b[C");
            let _ = buf.write(b"\x1b[C");
        }
        child_bytes.extend_from_slice(suggestion.as_bytes());
        let _ = buf.write(suggestion.as_bytes());
        let _ = self.pty.write_all(&child_bytes);
        self.autosuggest.cancel();
    }

    /// Accept the pending suggestion into the prompt: display only, the
    /// child never sees prompt text.
    pub(crate) fn realize_suggestion_to_display(&mut self) {
        let Some(suggestion) = self.autosuggest.take_pending() else {
            return;
        };
        let buf = &mut self.state.prompt_buf;
        let _ = buf.clear_last("");
        let mut out_bytes = Vec::new();
        while buf.cursor() < buf.size() {
            out_bytes.extend(buf.write(b"\x1b[C"));
        }
        out_bytes.extend(buf.write(suggestion.as_bytes()));
        self.out.write_raw(&out_bytes);
        self.autosuggest.cancel();
    }
}
