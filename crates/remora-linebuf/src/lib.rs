//! In-memory model of one editable shell line. The buffer tracks runes
//! and an insertion cursor, and every mutation returns the exact byte
//! stream that repaints the region on a terminal of known width starting
//! at a known column offset. It also paints and erases the dim
//! autosuggest overlay anchored at the cursor.
//!
//! Geometry is column-based: each rune contributes its display width and
//! lines wrap at `term_width`. The host terminal is assumed to honor CSI
//! cursor-positioning codes.

use remora_ansi::{classify, ByteKind};
use unicode_width::UnicodeWidthChar;

pub struct LineBuffer {
    runes: Vec<char>,
    cursor: usize,
    /// Columns occupied by the shell's own prompt before the editable
    /// region.
    prompt_length: u16,
    term_width: u16,
    color: String,
    /// Last painted autosuggest: (rune count, columns right of cursor).
    last_suggest: Option<(usize, u16)>,
}

fn rune_width(c: char) -> usize {
    c.width().unwrap_or(0)
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            runes: Vec::new(),
            cursor: 0,
            prompt_length: 0,
            term_width: 0,
            color: String::new(),
            last_suggest: None,
        }
    }

    pub fn size(&self) -> usize {
        self.runes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runes.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn string(&self) -> String {
        self.runes.iter().collect()
    }

    pub fn prompt_length(&self) -> u16 {
        self.prompt_length
    }

    pub fn set_prompt_length(&mut self, cols: u16) {
        self.prompt_length = cols;
    }

    pub fn set_term_width(&mut self, cols: u16) {
        self.term_width = cols;
    }

    pub fn set_color(&mut self, color: &str) {
        self.color = color.to_string();
    }

    /// Columns occupied by `runes[..n]`, offset by the prompt.
    fn cols_at(&self, n: usize) -> usize {
        self.prompt_length as usize + self.runes[..n].iter().map(|&c| rune_width(c)).sum::<usize>()
    }

    /// Display columns of the runes before the cursor, without the
    /// prompt offset. Used to reconcile the model against a real
    /// cursor-position report.
    pub fn cursor_display_cols(&self) -> usize {
        self.runes[..self.cursor].iter().map(|&c| rune_width(c)).sum()
    }

    /// Zero the buffer without emitting any repaint bytes. Used when the
    /// on-screen text should stay (e.g. a submitted prompt line).
    pub fn reset(&mut self) {
        self.runes.clear();
        self.cursor = 0;
        self.last_suggest = None;
    }

    /// Consume an input burst and return the repaint byte stream.
    ///
    /// Backspace deletes before the cursor, CSI C/D move the cursor,
    /// CSI A/B are swallowed (history navigation would destroy the edit
    /// line), printables insert at the cursor (append when the cursor is
    /// at the end). Other controls are dropped.
    pub fn write(&mut self, data: &[u8]) -> Vec<u8> {
        let old_cursor_cols = self.cols_at(self.cursor);
        let old_total_cols = self.cols_at(self.runes.len());

        let mut rest = data;
        while let Some((len, kind)) = classify(rest) {
            match kind {
                ByteKind::C0("BS") | ByteKind::C0("DEL") => {
                    if self.cursor > 0 {
                        self.cursor -= 1;
                        self.runes.remove(self.cursor);
                    }
                }
                ByteKind::Csi("CUF") => {
                    if self.cursor < self.runes.len() {
                        self.cursor += 1;
                    }
                }
                ByteKind::Csi("CUB") => {
                    self.cursor = self.cursor.saturating_sub(1);
                }
                // Up/down would swap in shell history underneath us.
                ByteKind::Csi("CUU") | ByteKind::Csi("CUD") => {}
                ByteKind::Printable(c) => {
                    if c == '\r' || c == '\n' {
                        // handled by the multiplexer before it reaches us
                    } else if self.cursor == self.runes.len() {
                        self.runes.push(c);
                        self.cursor += 1;
                    } else {
                        self.runes.insert(self.cursor, c);
                        self.cursor += 1;
                    }
                }
                _ => {}
            }
            rest = &rest[len..];
        }

        self.repaint(old_cursor_cols, old_total_cols)
    }

    fn repaint(&self, old_cursor_cols: usize, old_total_cols: usize) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::new();
        let width = self.term_width as usize;
        let new_total_cols = self.cols_at(self.runes.len());
        let new_cursor_cols = self.cols_at(self.cursor);
        let content: String = self.runes.iter().collect();

        if width == 0 {
            // Degenerate geometry: repaint in place and walk back with CUB.
            out.extend_from_slice(b"\r");
            cuf(&mut out, self.prompt_length as usize);
            out.extend_from_slice(self.color.as_bytes());
            out.extend_from_slice(content.as_bytes());
            out.extend_from_slice(b"\x1b[K");
            cub(&mut out, new_total_cols - new_cursor_cols);
            return out;
        }

        // Move from the old cursor position to the start of the region.
        out.extend_from_slice(b"\r");
        cuu(&mut out, old_cursor_cols / width);

        cuf(&mut out, self.prompt_length as usize);
        out.extend_from_slice(self.color.as_bytes());
        out.extend_from_slice(content.as_bytes());

        // Force the wrap when the content ends exactly at column zero,
        // otherwise the terminal defers it and our row math is off by one.
        let end_row = new_total_cols / width;
        if new_total_cols > 0 && new_total_cols % width == 0 {
            out.extend_from_slice(b"\r\n");
        }

        if new_total_cols < old_total_cols {
            out.extend_from_slice(b"\x1b[K");
            if old_total_cols / width > end_row {
                out.extend_from_slice(b"\x1b[J");
            }
        }

        // Reposition to the insertion point.
        let cursor_row = new_cursor_cols / width;
        let cursor_col = new_cursor_cols % width;
        out.extend_from_slice(b"\r");
        cuu(&mut out, end_row.saturating_sub(cursor_row));
        cuf(&mut out, cursor_col);

        out
    }

    /// Paint the buffer as spaces so the user sees it disappear, then
    /// zero it. The cursor returns to the start of the region.
    pub fn clear(&mut self) -> Vec<u8> {
        let width = self.term_width as usize;
        let total_cols = self.cols_at(self.runes.len());
        let cursor_cols = self.cols_at(self.cursor);
        let mut out: Vec<u8> = Vec::new();

        out.extend_from_slice(b"\r");
        if width > 0 {
            cuu(&mut out, cursor_cols / width);
        }
        cuf(&mut out, self.prompt_length as usize);
        let blank_cols = total_cols - self.prompt_length as usize;
        out.extend_from_slice(" ".repeat(blank_cols).as_bytes());
        out.extend_from_slice(b"\r");
        if width > 0 {
            cuu(&mut out, total_cols / width);
        }
        cuf(&mut out, self.prompt_length as usize);

        self.runes.clear();
        self.cursor = 0;
        out
    }

    /// Paint `text` in the autosuggest color starting `jump_forward`
    /// columns right of the cursor, remembering the geometry for a later
    /// `clear_last`. Cross-line overlays are not attempted: when the
    /// overlay would start at or past the terminal edge, nothing is
    /// painted.
    pub fn write_autosuggest(&mut self, text: &str, jump_forward: u16, color: &str) -> Vec<u8> {
        if text.is_empty() {
            return Vec::new();
        }
        let start_col = self.cols_at(self.cursor) + jump_forward as usize;
        if self.term_width > 0 && start_col >= self.term_width as usize {
            return Vec::new();
        }

        let mut out: Vec<u8> = Vec::new();
        out.extend_from_slice(b"\x1b7");
        cuf(&mut out, jump_forward as usize);
        out.extend_from_slice(color.as_bytes());
        out.extend_from_slice(text.as_bytes());
        out.extend_from_slice(b"\x1b[0m\x1b8");

        self.last_suggest = Some((text.chars().count(), jump_forward));
        out
    }

    /// Repaint the last autosuggest overlay as spaces.
    pub fn clear_last(&mut self, color: &str) -> Vec<u8> {
        let Some((len, jump)) = self.last_suggest.take() else {
            return Vec::new();
        };
        let mut out: Vec<u8> = Vec::new();
        out.extend_from_slice(b"\x1b7");
        cuf(&mut out, jump as usize);
        out.extend_from_slice(" ".repeat(len).as_bytes());
        out.extend_from_slice(color.as_bytes());
        out.extend_from_slice(b"\x1b8");
        out
    }

    /// The user typed the first rune of the overlay: the painted text is
    /// already correct, the anchor moved with the cursor, only the
    /// remembered length shrinks. No repaint needed.
    pub fn eat_autosuggest_rune(&mut self) {
        if let Some((len, jump)) = self.last_suggest {
            if len <= 1 {
                self.last_suggest = None;
            } else {
                self.last_suggest = Some((len - 1, jump));
            }
        }
    }

    pub fn has_suggest_overlay(&self) -> bool {
        self.last_suggest.is_some()
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn cuu(out: &mut Vec<u8>, n: usize) {
    if n > 0 {
        out.extend_from_slice(format!("\x1b[{n}A").as_bytes());
    }
}

fn cuf(out: &mut Vec<u8>, n: usize) {
    if n > 0 {
        out.extend_from_slice(format!("\x1b[{n}C").as_bytes());
    }
}

fn cub(out: &mut Vec<u8>, n: usize) {
    if n > 0 {
        out.extend_from_slice(format!("\x1b[{n}D").as_bytes());
    }
}
