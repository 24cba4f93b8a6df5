use anyhow::Result;
use async_trait::async_trait;
use remora_llm::StreamSink;
use std::os::fd::{BorrowedFd, RawFd};

/// Writes bytes straight to the parent terminal. The terminal is in raw
/// mode for the whole session, so callers are responsible for `\r\n`
/// discipline; `StyleWriter` handles it for streamed LLM text.
#[derive(Clone, Copy)]
pub struct TermWriter {
    fd: RawFd,
}

impl TermWriter {
    pub fn stdout() -> Self {
        Self { fd: 1 }
    }

    /// Write somewhere else (tests point this at /dev/null).
    pub fn to_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    pub fn write_raw(&self, data: &[u8]) {
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let mut rest = data;
        while !rest.is_empty() {
            match nix::unistd::write(fd, rest) {
                Ok(0) | Err(_) => break,
                Ok(n) => rest = &rest[n..],
            }
        }
    }

    pub fn write_str(&self, s: &str) {
        self.write_raw(s.as_bytes());
    }
}

/// Style-aware sink for streamed completions: opens with the answer
/// color, converts `\n` to `\r\n` for the raw-mode terminal, and resets
/// the color when closed.
pub struct StyleWriter {
    out: TermWriter,
    color: String,
    opened: bool,
}

impl StyleWriter {
    pub fn new(out: TermWriter, color: &str) -> Self {
        Self {
            out,
            color: color.to_string(),
            opened: false,
        }
    }

    pub fn close(&mut self) {
        if self.opened {
            self.out.write_str("\x1b[0m\r\n");
            self.opened = false;
        }
    }
}

#[async_trait]
impl StreamSink for StyleWriter {
    async fn write_text(&mut self, chunk: &str) -> Result<()> {
        if !self.opened {
            self.out.write_str(&self.color);
            self.opened = true;
        }
        self.out.write_str(&chunk.replace('\n', "\r\n"));
        Ok(())
    }
}

impl Drop for StyleWriter {
    fn drop(&mut self) {
        self.close();
    }
}
