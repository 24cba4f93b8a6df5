use crate::block::{BlockTag, HistoryBlock};
use remora_ansi::sanitize;
use remora_llm::ShellCall;
use std::sync::Mutex;

/// Append-only session log. One mutex covers appends, structured
/// tool-call records, and iteration; the multiplexer loop is the only
/// writer, background completion tasks read it to assemble prompts.
pub struct HistoryStore {
    blocks: Mutex<Vec<HistoryBlock>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(Vec::new()),
        }
    }

    /// Append text, extending the tail block when the tag matches.
    pub fn append(&self, tag: BlockTag, text: &str) {
        let mut blocks = self.blocks.lock().unwrap();
        match blocks.last_mut() {
            Some(tail) if tail.tag == tag && tail.shell_call.is_none() && tail.function_name.is_none() => {
                tail.append_content(text);
            }
            _ => blocks.push(HistoryBlock::new(tag, text)),
        }
    }

    /// Record an LLM-issued function call as a dedicated block with empty
    /// content and the structured fields set.
    pub fn add_function_call(&self, name: &str, args: &str, call_id: &str) {
        let mut blocks = self.blocks.lock().unwrap();
        let mut block = HistoryBlock::new(BlockTag::LlmOutput, "");
        block.function_name = Some(name.to_string());
        block.function_args = Some(args.to_string());
        block.call_id = Some(call_id.to_string());
        blocks.push(block);
    }

    /// Append function output, coalescing only when tag, name and call id
    /// all match the tail.
    pub fn append_function_output(&self, name: &str, call_id: &str, text: &str) {
        let mut blocks = self.blocks.lock().unwrap();
        match blocks.last_mut() {
            Some(tail)
                if tail.tag == BlockTag::FunctionOutput
                    && tail.function_name.as_deref() == Some(name)
                    && tail.call_id.as_deref() == Some(call_id) =>
            {
                tail.append_content(text);
            }
            _ => {
                let mut block = HistoryBlock::new(BlockTag::FunctionOutput, text);
                block.function_name = Some(name.to_string());
                block.call_id = Some(call_id.to_string());
                blocks.push(block);
            }
        }
    }

    /// Record an LLM-issued structured shell call.
    pub fn add_shell_call(&self, call: &ShellCall) {
        let mut blocks = self.blocks.lock().unwrap();
        let mut block = HistoryBlock::new(BlockTag::LlmOutput, "");
        block.call_id = Some(call.call_id.clone());
        block.shell_call = Some(call.clone());
        blocks.push(block);
    }

    /// Append the output of a structured shell call, coalescing on call id.
    pub fn append_shell_call_output(&self, call_id: &str, text: &str) {
        let mut blocks = self.blocks.lock().unwrap();
        match blocks.last_mut() {
            Some(tail)
                if tail.tag == BlockTag::ToolOutput && tail.call_id.as_deref() == Some(call_id) =>
            {
                tail.append_content(text);
            }
            _ => {
                let mut block = HistoryBlock::new(BlockTag::ToolOutput, text);
                block.call_id = Some(call_id.to_string());
                blocks.push(block);
            }
        }
    }

    /// Visit blocks newest first until `visit` returns false. The visitor
    /// may update per-block token caches.
    pub fn for_each_newest_first<F>(&self, mut visit: F)
    where
        F: FnMut(&mut HistoryBlock) -> bool,
    {
        let mut blocks = self.blocks.lock().unwrap();
        for block in blocks.iter_mut().rev() {
            if !visit(block) {
                break;
            }
        }
    }

    /// Sanitized recent excerpt in chronological order. Each block's
    /// content is ANSI-stripped, non-printable-filtered, and truncated to
    /// `truncate_per_block` bytes; the newest-first scan stops before any
    /// block that would overflow the remaining `max_bytes` (no partial
    /// blocks).
    pub fn get_last_n_bytes(
        &self,
        max_bytes: usize,
        truncate_per_block: usize,
    ) -> Vec<(BlockTag, String)> {
        let blocks = self.blocks.lock().unwrap();
        let mut out = Vec::new();
        let mut remaining = max_bytes;
        for block in blocks.iter().rev() {
            let mut text = sanitize(block.content().as_bytes());
            if text.len() > truncate_per_block {
                let mut end = truncate_per_block;
                while end > 0 && !text.is_char_boundary(end) {
                    end -= 1;
                }
                text.truncate(end);
            }
            if text.len() > remaining {
                break;
            }
            remaining -= text.len();
            out.push((block.tag, text));
        }
        out.reverse();
        out
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distinct_tags_open_new_blocks() {
        let store = HistoryStore::new();
        store.append(BlockTag::UserPrompt, "p1");
        store.append(BlockTag::ShellInput, "s1");
        store.append(BlockTag::ShellOutput, "o1");
        store.append(BlockTag::LlmOutput, "l1");

        let excerpt = store.get_last_n_bytes(256, 512);
        assert_eq!(excerpt.len(), 4);
        assert_eq!(excerpt[0], (BlockTag::UserPrompt, "p1".to_string()));
        assert_eq!(excerpt[1], (BlockTag::ShellInput, "s1".to_string()));
        assert_eq!(excerpt[2], (BlockTag::ShellOutput, "o1".to_string()));
        assert_eq!(excerpt[3], (BlockTag::LlmOutput, "l1".to_string()));
    }

    #[test]
    fn test_same_tag_coalesces() {
        let store = HistoryStore::new();
        store.append(BlockTag::ShellOutput, "one");
        store.append(BlockTag::ShellOutput, " two");
        assert_eq!(store.block_count(), 1);
        let excerpt = store.get_last_n_bytes(256, 512);
        assert_eq!(excerpt[0].1, "one two");
    }

    #[test]
    fn test_budget_stops_before_oversized_block() {
        let store = HistoryStore::new();
        store.append(BlockTag::UserPrompt, &"x".repeat(201));
        store.append(BlockTag::LlmOutput, "l2");

        let excerpt = store.get_last_n_bytes(14, 512);
        assert_eq!(excerpt.len(), 1);
        assert_eq!(excerpt[0], (BlockTag::LlmOutput, "l2".to_string()));
    }

    #[test]
    fn test_coalesced_block_returned_whole() {
        let store = HistoryStore::new();
        store.append(BlockTag::UserPrompt, &"x".repeat(201));
        store.append(BlockTag::LlmOutput, "l2");
        store.append(BlockTag::LlmOutput, "more llm ᐅ");

        let excerpt = store.get_last_n_bytes(24, 512);
        assert_eq!(excerpt.len(), 1);
        assert_eq!(excerpt[0], (BlockTag::LlmOutput, "l2more llm ᐅ".to_string()));
    }

    #[test]
    fn test_per_block_truncation_respects_char_boundary() {
        let store = HistoryStore::new();
        store.append(BlockTag::ShellOutput, "ab🐠cd");
        let excerpt = store.get_last_n_bytes(100, 3);
        // 3 bytes would split the fish; falls back to "ab"
        assert_eq!(excerpt[0].1, "ab");
    }

    #[test]
    fn test_content_sanitized() {
        let store = HistoryStore::new();
        store.append(BlockTag::ShellOutput, "\x1b[31mred\x1b[0m\x07 text");
        let excerpt = store.get_last_n_bytes(100, 512);
        assert_eq!(excerpt[0].1, "red text");
    }

    #[test]
    fn test_function_output_coalesces_on_name_and_id() {
        let store = HistoryStore::new();
        store.append_function_output("command", "call_1", "line one\n");
        store.append_function_output("command", "call_1", "line two\n");
        assert_eq!(store.block_count(), 1);

        // different call id opens a new block
        store.append_function_output("command", "call_2", "other\n");
        assert_eq!(store.block_count(), 2);

        // different name too
        store.append_function_output("user_input", "call_2", "q\n");
        assert_eq!(store.block_count(), 3);
    }

    #[test]
    fn test_function_call_block_not_extended_by_plain_append() {
        let store = HistoryStore::new();
        store.add_function_call("command", "{\"cmd\": \"ls\"}", "call_1");
        store.append(BlockTag::LlmOutput, "text");
        assert_eq!(store.block_count(), 2);
    }

    #[test]
    fn test_shell_call_round_trip() {
        let store = HistoryStore::new();
        let call = ShellCall {
            call_id: "sc_1".to_string(),
            commands: vec!["ls".to_string()],
            max_output_length: Some(1024),
        };
        store.add_shell_call(&call);
        store.append_shell_call_output("sc_1", "file.txt\n");
        store.append_shell_call_output("sc_1", "exit code 0\n");
        assert_eq!(store.block_count(), 2);
    }

    #[test]
    fn test_newest_first_iteration_stops() {
        let store = HistoryStore::new();
        store.append(BlockTag::ShellInput, "a");
        store.append(BlockTag::ShellOutput, "b");
        store.append(BlockTag::LlmOutput, "c");
        let mut seen = Vec::new();
        store.for_each_newest_first(|b| {
            seen.push(b.tag);
            seen.len() < 2
        });
        assert_eq!(seen, vec![BlockTag::LlmOutput, BlockTag::ShellOutput]);
    }
}
