//! Token counting behind a narrow capability trait. The history cache
//! and token budgeter key on `name()`, so a model-exact encoder can be
//! dropped in without touching call sites.

pub trait Tokenizer: Send + Sync {
    fn name(&self) -> &str;

    /// Token count for `text`.
    fn count(&self, text: &str) -> usize;

    /// Longest prefix of `text` that fits in `max_tokens`.
    fn truncate(&self, text: &str, max_tokens: usize) -> String;
}

/// Byte-heuristic encoder: roughly four bytes per token, rounded up.
/// Close enough for budgeting across the model families we target.
pub struct HeuristicTokenizer;

const BYTES_PER_TOKEN: usize = 4;

impl Tokenizer for HeuristicTokenizer {
    fn name(&self) -> &str {
        "heuristic-4b"
    }

    fn count(&self, text: &str) -> usize {
        text.len().div_ceil(BYTES_PER_TOKEN)
    }

    fn truncate(&self, text: &str, max_tokens: usize) -> String {
        let max_bytes = max_tokens.saturating_mul(BYTES_PER_TOKEN);
        if text.len() <= max_bytes {
            return text.to_string();
        }
        // back off to a char boundary
        let mut end = max_bytes;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_rounds_up() {
        let t = HeuristicTokenizer;
        assert_eq!(t.count(""), 0);
        assert_eq!(t.count("abc"), 1);
        assert_eq!(t.count("abcd"), 1);
        assert_eq!(t.count("abcde"), 2);
    }

    #[test]
    fn test_truncate_fits() {
        let t = HeuristicTokenizer;
        assert_eq!(t.truncate("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_cuts_at_budget() {
        let t = HeuristicTokenizer;
        let out = t.truncate("abcdefghij", 2);
        assert_eq!(out, "abcdefgh");
        assert!(t.count(&out) <= 2);
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let t = HeuristicTokenizer;
        // each rune is 4 bytes; a 1-token budget keeps exactly one
        let text = "🐠🐠🐠";
        let out = t.truncate(text, 1);
        assert_eq!(out, "🐠");
    }
}
