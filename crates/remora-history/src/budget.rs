//! Assembles a (prompt, history) pair that fits a model's context
//! window. History is charged newest-first until the budget runs out;
//! per-block token counts are memoized on the block keyed by encoder
//! name and content length.

use crate::block::TokenCache;
use crate::store::HistoryStore;
use anyhow::{bail, Result};
use remora_llm::{HistoryEntry, Tokenizer};

/// Chat-protocol framing cost charged before anything else.
const BASELINE_TOKENS: usize = 3;
/// System messages larger than this are almost always a template bug.
const SYSTEM_WARN_TOKENS: usize = 1028;

#[derive(Debug, Clone, Copy)]
pub struct BudgetLimits {
    pub max_prompt_tokens: usize,
    pub max_history_block_tokens: usize,
    pub max_total_tokens: usize,
}

#[derive(Debug)]
pub struct AssembledHistory {
    /// Possibly-truncated prompt.
    pub prompt: String,
    /// Retained history in chronological order.
    pub history: Vec<HistoryEntry>,
    pub used_tokens: usize,
}

/// Per-message framing overhead for the model family.
fn tokens_per_message(model: &str) -> usize {
    if model.starts_with("gpt-3.5-turbo-0301") {
        4
    } else {
        3
    }
}

const TOKENS_PER_NAME: usize = 1;

pub fn assemble(
    prompt: &str,
    system_message: &str,
    functions_json: &str,
    store: &HistoryStore,
    model: &str,
    tokenizer: &dyn Tokenizer,
    limits: BudgetLimits,
) -> Result<AssembledHistory> {
    let mut used = BASELINE_TOKENS;

    let prompt = if tokenizer.count(prompt) > limits.max_prompt_tokens {
        tokenizer.truncate(prompt, limits.max_prompt_tokens)
    } else {
        prompt.to_string()
    };
    used += tokenizer.count(&prompt);

    let system_tokens = tokenizer.count(system_message);
    if system_tokens > SYSTEM_WARN_TOKENS {
        tracing::warn!(system_tokens, "system message is unusually large");
    }
    used += system_tokens;
    used += tokenizer.count(functions_json);

    if used > limits.max_total_tokens {
        bail!(
            "system message + prompt ({} tokens) exceed the model window ({} tokens)",
            used,
            limits.max_total_tokens
        );
    }

    let per_message = tokens_per_message(model);
    let encoder = tokenizer.name().to_string();
    let char_ceiling = limits.max_history_block_tokens.saturating_mul(4);

    let mut retained: Vec<HistoryEntry> = Vec::new();
    store.for_each_newest_first(|block| {
        let content_len = block.content().len();
        let (content, content_tokens) = match block.cached_tokens(&encoder) {
            Some(cache) => (cache.truncated.clone(), cache.token_count),
            None => {
                // cap pathological blocks before encoding
                let capped = if content_len > char_ceiling {
                    &block.content()[..ceil_char_boundary(block.content(), char_ceiling)]
                } else {
                    block.content()
                };
                let truncated = tokenizer.truncate(capped, limits.max_history_block_tokens);
                let count = tokenizer.count(&truncated);
                block.store_tokens(
                    &encoder,
                    TokenCache {
                        input_len: content_len,
                        token_count: count,
                        truncated: truncated.clone(),
                    },
                );
                (truncated, count)
            }
        };

        let role = block.tag.role();
        let mut cost = per_message + tokenizer.count(role.as_str()) + content_tokens;
        if let Some(ref name) = block.function_name {
            cost += TOKENS_PER_NAME + tokenizer.count(name);
        }
        if let Some(ref args) = block.function_args {
            cost += tokenizer.count(args);
        }

        if used + cost > limits.max_total_tokens {
            return false;
        }
        used += cost;

        retained.push(HistoryEntry {
            role,
            content,
            name: block.function_name.clone(),
            arguments: block.function_args.clone(),
            tool_call_id: block.call_id.clone(),
        });
        true
    });
    retained.reverse();

    Ok(AssembledHistory {
        prompt,
        history: retained,
        used_tokens: used,
    })
}

fn ceil_char_boundary(s: &str, mut at: usize) -> usize {
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockTag;
    use remora_llm::{ChatRole, HeuristicTokenizer};

    fn limits(total: usize) -> BudgetLimits {
        BudgetLimits {
            max_prompt_tokens: 64,
            max_history_block_tokens: 32,
            max_total_tokens: total,
        }
    }

    #[test]
    fn test_assemble_keeps_chronological_order() {
        let store = HistoryStore::new();
        store.append(BlockTag::ShellInput, "ls");
        store.append(BlockTag::ShellOutput, "file.txt");
        store.append(BlockTag::UserPrompt, "what is that file?");

        let out = assemble(
            "explain",
            "you are a shell assistant",
            "",
            &store,
            "gpt-4o",
            &HeuristicTokenizer,
            limits(10_000),
        )
        .unwrap();

        assert_eq!(out.history.len(), 3);
        assert_eq!(out.history[0].content, "ls");
        assert_eq!(out.history[0].role, ChatRole::User);
        assert_eq!(out.history[1].content, "file.txt");
        assert_eq!(out.history[2].content, "what is that file?");
    }

    #[test]
    fn test_budget_inequality_holds() {
        let tok = HeuristicTokenizer;
        let store = HistoryStore::new();
        for i in 0..50 {
            store.append(BlockTag::ShellOutput, &format!("output line {i}\n"));
            store.append(BlockTag::ShellInput, &format!("cmd{i}"));
        }
        let lim = limits(200);
        let out = assemble("prompt", "sys", "", &store, "gpt-4o", &tok, lim).unwrap();
        assert!(out.used_tokens <= lim.max_total_tokens);
        for entry in &out.history {
            assert!(tok.count(&entry.content) <= lim.max_history_block_tokens);
        }
    }

    #[test]
    fn test_newest_blocks_retained_first() {
        let store = HistoryStore::new();
        store.append(BlockTag::ShellInput, &"old ".repeat(40));
        store.append(BlockTag::ShellOutput, "newest");

        // budget only fits one small block past the fixed costs
        let out = assemble(
            "p",
            "",
            "",
            &store,
            "gpt-4o",
            &HeuristicTokenizer,
            limits(15),
        )
        .unwrap();
        assert_eq!(out.history.len(), 1);
        assert_eq!(out.history[0].content, "newest");
    }

    #[test]
    fn test_prompt_truncated_to_budget() {
        let store = HistoryStore::new();
        let long_prompt = "word ".repeat(200);
        let out = assemble(
            &long_prompt,
            "",
            "",
            &store,
            "gpt-4o",
            &HeuristicTokenizer,
            limits(10_000),
        )
        .unwrap();
        assert!(HeuristicTokenizer.count(&out.prompt) <= 64);
    }

    #[test]
    fn test_oversized_system_plus_prompt_fails() {
        let store = HistoryStore::new();
        let err = assemble(
            "prompt",
            &"system ".repeat(100),
            "",
            &store,
            "gpt-4o",
            &HeuristicTokenizer,
            limits(20),
        )
        .unwrap_err();
        assert!(err.to_string().contains("exceed the model window"));
    }

    #[test]
    fn test_function_blocks_carry_name_and_args() {
        let store = HistoryStore::new();
        store.add_function_call("command", "{\"cmd\": \"ls\"}", "call_1");
        store.append_function_output("command", "call_1", "file.txt\nexit code 0");

        let out = assemble(
            "next",
            "",
            "[]",
            &store,
            "gpt-4o",
            &HeuristicTokenizer,
            limits(10_000),
        )
        .unwrap();

        assert_eq!(out.history.len(), 2);
        assert_eq!(out.history[0].role, ChatRole::Assistant);
        assert_eq!(out.history[0].name.as_deref(), Some("command"));
        assert_eq!(out.history[0].arguments.as_deref(), Some("{\"cmd\": \"ls\"}"));
        assert_eq!(out.history[1].role, ChatRole::Function);
        assert_eq!(out.history[1].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_token_cache_reused_across_assemblies() {
        let store = HistoryStore::new();
        store.append(BlockTag::ShellOutput, "some stable output");

        let lim = limits(10_000);
        assemble("p", "", "", &store, "gpt-4o", &HeuristicTokenizer, lim).unwrap();

        // second assembly hits the cache path
        let mut cache_seen = false;
        store.for_each_newest_first(|b| {
            cache_seen = b.cached_tokens("heuristic-4b").is_some();
            false
        });
        assert!(cache_seen);

        let out = assemble("p", "", "", &store, "gpt-4o", &HeuristicTokenizer, lim).unwrap();
        assert_eq!(out.history[0].content, "some stable output");
    }
}
