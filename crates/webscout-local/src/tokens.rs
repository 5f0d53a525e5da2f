//! Model-token accounting for the refinement budget.

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

fn bpe() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    // o200k_base builds from embedded tables; no IO.
    BPE.get_or_init(|| tiktoken_rs::o200k_base().expect("embedded o200k_base tables"))
}

/// Number of model tokens in `text`.
pub fn count(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    bpe().encode_with_special_tokens(text).len()
}

/// Truncate `text` to at most `max_tokens` tokens.
///
/// Returns the decoded text and the number of tokens actually kept. Byte-level
/// BPE can split a codepoint across two tokens, so when the prefix does not
/// decode cleanly the cut backs off one token at a time until it does; the
/// result is always valid text, never a byte slice.
pub fn truncate(text: &str, max_tokens: usize) -> (String, usize) {
    if max_tokens == 0 {
        return (String::new(), 0);
    }
    let toks = bpe().encode_with_special_tokens(text);
    if toks.len() <= max_tokens {
        return (text.to_string(), toks.len());
    }
    let mut end = max_tokens;
    while end > 0 {
        if let Ok(s) = bpe().decode(toks[..end].to_vec()) {
            return (s, end);
        }
        end -= 1;
    }
    (String::new(), 0)
}
