//! Token estimation
//!
//! No tokenizer is bundled. Every backend shares the same heuristic of
//! roughly one token per four characters of text.

/// Characters per estimated token
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of `chars` characters of text
pub fn estimate_tokens(chars: usize) -> u64 {
    chars.div_ceil(CHARS_PER_TOKEN) as u64
}

/// Estimate the token count of a string
pub fn estimate_text_tokens(text: &str) -> u64 {
    estimate_tokens(text.len())
}
