use crate::activity::TRUNCATION_SUFFIX;
use crate::config::TokenizerConfig;
use crate::utils::{floor_char_boundary, truncate_bytes};

/// Rough chars-per-token ratio; good enough for a budget ceiling.
const CHARS_PER_TOKEN: usize = 4;

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Cap a tool response: first a UTF-8-safe byte cap, then (when the
/// estimator is enabled) a token-budget cap. Returns the capped text and
/// whether anything was cut; the suffix is appended exactly once.
pub fn truncate_response(
    text: &str,
    byte_limit: usize,
    tokenizer: &TokenizerConfig,
) -> (String, bool) {
    let (mut out, mut cut) = truncate_bytes(text, byte_limit, TRUNCATION_SUFFIX);

    if tokenizer.enabled {
        let body = out.strip_suffix(TRUNCATION_SUFFIX).unwrap_or(&out);
        if estimate_tokens(body) > tokenizer.max_tokens {
            let budget_chars = tokenizer.max_tokens.saturating_mul(CHARS_PER_TOKEN);
            let byte_idx = body
                .char_indices()
                .nth(budget_chars)
                .map_or(body.len(), |(idx, _)| idx);
            let cutoff = floor_char_boundary(body, byte_idx);
            out = format!("{}{}", &body[..cutoff], TRUNCATION_SUFFIX);
            cut = true;
        }
    }

    (out, cut)
}
