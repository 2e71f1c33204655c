use anyhow::{Context, Result};
use std::path::PathBuf;

/// Data directory for config, database, certs and logs.
///
/// `MCPPROXY_DATA` overrides; otherwise `~/.mcpproxy`.
pub fn data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os("MCPPROXY_DATA") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    Ok(dirs::home_dir()
        .context("Could not determine home directory")?
        .join(".mcpproxy"))
}

/// Find the largest byte index <= `index` that is a valid char boundary.
pub fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Truncate `s` to at most `max_bytes` bytes at a UTF-8 boundary, appending
/// `suffix` if anything was cut. Returns whether truncation happened.
pub fn truncate_bytes(s: &str, max_bytes: usize, suffix: &str) -> (String, bool) {
    if s.len() <= max_bytes {
        return (s.to_string(), false);
    }
    let cut = floor_char_boundary(s, max_bytes);
    (format!("{}{}", &s[..cut], suffix), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_char_boundary_ascii() {
        assert_eq!(floor_char_boundary("hello", 3), 3);
        assert_eq!(floor_char_boundary("hello", 100), 5);
        assert_eq!(floor_char_boundary("", 5), 0);
    }

    #[test]
    fn floor_char_boundary_multibyte() {
        // Each emoji is 4 bytes
        let s = "a\u{1F600}b";
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(floor_char_boundary(s, 5), 5);
    }

    #[test]
    fn truncate_bytes_short_string_untouched() {
        let (out, cut) = truncate_bytes("short", 100, "...");
        assert_eq!(out, "short");
        assert!(!cut);
    }

    #[test]
    fn truncate_bytes_cuts_at_boundary() {
        let (out, cut) = truncate_bytes("a\u{1F600}b", 2, "...[truncated]");
        assert_eq!(out, "a...[truncated]");
        assert!(cut);
    }
}
