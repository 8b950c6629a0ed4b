//! Text processing utilities.

use std::sync::LazyLock;

use regex::Regex;

static RE_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\p{L}\p{N}_]+").unwrap());

/// Count whitespace-separated words.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Approximate token count: `ceil(words * 0.75)`.
pub fn estimate_tokens(text: &str) -> usize {
    let words = word_count(text);
    (words * 3).div_ceil(4)
}

/// Lower-cased alphanumeric terms, in order of appearance.
pub fn terms(text: &str) -> Vec<String> {
    RE_WORD
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Replace every character outside `[A-Za-z0-9_]` with `_`.
pub fn sanitize_identifier(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("one"), 1);
        assert_eq!(estimate_tokens("Sentence one."), 2);
        assert_eq!(estimate_tokens("one two three four"), 3);
        assert_eq!(estimate_tokens("a b c d e"), 4);
    }

    #[test]
    fn test_terms() {
        assert_eq!(
            terms("Hello, World! foo_bar 42"),
            vec!["hello", "world", "foo_bar", "42"]
        );
        assert!(terms("... !!!").is_empty());
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("user@x.com_My KB"), "user_x_com_My_KB");
        assert_eq!(sanitize_identifier("ok_123"), "ok_123");
        assert_eq!(sanitize_identifier("ü"), "_");
    }
}
