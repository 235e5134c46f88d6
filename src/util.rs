//! Utility functions for IRC text handling.
//!
//! Helpers for safe truncation and splitting of message bodies against
//! byte limits without breaking multi-byte UTF-8 codepoints.

/// Truncates a string to at most `max_bytes` bytes without breaking
/// a multi-byte UTF-8 codepoint at the end.
///
/// # Examples
///
/// ```
/// use slirc_client::util::truncate_utf8_safe;
///
/// assert_eq!(truncate_utf8_safe("hello world", 5), "hello");
/// assert_eq!(truncate_utf8_safe("100€", 4), "100"); // € is 3 bytes
/// assert_eq!(truncate_utf8_safe("hi", 10), "hi");
/// ```
#[inline]
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Splits text into pieces of at most `max_bytes` bytes each, preferring
/// to break at whitespace and falling back to a codepoint-safe hard break
/// when no word boundary fits.
///
/// # Examples
///
/// ```
/// use slirc_client::util::split_words;
///
/// let pieces: Vec<_> = split_words("hello big world", 9).collect();
/// assert_eq!(pieces, vec!["hello big", " world"]);
/// ```
pub fn split_words(s: &str, max_bytes: usize) -> impl Iterator<Item = &str> {
    SplitWords {
        remaining: if s.is_empty() { None } else { Some(s) },
        max_bytes,
    }
}

struct SplitWords<'a> {
    remaining: Option<&'a str>,
    max_bytes: usize,
}

impl<'a> Iterator for SplitWords<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.max_bytes == 0 {
            return None;
        }
        let s = self.remaining?;
        if s.len() <= self.max_bytes {
            self.remaining = None;
            return Some(s);
        }

        // Prefer the rightmost whitespace boundary that still fits.
        let mut split = 0;
        for (idx, ch) in s.rmatch_indices(char::is_whitespace) {
            if idx <= self.max_bytes {
                if idx + ch.len() <= self.max_bytes {
                    split = idx + ch.len();
                } else {
                    split = idx;
                }
                break;
            }
        }
        if split == 0 {
            split = truncate_utf8_safe(s, self.max_bytes).len();
        }
        if split == 0 {
            // A single codepoint wider than the budget; emit it whole rather
            // than loop forever.
            split = s.chars().next().map(char::len_utf8).unwrap_or(s.len());
        }

        let (head, tail) = s.split_at(split);
        self.remaining = if tail.is_empty() { None } else { Some(tail) };
        Some(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_utf8_safe() {
        assert_eq!(truncate_utf8_safe("hello", 10), "hello");
        assert_eq!(truncate_utf8_safe("hello", 3), "hel");
        assert_eq!(truncate_utf8_safe("日本語", 3), "日");
        assert_eq!(truncate_utf8_safe("日本語", 4), "日");
        assert_eq!(truncate_utf8_safe("", 5), "");
        assert_eq!(truncate_utf8_safe("hello", 0), "");
    }

    #[test]
    fn test_split_words_short() {
        let pieces: Vec<_> = split_words("short", 100).collect();
        assert_eq!(pieces, vec!["short"]);
    }

    #[test]
    fn test_split_words_word_boundary() {
        let pieces: Vec<_> = split_words("one two three", 8).collect();
        assert!(pieces.iter().all(|p| p.len() <= 8));
        assert_eq!(pieces.concat(), "one two three");
    }

    #[test]
    fn test_split_words_hard_break() {
        let pieces: Vec<_> = split_words("abcdefghij", 4).collect();
        assert_eq!(pieces, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_split_words_multibyte() {
        let pieces: Vec<_> = split_words("日本語テスト", 7).collect();
        assert!(pieces.iter().all(|p| p.len() <= 7));
        assert_eq!(pieces.concat(), "日本語テスト");
    }

    #[test]
    fn test_split_words_empty() {
        assert_eq!(split_words("", 5).count(), 0);
    }
}
