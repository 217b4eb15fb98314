//! `:matches` wildcard patterns.
//!
//! "In the ':matches' match type, the wildcard '*' matches zero or more
//! characters and '?' matches a single character; '\\' removes the special
//! meaning of the next character." ([RFC 5228](https://www.rfc-editor.org/rfc/rfc5228.html))

use super::Comparator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Char(char),
    /// `?`
    One,
    /// `*`
    Many,
}

/// A compiled wildcard pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    tokens: Vec<Token>,
}

/// Compile a pattern. Compilation cannot fail: a trailing backslash escapes
/// nothing and is dropped.
pub fn compile(pattern: &str) -> Pattern {
    let mut tokens = Vec::with_capacity(pattern.len());
    let mut chars = pattern.chars();

    while let Some(ch) = chars.next() {
        tokens.push(match ch {
            '*' => Token::Many,
            '?' => Token::One,
            '\\' => match chars.next() {
                Some(escaped) => Token::Char(escaped),
                None => break,
            },
            ch => Token::Char(ch),
        });
    }

    Pattern { tokens }
}

impl Pattern {
    /// Match `value` against the pattern, comparing characters through
    /// `comparator`.
    pub fn matches(&self, value: &str, comparator: &dyn Comparator) -> bool {
        let value: Vec<char> = value.chars().collect();

        // Two-pointer scan with backtracking to the most recent `*`.
        let mut v = 0;
        let mut t = 0;
        let mut star: Option<(usize, usize)> = None;

        while v < value.len() {
            match self.tokens.get(t) {
                Some(Token::Many) => {
                    star = Some((t, v));
                    t += 1;
                }
                Some(Token::One) => {
                    v += 1;
                    t += 1;
                }
                Some(Token::Char(ch)) if comparator.char_match(value[v], *ch) => {
                    v += 1;
                    t += 1;
                }
                _ => match star {
                    Some((star_t, star_v)) => {
                        t = star_t + 1;
                        v = star_v + 1;
                        star = Some((star_t, star_v + 1));
                    }
                    None => return false,
                },
            }
        }

        self.tokens[t..].iter().all(|token| *token == Token::Many)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::{ASCII_CASEMAP, OCTET};

    fn matches(pattern: &str, value: &str) -> bool {
        compile(pattern).matches(value, &ASCII_CASEMAP)
    }

    #[test]
    fn test_literal() {
        assert!(matches("hello", "Hello"));
        assert!(!matches("hello", "hello!"));
        assert!(matches("", ""));
        assert!(!matches("", "x"));
    }

    #[test]
    fn test_star() {
        assert!(matches("Re: *", "Re: hello"));
        assert!(matches("Re: *", "Re: "));
        assert!(!matches("Re: *", "Fwd: hello"));
        assert!(matches("*", ""));
        assert!(matches("*spam*", "contains SPAM somewhere"));
        assert!(matches("a*b*c", "aXbYc"));
        assert!(!matches("a*b*c", "aXcYb"));
    }

    #[test]
    fn test_question_mark() {
        assert!(matches("h?llo", "hallo"));
        assert!(!matches("h?llo", "hllo"));
    }

    #[test]
    fn test_escape() {
        assert!(matches("100\\%", "100%"));
        assert!(matches("a\\*b", "a*b"));
        assert!(!matches("a\\*b", "aXb"));
        // A trailing backslash escapes nothing.
        assert!(matches("abc\\", "abc"));
    }

    #[test]
    fn test_octet_pattern_is_case_sensitive() {
        assert!(!compile("Re: *").matches("RE: x", &OCTET));
        assert!(compile("Re: *").matches("Re: x", &OCTET));
    }

    #[test]
    fn test_backtracking() {
        assert!(matches("*ab", "aab"));
        assert!(matches("*aab", "aaab"));
        assert!(!matches("*ab", "aba"));
    }
}
