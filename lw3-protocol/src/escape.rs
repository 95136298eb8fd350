//! Escaping of control characters inside values.
//!
//! The characters `\ { } # % ( )` and CR, LF, TAB are reserved by the line
//! grammar. They are written as a backslash followed by the character itself,
//! or by `r`, `n`, `t` for the three whitespace controls.

/// Escapes every reserved character in `value`.
///
/// The input is scanned once, so a backslash introduced by escaping is never
/// escaped again.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + value.len() / 8);
    for c in value.chars() {
        match c {
            '\\' | '{' | '}' | '#' | '%' | '(' | ')' => {
                out.push('\\');
                out.push(c);
            }
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverses [`escape`].
///
/// Unknown escape sequences and a trailing lone backslash are kept verbatim.
pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(next @ ('\\' | '{' | '}' | '#' | '%' | '(' | ')')) => out.push(next),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Returns true if `value` contains a character [`escape`] would rewrite.
pub fn needs_escape(value: &str) -> bool {
    value
        .chars()
        .any(|c| matches!(c, '\\' | '{' | '}' | '#' | '%' | '(' | ')' | '\r' | '\n' | '\t'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_escape_table() {
        assert_eq!(escape("a\\b"), "a\\\\b");
        assert_eq!(escape("{x}"), "\\{x\\}");
        assert_eq!(escape("#%()"), "\\#\\%\\(\\)");
        assert_eq!(escape("l1\nl2\r\t"), "l1\\nl2\\r\\t");
        assert_eq!(escape("plain text"), "plain text");
    }

    #[test]
    fn test_unescape_table() {
        assert_eq!(unescape("sample\\nvalue"), "sample\nvalue");
        assert_eq!(unescape("\\{\\}\\#\\%\\(\\)"), "{}#%()");
        assert_eq!(unescape("a\\\\nb"), "a\\nb");
    }

    #[test]
    fn test_unescape_tolerates_unknown_sequences() {
        assert_eq!(unescape("a\\qb"), "a\\qb");
        assert_eq!(unescape("end\\"), "end\\");
    }

    #[test]
    fn test_needs_escape() {
        assert!(needs_escape("a(b)"));
        assert!(needs_escape("line\n"));
        assert!(!needs_escape("Hello World 1.5"));
    }

    proptest! {
        #[test]
        fn prop_roundtrip(s in any::<String>()) {
            prop_assert_eq!(unescape(&escape(&s)), s);
        }

        #[test]
        fn prop_double_roundtrip(s in any::<String>()) {
            let twice = escape(&escape(&s));
            prop_assert_eq!(unescape(&unescape(&twice)), s);
        }

        #[test]
        fn prop_escaped_has_no_raw_controls(s in any::<String>()) {
            let escaped = escape(&s);
            prop_assert!(!escaped.contains('\n'));
            prop_assert!(!escaped.contains('\r'));
            prop_assert!(!escaped.contains('\t'));
        }
    }
}
