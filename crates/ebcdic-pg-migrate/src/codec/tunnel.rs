//! Escape-tunneling between legacy-charset-safe text and full Unicode.
//!
//! Characters the legacy charset cannot represent travel through the
//! source data as `\<hex-codepoint>\` escape sequences, with `\\` for a
//! literal backslash. [`unescape`] resolves escapes to real characters;
//! [`escape_for_check`] re-derives the escaped form for stability
//! validation.

use super::LegacyCharset;
use std::borrow::Cow;

const ESCAPE: char = '\\';

/// Resolve tunneled escapes in `input`.
///
/// Returns the resolved text and whether anything actually changed.
/// Short-circuits without allocation when no backslash is present. An
/// unterminated trailing escape is preserved verbatim, as is a delimited
/// run that does not parse as a hex code point.
pub fn unescape(input: &str) -> (Cow<'_, str>, bool) {
    if !input.contains(ESCAPE) {
        return (Cow::Borrowed(input), false);
    }

    let mut out = String::with_capacity(input.len());
    let mut buf = String::new();
    let mut in_escape = false;
    let mut changed = false;

    for c in input.chars() {
        if !in_escape {
            if c == ESCAPE {
                in_escape = true;
                buf.clear();
            } else {
                out.push(c);
            }
        } else if c == ESCAPE {
            if buf.is_empty() {
                // "\\" is a literal backslash
                out.push(ESCAPE);
                changed = true;
            } else {
                match u32::from_str_radix(&buf, 16).ok().and_then(char::from_u32) {
                    Some(ch) => {
                        out.push(ch);
                        changed = true;
                    }
                    None => {
                        // Not a code point; keep the delimited run as-is
                        out.push(ESCAPE);
                        out.push_str(&buf);
                        out.push(ESCAPE);
                    }
                }
            }
            in_escape = false;
        } else {
            buf.push(c);
        }
    }

    if in_escape {
        // Unterminated trailing escape: emit verbatim, never drop input
        out.push(ESCAPE);
        out.push_str(&buf);
    }

    (Cow::Owned(out), changed)
}

/// Near-inverse of [`unescape`], used only for stability validation.
///
/// Every code point the legacy charset can represent passes through;
/// everything else is emitted as an uppercase hex escape. A literal
/// backslash is always escaped.
pub fn escape_for_check(input: &str, charset: &LegacyCharset) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c == ESCAPE {
            out.push_str("\\\\");
        } else if charset.can_encode_char(c) {
            out.push(c);
        } else {
            out.push_str(&format!("\\{:X}\\", c as u32));
        }
    }
    out
}
