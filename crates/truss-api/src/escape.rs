// ── Key escaping ──
//
// Raw keys may contain characters that are reserved in the path syntax.
// Each reserved character is written as `\XX`, the two-digit lowercase hex
// code of the character. The backslash itself is reserved, so escaping and
// unescaping are exact inverses.

use std::fmt::Write;

const RESERVED: [char; 7] = ['\\', '.', '$', '#', '[', ']', '/'];

/// Escape a raw key for use as a path segment.
///
/// `"a/b"` becomes `"a\2fb"`.
pub fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        if RESERVED.contains(&c) {
            // Reserved characters are all ASCII, so two hex digits suffice.
            let _ = write!(out, "\\{:02x}", u32::from(c));
        } else {
            out.push(c);
        }
    }
    out
}

/// Reverse [`escape_key`].
///
/// A backslash not followed by two hex digits is kept verbatim.
pub fn unescape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut rest = key;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];
        match tail.get(..2).and_then(decode_pair) {
            Some(c) => {
                out.push(c);
                rest = &tail[2..];
            }
            None => {
                out.push('\\');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_pair(hex: &str) -> Option<char> {
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u8::from_str_radix(hex, 16).ok().map(char::from)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn escapes_slash() {
        assert_eq!(escape_key("a/b"), "a\\2fb");
        assert_eq!(unescape_key("a\\2fb"), "a/b");
    }

    #[test]
    fn escapes_every_reserved_character() {
        assert_eq!(escape_key("\\.$#[]/"), "\\5c\\2e\\24\\23\\5b\\5d\\2f");
    }

    #[test]
    fn plain_keys_are_untouched() {
        assert_eq!(escape_key("users"), "users");
        assert_eq!(unescape_key("users"), "users");
        assert_eq!(escape_key(""), "");
    }

    #[test]
    fn round_trips_mixed_keys() {
        let keys = [
            "a/b",
            "\\",
            "\\2f",
            "..$$##",
            "[x]/[y]",
            "ünïcödé.key",
            "trailing\\",
            "a.b.c/d$e#f[g]h\\i",
        ];
        for key in keys {
            assert_eq!(unescape_key(&escape_key(key)), key, "round trip of {key:?}");
        }
    }

    #[test]
    fn unescape_keeps_dangling_backslash() {
        assert_eq!(unescape_key("a\\"), "a\\");
        assert_eq!(unescape_key("a\\zz"), "a\\zz");
    }
}
