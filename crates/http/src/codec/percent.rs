//! Percent-encoding and query-string parsing.
//!
//! Encoding covers every byte outside the RFC 3986 unreserved set. Decoding
//! accepts both hex cases and is context sensitive about `+`: a literal plus
//! in path components, a space in query and form components. Malformed escape
//! sequences pass through untouched rather than failing the whole string.

/// Percent-encodes every byte of `input` outside `[A-Za-z0-9-._~]`.
pub fn encode(input: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0f) as usize] as char);
        }
    }
    out
}

/// Decodes a path component: `+` stays a literal plus.
pub fn decode_path(input: &str) -> String {
    decode_bytes(input.as_bytes(), false)
}

/// Decodes a query or form component: `+` becomes a space.
pub fn decode_query_component(input: &str) -> String {
    decode_bytes(input.as_bytes(), true)
}

fn decode_bytes(input: &[u8], plus_is_space: bool) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'%' => {
                match (input.get(i + 1).and_then(hex_val), input.get(i + 2).and_then(hex_val)) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' if plus_is_space => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: &u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Parses a raw query string into ordered name/value pairs.
///
/// Pairs split on `&`, names and values percent-decode in query context, and
/// a `[]` suffix on a name is stripped so repeated `name[]` parameters merge
/// under `name`.
pub fn parse_query(raw: &str) -> Vec<(String, String)> {
    parse_pairs(raw.as_bytes())
}

/// Parses an `application/x-www-form-urlencoded` body, same rules as
/// [`parse_query`].
pub fn parse_form(raw: &[u8]) -> Vec<(String, String)> {
    parse_pairs(raw)
}

fn parse_pairs(raw: &[u8]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for piece in raw.split(|&b| b == b'&') {
        if piece.is_empty() {
            continue;
        }
        let (name, value) = match piece.iter().position(|&b| b == b'=') {
            Some(eq) => (&piece[..eq], &piece[eq + 1..]),
            None => (piece, &[][..]),
        };
        let mut name = decode_bytes(name, true);
        if let Some(stripped) = name.strip_suffix("[]") {
            name = stripped.to_owned();
        }
        if name.is_empty() {
            continue;
        }
        pairs.push((name, decode_bytes(value, true)));
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_unreserved_passthrough() {
        assert_eq!(encode("AZaz09-._~"), "AZaz09-._~");
        assert_eq!(encode("a b/c"), "a%20b%2Fc");
        assert_eq!(encode("föö"), "f%C3%B6%C3%B6");
    }

    #[test]
    fn decode_accepts_both_hex_cases() {
        assert_eq!(decode_path("%2f%2F"), "//");
        assert_eq!(decode_query_component("%C3%B6"), "ö");
    }

    #[test]
    fn plus_depends_on_context() {
        assert_eq!(decode_path("a+b"), "a+b");
        assert_eq!(decode_query_component("a+b"), "a b");
    }

    #[test]
    fn malformed_escapes_pass_through() {
        assert_eq!(decode_path("100%"), "100%");
        assert_eq!(decode_path("%zz"), "%zz");
        assert_eq!(decode_path("%4"), "%4");
    }

    #[test]
    fn query_pairs_keep_order_and_strip_brackets() {
        let pairs = parse_query("a=1&b=two+words&a[]=3&=skipped&flag");
        assert_eq!(
            pairs,
            vec![
                ("a".to_owned(), "1".to_owned()),
                ("b".to_owned(), "two words".to_owned()),
                ("a".to_owned(), "3".to_owned()),
                ("flag".to_owned(), String::new()),
            ]
        );
    }

    #[test]
    fn round_trip() {
        let original = "päth with spaces & symbols?";
        assert_eq!(decode_query_component(&encode(original)), original);
    }
}
