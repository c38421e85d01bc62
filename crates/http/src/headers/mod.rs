//! Typed views over the request and response header maps.
//!
//! Headers are stored untyped in `http::HeaderMap`; these modules parse the
//! fields the engine and handlers care about into typed values on demand, and
//! serialize typed values back. Unrecognized headers just stay in the map.

pub mod accept;
pub mod cookie;
pub mod range;
pub mod typed;

use http::{HeaderMap, HeaderValue, header};

/// Splits a comma-separated list header, respecting quoted strings.
pub fn split_list(raw: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let bytes = raw.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b',' if !in_quotes => {
                let item = raw[start..i].trim();
                if !item.is_empty() {
                    items.push(item);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = raw[start..].trim();
    if !tail.is_empty() {
        items.push(tail);
    }
    items
}

/// Whether a `Connection` header in `headers` carries the given token.
pub fn has_connection_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v: &HeaderValue| v.to_str().ok())
        .flat_map(split_list)
        .any(|t| t.eq_ignore_ascii_case(token))
}

/// Whether the peer asked for the connection to be closed.
pub fn connection_close(headers: &HeaderMap) -> bool {
    has_connection_token(headers, "close")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_respects_quotes() {
        assert_eq!(split_list(r#"a, "b, c" , d"#), vec!["a", r#""b, c""#, "d"]);
        assert_eq!(split_list(""), Vec::<&str>::new());
        assert_eq!(split_list("single"), vec!["single"]);
    }

    #[test]
    fn connection_token_scan() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        assert!(!connection_close(&headers));
        assert!(has_connection_token(&headers, "Keep-Alive"));

        headers.insert(header::CONNECTION, "Close".parse().unwrap());
        assert!(connection_close(&headers));
    }
}
