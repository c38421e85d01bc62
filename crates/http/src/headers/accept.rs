//! Accept-style list headers with quality weights.

use http::{HeaderMap, header};

use crate::headers::split_list;

/// One entry of an Accept-style header, with its quality weight.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityItem {
    pub value: String,
    pub q: f32,
}

/// Parses a comma-separated list with optional `;q=` weights.
///
/// Entries sort descending by quality with a stable sort, so equal weights
/// keep their wire order. Entries with `q=0` are dropped entirely: a client
/// writing `gzip;q=0` is refusing that encoding, not ranking it last.
pub fn parse_quality_list(raw: &str) -> Vec<QualityItem> {
    let mut items = Vec::new();
    for entry in split_list(raw) {
        let mut value = entry;
        let mut q = 1.0f32;
        if let Some((head, params)) = entry.split_once(';') {
            value = head.trim();
            for param in params.split(';') {
                if let Some((name, weight)) = param.split_once('=') {
                    if name.trim().eq_ignore_ascii_case("q") {
                        q = weight.trim().parse::<f32>().unwrap_or(1.0).clamp(0.0, 1.0);
                    }
                }
            }
        }
        if value.is_empty() || q == 0.0 {
            continue;
        }
        items.push(QualityItem { value: value.to_owned(), q });
    }
    items.sort_by(|a, b| b.q.partial_cmp(&a.q).unwrap_or(std::cmp::Ordering::Equal));
    items
}

/// The content codings a request can accept.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Deflate,
    Compress,
}

impl Encoding {
    fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("identity") {
            Some(Encoding::Identity)
        } else if token.eq_ignore_ascii_case("gzip") || token.eq_ignore_ascii_case("x-gzip") {
            Some(Encoding::Gzip)
        } else if token.eq_ignore_ascii_case("deflate") {
            Some(Encoding::Deflate)
        } else if token.eq_ignore_ascii_case("compress") || token.eq_ignore_ascii_case("x-compress") {
            Some(Encoding::Compress)
        } else {
            None
        }
    }
}

/// The encodings the client accepts, best first. Unknown tokens are skipped.
pub fn accept_encodings(headers: &HeaderMap) -> Vec<Encoding> {
    let Some(raw) = headers.get(header::ACCEPT_ENCODING).and_then(|v| v.to_str().ok()) else {
        return Vec::new();
    };
    parse_quality_list(raw).iter().filter_map(|item| Encoding::from_token(&item.value)).collect()
}

/// Whether the client advertised gzip with a non-zero quality.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    accept_encodings(headers).contains(&Encoding::Gzip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn sorts_by_quality_stable() {
        let items = parse_quality_list("a;q=0.5, b, c;q=0.5, d;q=0.8");
        let order: Vec<&str> = items.iter().map(|i| i.value.as_str()).collect();
        assert_eq!(order, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn zero_quality_entries_are_dropped() {
        let items = parse_quality_list("gzip;q=0, identity");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].value, "identity");
    }

    #[test]
    fn gzip_refusal_wins_over_presence() {
        assert!(!accepts_gzip(&headers_with("gzip;q=0, identity")));
        assert!(accepts_gzip(&headers_with("gzip, deflate")));
        assert!(accepts_gzip(&headers_with("deflate;q=0.5, gzip;q=0.2")));
        assert!(!accepts_gzip(&headers_with("deflate, br")));
        assert!(!accepts_gzip(&HeaderMap::new()));
    }

    #[test]
    fn unknown_weights_default_to_one() {
        let items = parse_quality_list("gzip;q=banana");
        assert_eq!(items[0].q, 1.0);
    }
}
