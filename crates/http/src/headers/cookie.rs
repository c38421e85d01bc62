//! Cookie parsing and serialization.
//!
//! The request parser accepts the RFC 2965 style some old clients still
//! send: `$Path`, `$Domain` and `$Expires` entries attach as attributes to
//! the cookie named most recently before them, and `$Version` is skipped.

use std::collections::HashMap;
use std::time::SystemTime;

/// One cookie received from a client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookie {
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub expires: Option<String>,
}

/// Parses a request `Cookie` header into a name → cookie map.
pub fn parse_request_cookies(raw: &str) -> HashMap<String, Cookie> {
    let mut cookies: HashMap<String, Cookie> = HashMap::new();
    let mut last_name: Option<String> = None;

    for piece in raw.split(';') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let (name, value) = match piece.split_once('=') {
            Some((n, v)) => (n.trim(), unquote(v.trim())),
            None => (piece, String::new()),
        };

        if let Some(attribute) = name.strip_prefix('$') {
            if attribute.eq_ignore_ascii_case("version") {
                continue;
            }
            let Some(last) = last_name.as_ref().and_then(|n| cookies.get_mut(n)) else {
                continue;
            };
            if attribute.eq_ignore_ascii_case("path") {
                last.path = Some(value);
            } else if attribute.eq_ignore_ascii_case("domain") {
                last.domain = Some(value);
            } else if attribute.eq_ignore_ascii_case("expires") {
                last.expires = Some(value);
            }
            continue;
        }

        cookies.insert(name.to_owned(), Cookie { value, ..Cookie::default() });
        last_name = Some(name.to_owned());
    }

    cookies
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_owned()
}

/// A `Set-Cookie` header under construction.
#[derive(Debug, Clone, Default)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub expires: Option<SystemTime>,
    pub http_only: bool,
}

impl SetCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into(), ..Self::default() }
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn expires(mut self, at: SystemTime) -> Self {
        self.expires = Some(at);
        self
    }

    pub fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    /// Serializes the cookie as a `Set-Cookie` header value.
    pub fn header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(expires) = self.expires {
            out.push_str("; Expires=");
            out.push_str(&httpdate::fmt_http_date(expires));
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn plain_pairs() {
        let cookies = parse_request_cookies("session=abc123; theme=dark");
        assert_eq!(cookies["session"].value, "abc123");
        assert_eq!(cookies["theme"].value, "dark");
    }

    #[test]
    fn quoted_values_unquote() {
        let cookies = parse_request_cookies(r#"pref="dark mode"; raw=plain"#);
        assert_eq!(cookies["pref"].value, "dark mode");
        assert_eq!(cookies["raw"].value, "plain");
    }

    #[test]
    fn dollar_attributes_attach_to_previous_cookie() {
        let cookies =
            parse_request_cookies("$Version=1; lang=en; $Path=/docs; $Domain=example.com; other=x");
        let lang = &cookies["lang"];
        assert_eq!(lang.value, "en");
        assert_eq!(lang.path.as_deref(), Some("/docs"));
        assert_eq!(lang.domain.as_deref(), Some("example.com"));
        let other = &cookies["other"];
        assert_eq!(other.path, None);
    }

    #[test]
    fn leading_dollar_attribute_without_cookie_is_skipped() {
        let cookies = parse_request_cookies("$Path=/x; a=1");
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies["a"].value, "1");
    }

    #[test]
    fn set_cookie_serialization() {
        let cookie = SetCookie::new("sid", "42")
            .domain("example.com")
            .path("/")
            .expires(SystemTime::UNIX_EPOCH + Duration::from_secs(784111777))
            .http_only();
        assert_eq!(
            cookie.header_value(),
            "sid=42; Domain=example.com; Path=/; Expires=Sun, 06 Nov 1994 08:49:37 GMT; HttpOnly"
        );
    }
}
