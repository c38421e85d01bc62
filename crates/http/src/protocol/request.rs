//! The request model handed to handlers.
//!
//! [`RequestHead`] is the thin wrapper the decoder produces around
//! `http::Request<()>`; [`Request`] is what handlers see after the engine has
//! read the body: resolved scheme/host/port, a percent-decoded path, lazily
//! parsed query and form parameters, file uploads, and the effective client
//! address.

use std::collections::HashMap;
use std::net::IpAddr;

use http::request::Parts;
use http::{HeaderMap, Method, Request as HttpRequest, Uri, Version, header};
use once_cell::sync::OnceCell;

use crate::codec::percent;
use crate::headers::cookie::{self, Cookie};
use crate::protocol::body::{BodyStore, FileUpload};

/// The URL scheme a connection was accepted under.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// The default port for this scheme.
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// The parsed head of an HTTP request.
#[derive(Debug)]
pub struct RequestHead {
    inner: HttpRequest<()>,
}

impl AsRef<HttpRequest<()>> for RequestHead {
    fn as_ref(&self) -> &HttpRequest<()> {
        &self.inner
    }
}

impl RequestHead {
    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Whether this request may carry a body at all.
    ///
    /// Only POST does in this engine; GET and HEAD bodies are drained and
    /// discarded to keep the connection framing intact.
    pub fn expects_body(&self) -> bool {
        self.method() == Method::POST
    }

    /// The host and optional port the request is addressed to.
    ///
    /// An absolute-form request target wins over the `Host` header.
    pub fn target_host(&self) -> Option<(String, Option<u16>)> {
        if let Some(host) = self.uri().host() {
            return Some((host.to_ascii_lowercase(), self.uri().port_u16()));
        }

        let value = self.headers().get(header::HOST)?.to_str().ok()?;
        let (host, port) = match value.rsplit_once(':') {
            Some((h, p)) if !h.is_empty() && p.chars().all(|c| c.is_ascii_digit()) => {
                (h, p.parse::<u16>().ok())
            }
            _ => (value, None),
        };
        Some((host.trim().to_ascii_lowercase(), port))
    }
}

impl From<Parts> for RequestHead {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: HttpRequest::from_parts(parts, ()) }
    }
}

impl From<HttpRequest<()>> for RequestHead {
    #[inline]
    fn from(inner: HttpRequest<()>) -> Self {
        Self { inner }
    }
}

/// A fully read HTTP request.
///
/// Query and form accessors are lazy: the raw query string and the stored
/// body are parsed on first access and cached.
pub struct Request {
    head: RequestHead,
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
    raw_query: Option<String>,
    rest_path: String,
    peer_addr: IpAddr,
    body: BodyStore,
    uploads: Vec<FileUpload>,
    query_cache: OnceCell<Vec<(String, String)>>,
    form_cache: OnceCell<Vec<(String, String)>>,
    cookie_cache: OnceCell<HashMap<String, Cookie>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", self.method())
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl Request {
    /// Assembles a request from the parsed head and the stored body.
    ///
    /// `form_fields` carries the text fields of a multipart body, which the
    /// engine extracts while streaming parts; urlencoded bodies stay unparsed
    /// until a form accessor is called.
    pub fn new(
        head: RequestHead,
        scheme: Scheme,
        peer_addr: IpAddr,
        body: BodyStore,
        uploads: Vec<FileUpload>,
        form_fields: Option<Vec<(String, String)>>,
    ) -> Self {
        let (host, port) = match head.target_host() {
            Some((host, port)) => (host, port.unwrap_or_else(|| scheme.default_port())),
            None => (String::new(), scheme.default_port()),
        };
        let path = percent::decode_path(head.uri().path());
        let raw_query = head.uri().query().map(str::to_owned);

        let form_cache = OnceCell::new();
        if let Some(fields) = form_fields {
            // multipart text fields were collected during body streaming
            let _ = form_cache.set(fields);
        }

        Self {
            rest_path: path.clone(),
            head,
            scheme,
            host,
            port,
            path,
            raw_query,
            peer_addr,
            body,
            uploads,
            query_cache: OnceCell::new(),
            form_cache,
            cookie_cache: OnceCell::new(),
        }
    }

    pub fn method(&self) -> &Method {
        self.head.method()
    }

    pub fn version(&self) -> Version {
        self.head.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.head.headers()
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The host the request is addressed to, lowercased; empty when the
    /// client sent neither an absolute target nor a Host header (HTTP/1.0).
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The percent-decoded request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw, undecoded query string, without the leading `?`.
    pub fn raw_query(&self) -> Option<&str> {
        self.raw_query.as_deref()
    }

    /// The IP the connection was accepted from.
    pub fn peer_addr(&self) -> IpAddr {
        self.peer_addr
    }

    /// The effective client IP: the first `X-Forwarded-For` entry when
    /// present and parseable, the peer address otherwise.
    pub fn client_addr(&self) -> IpAddr {
        self.headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
            .unwrap_or(self.peer_addr)
    }

    /// The path tail left after the matched hook's prefix was stripped.
    ///
    /// Until dispatch assigns one, this is the full decoded path.
    pub fn rest_path(&self) -> &str {
        &self.rest_path
    }

    /// Records the residual path computed by hook resolution.
    pub fn set_rest_path(&mut self, rest: String) {
        self.rest_path = rest;
    }

    fn query_pairs(&self) -> &[(String, String)] {
        self.query_cache.get_or_init(|| match &self.raw_query {
            Some(raw) => percent::parse_query(raw),
            None => Vec::new(),
        })
    }

    /// The last value sent for the query parameter `name`.
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query_pairs().iter().rev().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// All values sent for the query parameter `name`, in order.
    ///
    /// Parameters written `name[]` in the raw query are merged under `name`.
    pub fn query_all(&self, name: &str) -> Vec<&str> {
        self.query_pairs().iter().filter(|(k, _)| k == name).map(|(_, v)| v.as_str()).collect()
    }

    fn form_pairs(&self) -> &[(String, String)] {
        self.form_cache.get_or_init(|| percent::parse_form(&self.body.read_all()))
    }

    /// The last value sent for the form field `name`.
    pub fn form(&self, name: &str) -> Option<&str> {
        self.form_pairs().iter().rev().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// All values sent for the form field `name`, in order.
    pub fn form_all(&self, name: &str) -> Vec<&str> {
        self.form_pairs().iter().filter(|(k, _)| k == name).map(|(_, v)| v.as_str()).collect()
    }

    /// The uploaded file posted under the form field `name`.
    pub fn file(&self, name: &str) -> Option<&FileUpload> {
        self.uploads.iter().find(|u| u.field_name() == name)
    }

    /// All uploaded files, in the order they appeared in the body.
    pub fn files(&self) -> &[FileUpload] {
        &self.uploads
    }

    /// The cookies the client sent, parsed from the `Cookie` header.
    pub fn cookies(&self) -> &HashMap<String, Cookie> {
        self.cookie_cache.get_or_init(|| {
            self.headers()
                .get(header::COOKIE)
                .and_then(|v| v.to_str().ok())
                .map(cookie::parse_request_cookies)
                .unwrap_or_default()
        })
    }

    /// The value of the cookie `name`, if the client sent it.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies().get(name).map(|c| c.value.as_str())
    }

    /// The stored request body.
    pub fn body(&self) -> &BodyStore {
        &self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn request_for(target: &str, host: Option<&str>) -> Request {
        let mut builder = HttpRequest::builder().method(Method::GET).uri(target).version(Version::HTTP_11);
        if let Some(host) = host {
            builder = builder.header(header::HOST, host);
        }
        let head = RequestHead::from(builder.body(()).unwrap());
        Request::new(
            head,
            Scheme::Http,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            BodyStore::Empty,
            Vec::new(),
            None,
        )
    }

    #[test]
    fn host_from_header() {
        let req = request_for("/index.html", Some("example.com:8080"));
        assert_eq!(req.host(), "example.com");
        assert_eq!(req.port(), 8080);
        assert_eq!(req.path(), "/index.html");
    }

    #[test]
    fn host_from_absolute_target_wins() {
        let req = request_for("http://other.example.com/x", Some("example.com"));
        assert_eq!(req.host(), "other.example.com");
        assert_eq!(req.port(), 80);
    }

    #[test]
    fn query_last_wins_and_all_preserves_order() {
        let req = request_for("/search?a=1&b=2&a=3", Some("x"));
        assert_eq!(req.query("a"), Some("3"));
        assert_eq!(req.query_all("a"), vec!["1", "3"]);
        assert_eq!(req.query("missing"), None);
    }

    #[test]
    fn query_bracket_names_merge() {
        let req = request_for("/l?item[]=x&item[]=y%20z", Some("x"));
        assert_eq!(req.query_all("item"), vec!["x", "y z"]);
        assert_eq!(req.query("item"), Some("y z"));
    }

    #[test]
    fn path_is_percent_decoded_with_literal_plus() {
        let req = request_for("/a%20b+c", Some("x"));
        assert_eq!(req.path(), "/a b+c");
    }

    #[test]
    fn forwarded_for_overrides_peer() {
        let head = RequestHead::from(
            HttpRequest::builder()
                .uri("/")
                .header(header::HOST, "x")
                .header("X-Forwarded-For", "10.1.2.3, 192.168.0.1")
                .body(())
                .unwrap(),
        );
        let req = Request::new(
            head,
            Scheme::Http,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            BodyStore::Empty,
            Vec::new(),
            None,
        );
        assert_eq!(req.client_addr(), "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn form_parses_urlencoded_body() {
        let head = RequestHead::from(
            HttpRequest::builder().method(Method::POST).uri("/f").header(header::HOST, "x").body(()).unwrap(),
        );
        let body = BodyStore::Memory(bytes::Bytes::from_static(b"name=alice&tag[]=a&tag[]=b+c"));
        let req = Request::new(head, Scheme::Http, IpAddr::V4(Ipv4Addr::LOCALHOST), body, Vec::new(), None);
        assert_eq!(req.form("name"), Some("alice"));
        assert_eq!(req.form_all("tag"), vec!["a", "b c"]);
    }
}
