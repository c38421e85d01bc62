//! The response model handlers build.
//!
//! A [`Response`] is a status, a header map, exactly one [`BodyProvider`], a
//! [`GzipPolicy`], and an optional cleanup callback that the engine runs once
//! the body has been fully written. How the body reaches the wire (plain,
//! gzipped, chunked, ranged, close-delimited) is the engine's decision, not
//! the response's.

use std::fmt::Write as _;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::pin::Pin;
use std::time::SystemTime;

use bytes::Bytes;
use futures::Stream;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use serde::Serialize;

use crate::headers::cookie::SetCookie;
use crate::headers::typed::{
    CacheDirective, ContentDisposition, EntityTag, format_cache_control, if_none_match_matches,
};
use crate::protocol::SendError;

/// A pull-based producer of body chunks.
///
/// The engine calls [`produce`](ChunkProducer::produce) until it returns
/// `Ok(None)`, then [`close`](ChunkProducer::close). Ownership moves into the
/// engine at write time, which is what enforces the produce-once contract.
pub trait ChunkProducer: Send {
    /// The next chunk, or `None` when the body is complete.
    fn produce(&mut self) -> io::Result<Option<Bytes>>;

    /// Called once after the last chunk, successful or not.
    fn close(&mut self) {}
}

impl<F> ChunkProducer for F
where
    F: FnMut() -> io::Result<Option<Bytes>> + Send,
{
    fn produce(&mut self) -> io::Result<Option<Bytes>> {
        self()
    }
}

/// A boxed asynchronous byte stream body.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// The body a response carries.
pub enum BodyProvider {
    /// No body
    Empty,
    /// A complete in-memory body
    Full(Bytes),
    /// A local file; seekable, so it supports ranges and gzip sampling
    File { file: std::fs::File, len: u64 },
    /// An asynchronous stream of chunks, length unknown
    Stream(ByteStream),
    /// A lazy pull-based chunk producer, length unknown
    Producer(Box<dyn ChunkProducer>),
}

impl std::fmt::Debug for BodyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodyProvider::Empty => f.write_str("Empty"),
            BodyProvider::Full(b) => write!(f, "Full({} bytes)", b.len()),
            BodyProvider::File { len, .. } => write!(f, "File({len} bytes)"),
            BodyProvider::Stream(_) => f.write_str("Stream"),
            BodyProvider::Producer(_) => f.write_str("Producer"),
        }
    }
}

impl BodyProvider {
    /// The body length, when known up front.
    pub fn known_len(&self) -> Option<u64> {
        match self {
            BodyProvider::Empty => Some(0),
            BodyProvider::Full(bytes) => Some(bytes.len() as u64),
            BodyProvider::File { len, .. } => Some(*len),
            BodyProvider::Stream(_) | BodyProvider::Producer(_) => None,
        }
    }

    /// Whether arbitrary subranges of the body can be produced.
    pub fn is_seekable(&self) -> bool {
        matches!(self, BodyProvider::Full(_) | BodyProvider::File { .. })
    }

    pub fn is_empty_body(&self) -> bool {
        matches!(self, BodyProvider::Empty)
    }
}

/// When the engine should gzip a response body.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum GzipPolicy {
    /// Compress when a trial compression of a sample pays off (the default)
    #[default]
    AutoDetect,
    /// Compress whenever the client accepts gzip
    Force,
    /// Never compress
    Never,
}

/// An HTTP response under construction by a handler.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: BodyProvider,
    gzip: GzipPolicy,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("body", &self.body)
            .field("gzip", &self.gzip)
            .finish_non_exhaustive()
    }
}

/// Whether a status code forbids a message body entirely.
pub fn status_forbids_body(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}

impl Response {
    fn with_body(status: StatusCode, body: BodyProvider) -> Self {
        Self { status, headers: HeaderMap::new(), body, gzip: GzipPolicy::default(), cleanup: None }
    }

    /// A 200 response with no body.
    pub fn empty() -> Self {
        Self::with_body(StatusCode::OK, BodyProvider::Empty)
    }

    /// A 302 redirect to `location`, marked uncacheable.
    pub fn redirect(location: &str) -> Self {
        let mut resp = Self::with_body(StatusCode::FOUND, BodyProvider::Empty);
        if let Ok(value) = HeaderValue::from_str(location) {
            resp.headers.insert(header::LOCATION, value);
        }
        resp.cache_control(&[CacheDirective::new("no-cache")])
    }

    /// A 304 Not Modified: no body, no Content-Type.
    pub fn not_modified() -> Self {
        Self::with_body(StatusCode::NOT_MODIFIED, BodyProvider::Empty)
    }

    /// An HTML error page for `status`, with an optional escaped message.
    pub fn error(status: StatusCode, message: Option<&str>) -> Self {
        let reason = status.canonical_reason().unwrap_or("Error");
        let mut page = String::with_capacity(256);
        let _ = write!(
            page,
            "<!DOCTYPE html>\n<html><head><title>{code} {reason}</title></head>\
             <body><h1>{code} {reason}</h1>",
            code = status.as_u16(),
        );
        if let Some(message) = message {
            let _ = write!(page, "<p>{}</p>", escape_html(message));
        }
        page.push_str("</body></html>\n");

        let mut resp = Self::with_body(status, BodyProvider::Full(Bytes::from(page)));
        resp.headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
        resp
    }

    /// A 200 response with the given body and content type.
    pub fn bytes(content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut resp = Self::with_body(StatusCode::OK, BodyProvider::Full(body.into()));
        resp.set_content_type(content_type);
        resp
    }

    /// A 200 `text/html` response.
    pub fn html(body: impl Into<Bytes>) -> Self {
        Self::bytes("text/html; charset=utf-8", body)
    }

    /// A 200 `text/plain` response.
    pub fn text(body: impl Into<Bytes>) -> Self {
        Self::bytes("text/plain; charset=utf-8", body)
    }

    /// A 200 `application/json` response serialized from `value`.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::bytes("application/json", body))
    }

    /// A 200 response streaming chunks from an asynchronous byte stream.
    pub fn stream(content_type: &str, stream: ByteStream) -> Self {
        let mut resp = Self::with_body(StatusCode::OK, BodyProvider::Stream(stream));
        resp.set_content_type(content_type);
        resp
    }

    /// A 200 response pulling chunks lazily from `producer`.
    pub fn producer(content_type: &str, producer: impl ChunkProducer + 'static) -> Self {
        let mut resp = Self::with_body(StatusCode::OK, BodyProvider::Producer(Box::new(producer)));
        resp.set_content_type(content_type);
        resp
    }

    /// A 200 response serving a local file.
    ///
    /// When `content_type` is `None` the type is guessed by sniffing the
    /// first KiB: any control byte outside TAB/LF/CR makes it
    /// `application/octet-stream`, otherwise `text/plain`. A `Last-Modified`
    /// header is set from the file's mtime when available.
    pub fn file(path: impl AsRef<Path>, content_type: Option<&str>) -> io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let metadata = file.metadata()?;
        let len = metadata.len();

        let content_type = match content_type {
            Some(ct) => ct.to_owned(),
            None => sniff_content_type(&mut file)?.to_owned(),
        };

        let mut resp = Self::with_body(StatusCode::OK, BodyProvider::File { file, len });
        resp.set_content_type(&content_type);
        if let Ok(modified) = metadata.modified() {
            if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified)) {
                resp.headers.insert(header::LAST_MODIFIED, value);
            }
        }
        if let Some(tag) = file_entity_tag(&metadata) {
            resp = resp.etag(&tag);
        }
        Ok(resp)
    }

    /// Serves a local file honoring `If-None-Match` and `If-Modified-Since`.
    ///
    /// The validators are checked in RFC 7232 precedence: when the client
    /// sent `If-None-Match` it alone decides, and the date check only runs
    /// for clients that sent no ETag. Answers 304 when the client's cached
    /// copy is still current.
    pub fn file_conditional(
        request_headers: &HeaderMap,
        path: impl AsRef<Path>,
        content_type: Option<&str>,
    ) -> io::Result<Self> {
        let metadata = std::fs::metadata(path.as_ref()).ok();

        if let Some(none_match) =
            request_headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok())
        {
            let current = metadata.as_ref().and_then(file_entity_tag);
            if current.is_some_and(|tag| if_none_match_matches(none_match, &tag)) {
                return Ok(Self::not_modified());
            }
        } else if let (Some(modified), Some(since)) = (
            metadata.as_ref().and_then(|m| m.modified().ok()),
            request_headers.get(header::IF_MODIFIED_SINCE),
        ) {
            if let Some(since) = since.to_str().ok().and_then(|s| httpdate::parse_http_date(s).ok()) {
                // mtimes carry sub-second precision the header cannot express
                if truncate_to_secs(modified) <= since {
                    return Ok(Self::not_modified());
                }
            }
        }
        Self::file(path, content_type)
    }

    /// Replaces the status code.
    ///
    /// Fails when the new status forbids a body but this response has one.
    pub fn with_status(mut self, status: StatusCode) -> Result<Self, SendError> {
        if status_forbids_body(status) && !self.body.is_empty_body() {
            return Err(SendError::body_forbidden(status));
        }
        self.status = status;
        Ok(self)
    }

    /// Adds a header, replacing any existing value.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a `Set-Cookie` header.
    pub fn set_cookie(mut self, cookie: &SetCookie) -> Self {
        if let Ok(value) = HeaderValue::from_str(&cookie.header_value()) {
            self.headers.append(header::SET_COOKIE, value);
        }
        self
    }

    /// Sets `Cache-Control` from an ordered directive list.
    pub fn cache_control(mut self, directives: &[CacheDirective]) -> Self {
        if let Ok(value) = HeaderValue::from_str(&format_cache_control(directives)) {
            self.headers.insert(header::CACHE_CONTROL, value);
        }
        self
    }

    /// Sets the `ETag` validator.
    pub fn etag(mut self, tag: &EntityTag) -> Self {
        if let Ok(value) = HeaderValue::from_str(&tag.to_string()) {
            self.headers.insert(header::ETAG, value);
        }
        self
    }

    /// Sets `Content-Disposition`, typically to suggest a download filename.
    pub fn content_disposition(mut self, disposition: &ContentDisposition) -> Self {
        if let Ok(value) = HeaderValue::from_str(&disposition.to_string()) {
            self.headers.insert(header::CONTENT_DISPOSITION, value);
        }
        self
    }

    /// Sets `Last-Modified`.
    pub fn last_modified(mut self, at: SystemTime) -> Self {
        if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(at)) {
            self.headers.insert(header::LAST_MODIFIED, value);
        }
        self
    }

    /// Sets the gzip policy for this response.
    pub fn gzip(mut self, policy: GzipPolicy) -> Self {
        self.gzip = policy;
        self
    }

    /// Marks the connection for closing after this response.
    pub fn connection_close(mut self) -> Self {
        self.headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        self
    }

    /// Registers a callback run once the body has been fully written.
    pub fn on_cleanup(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.cleanup = Some(Box::new(f));
        self
    }

    fn set_content_type(&mut self, content_type: &str) {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.headers.insert(header::CONTENT_TYPE, value);
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &BodyProvider {
        &self.body
    }

    pub fn gzip_policy(&self) -> GzipPolicy {
        self.gzip
    }

    /// Decomposes the response for writing; the body moves with it.
    pub fn into_parts(self) -> (StatusCode, HeaderMap, BodyProvider, GzipPolicy, Option<Box<dyn FnOnce() + Send>>) {
        (self.status, self.headers, self.body, self.gzip, self.cleanup)
    }
}

/// Strong validator for a plain file, derived from its mtime and length.
fn file_entity_tag(metadata: &std::fs::Metadata) -> Option<EntityTag> {
    let modified = metadata.modified().ok()?;
    let secs = modified.duration_since(SystemTime::UNIX_EPOCH).ok()?.as_secs();
    Some(EntityTag::strong(format!("{secs:x}-{:x}", metadata.len())))
}

fn truncate_to_secs(t: SystemTime) -> SystemTime {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(d.as_secs()),
        Err(_) => t,
    }
}

/// Sniffs a MIME type from the first KiB of `file`, restoring the cursor.
fn sniff_content_type(file: &mut std::fs::File) -> io::Result<&'static str> {
    let mut sample = [0u8; 1024];
    let mut read = 0;
    loop {
        match file.read(&mut sample[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        if read == sample.len() {
            break;
        }
    }
    file.seek(SeekFrom::Start(0))?;

    let binary = sample[..read].iter().any(|&b| b < 0x20 && !matches!(b, 9 | 10 | 13));
    Ok(if binary { "application/octet-stream" } else { "text/plain" })
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn error_page_escapes_message() {
        let resp = Response::error(StatusCode::NOT_FOUND, Some("no <such> page"));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        match resp.body() {
            BodyProvider::Full(bytes) => {
                let page = std::str::from_utf8(bytes).unwrap();
                assert!(page.contains("404 Not Found"));
                assert!(page.contains("no &lt;such&gt; page"));
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn status_body_conflict_is_rejected() {
        let err = Response::text("hi").with_status(StatusCode::NO_CONTENT).unwrap_err();
        assert!(matches!(err, SendError::BodyForbidden { .. }));

        let ok = Response::empty().with_status(StatusCode::NO_CONTENT);
        assert!(ok.is_ok());
    }

    #[test]
    fn redirect_is_uncacheable() {
        let resp = Response::redirect("/login");
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers().get(header::LOCATION).unwrap(), "/login");
        assert_eq!(resp.headers().get(header::CACHE_CONTROL).unwrap(), "no-cache");
        assert!(resp.body().is_empty_body());
    }

    #[test]
    fn typed_header_builders() {
        let resp = Response::text("x")
            .etag(&EntityTag::strong("v2"))
            .content_disposition(&ContentDisposition { filename: Some("a.txt".into()) })
            .set_cookie(&SetCookie::new("sid", "1").http_only());
        assert_eq!(resp.headers().get(header::ETAG).unwrap(), "\"v2\"");
        assert_eq!(
            resp.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"a.txt\""
        );
        assert_eq!(resp.headers().get(header::SET_COOKIE).unwrap(), "sid=1; HttpOnly");
    }

    #[test]
    fn not_modified_has_no_content_type() {
        let resp = Response::not_modified();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
        assert!(resp.headers().get(header::CONTENT_TYPE).is_none());
        assert!(resp.body().is_empty_body());
    }

    #[test]
    fn file_sniffs_binary_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::File::create(&path).unwrap().write_all(&[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a]).unwrap();

        let resp = Response::file(&path, None).unwrap();
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "application/octet-stream");
        assert_eq!(resp.body().known_len(), Some(7));
    }

    #[test]
    fn file_sniffs_text_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "line one\r\nline\ttwo\n").unwrap();

        let resp = Response::file(&path, None).unwrap();
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "text/plain");
    }

    #[test]
    fn file_carries_both_validators() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, "stable contents").unwrap();

        let resp = Response::file(&path, None).unwrap();
        assert!(resp.headers().get(header::LAST_MODIFIED).is_some());
        let etag = resp.headers().get(header::ETAG).unwrap().to_str().unwrap();
        assert!(EntityTag::parse(etag).is_some());

        // unchanged file, same validator
        let again = Response::file(&path, None).unwrap();
        assert_eq!(again.headers().get(header::ETAG).unwrap(), etag);
    }

    #[test]
    fn file_conditional_answers_304_on_matching_etag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        std::fs::write(&path, "<html></html>").unwrap();
        let etag = Response::file(&path, None)
            .unwrap()
            .headers()
            .get(header::ETAG)
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();

        let mut request = HeaderMap::new();
        request.insert(header::IF_NONE_MATCH, HeaderValue::from_str(&etag).unwrap());
        // a date check alone would say "modified": the etag must decide anyway
        request.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::UNIX_EPOCH)).unwrap(),
        );

        let resp = Response::file_conditional(&request, &path, None).unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
        assert!(resp.body().is_empty_body());
    }

    #[test]
    fn stale_etag_wins_over_a_fresh_date() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        std::fs::write(&path, "<html></html>").unwrap();

        let mut request = HeaderMap::new();
        request.insert(header::IF_NONE_MATCH, HeaderValue::from_static("\"gone-stale\""));
        // with If-None-Match present, a date that would match is not consulted
        let future = SystemTime::now() + std::time::Duration::from_secs(3600);
        request.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_str(&httpdate::fmt_http_date(future)).unwrap(),
        );

        let resp = Response::file_conditional(&request, &path, None).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn file_conditional_falls_back_to_modified_since() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        std::fs::write(&path, "<html></html>").unwrap();

        let mut request = HeaderMap::new();
        let future = SystemTime::now() + std::time::Duration::from_secs(3600);
        request.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_str(&httpdate::fmt_http_date(future)).unwrap(),
        );

        let resp = Response::file_conditional(&request, &path, None).unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);

        let mut request = HeaderMap::new();
        request.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::UNIX_EPOCH)).unwrap(),
        );
        let resp = Response::file_conditional(&request, &path, None).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
