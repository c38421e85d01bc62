//! Response serialization: the framing decision tree.
//!
//! Given the response a handler produced and what we know about the request,
//! this module decides — in this order — empty-body short circuit, byte
//! ranges, gzip (in memory, close-delimited, or chunked), chunked plain,
//! close-delimited plain, or raw with a known length; then streams the body
//! through the matching payload encoder. HEAD requests run the same tree but
//! never write body bytes.

use std::io;
use std::ops::Range;
use std::time::SystemTime;

use bytes::Bytes;
use futures::SinkExt;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version, header};
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::FramedWrite;
use tracing::{error, warn};

use crate::codec::ResponseEncoder;
use crate::connection::EngineConfig;
use crate::connection::body_reader::{BodyReader, SeekableBody};
use crate::encoding::{GzipStream, gzip_bytes, sample_compresses_well};
use crate::headers::range::{RangeSpec, parse_range, resolve_ranges};
use crate::headers::typed::ContentRange;
use crate::headers::{accept, connection_close};
use crate::protocol::{
    BodyProvider, GzipPolicy, HttpError, Message, PayloadItem, PayloadSize, RequestHead, ResponseHead,
    SendError, status_forbids_body,
};

/// Bodies at or below this size are never served as ranges
const RANGE_MIN_LEN: u64 = 16 * 1024;

/// What the response writer needs to know about the request it answers.
///
/// Captured before the request moves into the handler.
pub(crate) struct ResponseMeta {
    pub(crate) head_request: bool,
    pub(crate) version: Version,
    pub(crate) allow_keep_alive: bool,
    pub(crate) accepts_gzip: bool,
    pub(crate) ranges: Option<Vec<RangeSpec>>,
}

impl ResponseMeta {
    pub(crate) fn from_head(head: &RequestHead) -> Self {
        let version = head.version();
        Self {
            head_request: head.method() == Method::HEAD,
            version,
            allow_keep_alive: version == Version::HTTP_11 && !connection_close(head.headers()),
            accepts_gzip: accept::accepts_gzip(head.headers()),
            ranges: head
                .headers()
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_range),
        }
    }

    /// Conservative meta for error responses written before (or instead of) a
    /// parsed request: always close, never compress.
    pub(crate) fn fallback() -> Self {
        Self {
            head_request: false,
            version: Version::HTTP_11,
            allow_keep_alive: false,
            accepts_gzip: false,
            ranges: None,
        }
    }
}

type Framed<W> = FramedWrite<W, ResponseEncoder>;
type WireMessage = Message<(ResponseHead, PayloadSize), Bytes>;

/// Serializes one response. Returns whether the connection may be kept alive.
#[allow(clippy::too_many_arguments, reason = "the decision tree needs all of it")]
pub(crate) async fn write_response<W>(
    framed: &mut Framed<W>,
    config: &EngineConfig,
    meta: &ResponseMeta,
    status: StatusCode,
    mut headers: HeaderMap,
    mut body: BodyProvider,
    gzip_policy: GzipPolicy,
    shutting_down: bool,
) -> Result<bool, HttpError>
where
    W: AsyncWrite + Unpin,
{
    if !headers.contains_key(header::DATE) {
        if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now())) {
            headers.insert(header::DATE, value);
        }
    }
    if !headers.contains_key(header::SERVER) {
        if let Ok(value) = HeaderValue::from_str(&config.server_header) {
            headers.insert(header::SERVER, value);
        }
    }
    if status == StatusCode::OK && body.is_seekable() && !headers.contains_key(header::ACCEPT_RANGES) {
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }

    if status_forbids_body(status) {
        headers.remove(header::CONTENT_TYPE);
        headers.remove(header::CONTENT_LENGTH);
        if !body.is_empty_body() {
            error!(%status, "response body dropped: status must not carry one");
            body = BodyProvider::Empty;
        }
    } else if !body.is_empty_body() && !headers.contains_key(header::CONTENT_TYPE) {
        if let Ok(value) = HeaderValue::from_str(&config.default_content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
    }

    // the body provider's own length wins over a handler-set Content-Length
    let header_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok());
    let provider_len = body.known_len();
    let declared_len = match (header_len, provider_len) {
        (Some(h), Some(p)) => {
            if h != p {
                warn!(header_length = h, body_length = p, "content-length header disagrees with body, using body length");
            }
            Some(p)
        }
        (Some(h), None) => Some(h),
        (None, p) => p,
    };
    headers.remove(header::CONTENT_LENGTH);

    let keep_alive = meta.allow_keep_alive && !connection_close(&headers) && !shutting_down;

    if body.is_empty_body() || declared_len == Some(0) {
        set_connection(&mut headers, keep_alive);
        feed_head(framed, status, headers, PayloadSize::Empty).await?;
        SinkExt::<WireMessage>::flush(framed).await?;
        return Ok(keep_alive);
    }

    // byte ranges come before compression; a 206 is never gzipped
    if let (Some(specs), Some(total)) = (&meta.ranges, declared_len) {
        if status == StatusCode::OK
            && meta.version == Version::HTTP_11
            && total > RANGE_MIN_LEN
            && body.is_seekable()
        {
            let ranges = resolve_ranges(specs, total);
            let spans_everything = ranges.len() == 1 && ranges[0] == (0..total);
            if !ranges.is_empty() && !spans_everything {
                return write_ranges(framed, config, meta, headers, body, ranges, total, keep_alive).await;
            }
        }
    }

    let gzip_applicable = !headers.contains_key(header::CONTENT_ENCODING);
    let use_gzip = gzip_applicable
        && match gzip_policy {
            GzipPolicy::Never => false,
            GzipPolicy::Force => meta.accepts_gzip,
            GzipPolicy::AutoDetect => {
                meta.accepts_gzip
                    && meta.version == Version::HTTP_11
                    && gzip_pays_off(config, &mut body, declared_len)
            }
        };

    if use_gzip {
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        if let Some(len) = declared_len {
            if len < config.gzip_in_memory_limit {
                // compress in memory so the response keeps an exact length
                let raw = read_fully(config, framed, body).await?;
                let compressed = gzip_bytes(&raw).map_err(SendError::io)?;
                let payload = PayloadSize::Length(compressed.len() as u64);
                set_connection(&mut headers, keep_alive);
                feed_head(framed, status, headers, payload).await?;
                if meta.head_request {
                    framed.encoder_mut().abort_body();
                } else {
                    framed.feed(WireMessage::Payload(PayloadItem::Chunk(compressed))).await?;
                }
                SinkExt::<WireMessage>::flush(framed).await?;
                return Ok(keep_alive);
            }
        }

        return if keep_alive {
            set_connection(&mut headers, true);
            feed_head(framed, status, headers, PayloadSize::Chunked).await?;
            stream_body(framed, config, meta, body, true).await?;
            Ok(true)
        } else {
            set_connection(&mut headers, false);
            feed_head(framed, status, headers, PayloadSize::CloseDelimited).await?;
            stream_body(framed, config, meta, body, true).await?;
            Ok(false)
        };
    }

    match declared_len {
        Some(len) => {
            set_connection(&mut headers, keep_alive);
            feed_head(framed, status, headers, PayloadSize::Length(len)).await?;
            stream_body(framed, config, meta, body, false).await?;
            Ok(keep_alive)
        }
        None if keep_alive => {
            set_connection(&mut headers, true);
            feed_head(framed, status, headers, PayloadSize::Chunked).await?;
            stream_body(framed, config, meta, body, false).await?;
            Ok(true)
        }
        None => {
            set_connection(&mut headers, false);
            feed_head(framed, status, headers, PayloadSize::CloseDelimited).await?;
            stream_body(framed, config, meta, body, false).await?;
            Ok(false)
        }
    }
}

/// Serves a canonicalized, non-empty, non-full-span range set as a 206.
#[allow(clippy::too_many_arguments, reason = "one call site, splitting obscures the tree")]
async fn write_ranges<W>(
    framed: &mut Framed<W>,
    config: &EngineConfig,
    meta: &ResponseMeta,
    mut headers: HeaderMap,
    body: BodyProvider,
    ranges: Vec<Range<u64>>,
    total: u64,
    keep_alive: bool,
) -> Result<bool, HttpError>
where
    W: AsyncWrite + Unpin,
{
    let Some(mut seekable) = SeekableBody::new(body) else {
        return Err(SendError::invalid_body("range response over unseekable body").into());
    };
    set_connection(&mut headers, keep_alive);

    if let [range] = ranges.as_slice() {
        let content_range = ContentRange { from: range.start, to: range.end - 1, total };
        if let Ok(value) = HeaderValue::from_str(&content_range.to_string()) {
            headers.insert(header::CONTENT_RANGE, value);
        }
        let len = range.end - range.start;
        feed_head(framed, StatusCode::PARTIAL_CONTENT, headers, PayloadSize::Length(len)).await?;

        if meta.head_request {
            framed.encoder_mut().abort_body();
        } else {
            let mut cursor = range.clone();
            loop {
                match seekable.next_range_chunk(&mut cursor).await {
                    Ok(Some(chunk)) => feed_chunk(framed, chunk).await?,
                    Ok(None) => break,
                    Err(e) => return Err(body_failure(framed, config, e).await),
                }
            }
        }
        SinkExt::<WireMessage>::flush(framed).await?;
        return Ok(keep_alive);
    }

    let boundary = random_boundary();
    let part_heads: Vec<Bytes> = ranges
        .iter()
        .map(|r| {
            Bytes::from(format!(
                "--{boundary}\r\nContent-Range: bytes {}-{}/{}\r\n\r\n",
                r.start,
                r.end - 1,
                total
            ))
        })
        .collect();
    let trailer = Bytes::from(format!("--{boundary}--\r\n"));

    let body_len: u64 = part_heads.iter().map(|h| h.len() as u64).sum::<u64>()
        + ranges.iter().map(|r| r.end - r.start + 2).sum::<u64>()
        + trailer.len() as u64;

    let content_type = format!("multipart/byteranges; boundary={boundary}");
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    feed_head(framed, StatusCode::PARTIAL_CONTENT, headers, PayloadSize::Length(body_len)).await?;

    if meta.head_request {
        framed.encoder_mut().abort_body();
    } else {
        for (head, range) in part_heads.into_iter().zip(ranges) {
            feed_chunk(framed, head).await?;
            let mut cursor = range;
            loop {
                match seekable.next_range_chunk(&mut cursor).await {
                    Ok(Some(chunk)) => feed_chunk(framed, chunk).await?,
                    Ok(None) => break,
                    Err(e) => return Err(body_failure(framed, config, e).await),
                }
            }
            feed_chunk(framed, Bytes::from_static(b"\r\n")).await?;
        }
        feed_chunk(framed, trailer).await?;
    }
    SinkExt::<WireMessage>::flush(framed).await?;
    Ok(keep_alive)
}

/// Streams the body through the already-installed payload encoder,
/// optionally compressing on the way.
async fn stream_body<W>(
    framed: &mut Framed<W>,
    config: &EngineConfig,
    meta: &ResponseMeta,
    body: BodyProvider,
    compress: bool,
) -> Result<(), HttpError>
where
    W: AsyncWrite + Unpin,
{
    if meta.head_request {
        framed.encoder_mut().abort_body();
        SinkExt::<WireMessage>::flush(framed).await?;
        return Ok(());
    }

    let mut reader = BodyReader::new(body);
    let mut gzip = compress.then(GzipStream::new);

    loop {
        match reader.next_chunk().await {
            Ok(Some(chunk)) => match &mut gzip {
                Some(gz) => {
                    let out = gz.write(&chunk).map_err(SendError::io)?;
                    if !out.is_empty() {
                        feed_chunk(framed, out).await?;
                    }
                }
                None => feed_chunk(framed, chunk).await?,
            },
            Ok(None) => break,
            Err(e) => {
                reader.close();
                return Err(body_failure(framed, config, e).await);
            }
        }
    }
    reader.close();

    if let Some(mut gz) = gzip {
        let tail = gz.finish().map_err(SendError::io)?;
        if !tail.is_empty() {
            feed_chunk(framed, tail).await?;
        }
    }
    framed.feed(WireMessage::Payload(PayloadItem::Eof)).await?;
    SinkExt::<WireMessage>::flush(framed).await?;
    Ok(())
}

/// Drains a body fully into memory (the in-memory gzip branch).
async fn read_fully<W>(
    config: &EngineConfig,
    framed: &mut Framed<W>,
    body: BodyProvider,
) -> Result<Bytes, HttpError>
where
    W: AsyncWrite + Unpin,
{
    let mut reader = BodyReader::new(body);
    let result = reader.read_to_end().await;
    reader.close();
    match result {
        Ok(bytes) => Ok(bytes),
        Err(e) => Err(body_failure(framed, config, e).await),
    }
}

/// A body read failed. The head may already be on the wire, so no status can
/// change: optionally append a diagnostic, fire the exception handler, and
/// hand back the error that will close the connection.
async fn body_failure<W>(framed: &mut Framed<W>, config: &EngineConfig, e: io::Error) -> HttpError
where
    W: AsyncWrite + Unpin,
{
    error!(cause = %e, "response body failed mid-stream, closing connection");
    let error: HttpError = SendError::io(e).into();

    let _ = SinkExt::<WireMessage>::flush(framed).await;
    if config.output_exception_information {
        let note = format!("\r\n<!-- response body failed: {error} -->\r\n");
        let _ = framed.get_mut().write_all(note.as_bytes()).await;
        let _ = framed.get_mut().flush().await;
    }
    if let Some(handler) = &config.response_exception_handler {
        handler(&error);
    }
    error
}

/// Auto-detect: is compressing this body worth it?
///
/// Unknown lengths compress; short known lengths do not; long seekable bodies
/// are decided by trial-compressing a sample from the middle.
fn gzip_pays_off(config: &EngineConfig, body: &mut BodyProvider, declared_len: Option<u64>) -> bool {
    let Some(len) = declared_len else { return true };
    if len < config.gzip_autodetect_threshold {
        return false;
    }

    let sample_len = config.gzip_autodetect_threshold.min(len);
    let offset = (len - sample_len) / 2;
    match body {
        BodyProvider::Full(bytes) => {
            sample_compresses_well(&bytes[offset as usize..(offset + sample_len) as usize])
        }
        BodyProvider::File { file, .. } => {
            use std::io::{Read, Seek, SeekFrom};
            let sample = (|| -> io::Result<Vec<u8>> {
                file.seek(SeekFrom::Start(offset))?;
                let mut sample = vec![0u8; sample_len as usize];
                file.read_exact(&mut sample)?;
                file.seek(SeekFrom::Start(0))?;
                Ok(sample)
            })();
            match sample {
                Ok(sample) => sample_compresses_well(&sample),
                Err(e) => {
                    warn!(cause = %e, "gzip sampling failed, serving uncompressed");
                    false
                }
            }
        }
        // known length but not seekable: no sample possible, compress
        _ => true,
    }
}

async fn feed_head<W>(
    framed: &mut Framed<W>,
    status: StatusCode,
    headers: HeaderMap,
    payload: PayloadSize,
) -> Result<(), SendError>
where
    W: AsyncWrite + Unpin,
{
    let mut head = ResponseHead::new(());
    *head.status_mut() = status;
    *head.headers_mut() = headers;
    framed.feed(WireMessage::Head((head, payload))).await
}

async fn feed_chunk<W>(framed: &mut Framed<W>, chunk: Bytes) -> Result<(), SendError>
where
    W: AsyncWrite + Unpin,
{
    framed.feed(WireMessage::Payload(PayloadItem::Chunk(chunk))).await
}

fn set_connection(headers: &mut HeaderMap, keep_alive: bool) {
    let value =
        if keep_alive { HeaderValue::from_static("keep-alive") } else { HeaderValue::from_static("close") };
    headers.insert(header::CONNECTION, value);
}

/// A fresh boundary for `multipart/byteranges`: 64 hex characters.
fn random_boundary() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
