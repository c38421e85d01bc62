//! The per-connection engine.
//!
//! One [`HttpConnection`] owns one socket for its whole life and walks it
//! through the connection states: read a request head, honor Expect, buffer
//! the body (memory, temp file, or multipart fan-out), dispatch to the
//! handler, serialize the response with the framing decision tree, then
//! either loop for the next keep-alive turn or close. Errors in any phase
//! drive a best-effort error response before the connection dies; oversized
//! header blocks and raw I/O failures close silently.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::{Method, StatusCode, header};
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::multipart::{MAX_BOUNDARY_LEN, MultipartEvent, MultipartParser, boundary_from_content_type};
use crate::codec::{RequestDecoder, ResponseEncoder};
use crate::connection::response_writer::{ResponseMeta, write_response};
use crate::connection::{ConnectionStats, EngineConfig};
use crate::ensure;
use crate::handler::Handler;
use crate::protocol::body::{BodyStore, FileUpload};
use crate::protocol::{
    HandlerError, HttpError, Message, ParseError, PayloadItem, PayloadSize, Request, RequestHead,
    Response, Scheme, SendError,
};

/// Read buffer granted to a fresh connection
const INIT_READ_BUFFER: usize = 8 * 1024;

/// An HTTP/1.x connection being served.
pub struct HttpConnection<R, W> {
    framed_read: FramedRead<R, RequestDecoder>,
    framed_write: FramedWrite<W, ResponseEncoder>,
    config: Arc<EngineConfig>,
    stats: Arc<ConnectionStats>,
    scheme: Scheme,
    peer_addr: IpAddr,
    shutdown: CancellationToken,
    /// Parked between keep-alive turns right now
    idle: bool,
    /// At least one response has been written on this connection
    served_any: bool,
}

impl<R, W> HttpConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        config: Arc<EngineConfig>,
        stats: Arc<ConnectionStats>,
        scheme: Scheme,
        peer_addr: IpAddr,
        shutdown: CancellationToken,
        reader: R,
        writer: W,
    ) -> Self {
        let decoder = RequestDecoder::new(config.max_header_bytes);
        Self {
            framed_read: FramedRead::with_capacity(reader, decoder, INIT_READ_BUFFER),
            framed_write: FramedWrite::new(writer, ResponseEncoder::new()),
            config,
            stats,
            scheme,
            peer_addr,
            shutdown,
            idle: false,
            served_any: false,
        }
    }

    /// Serves requests until the connection closes.
    pub async fn process<H>(mut self, handler: Arc<H>) -> Result<(), HttpError>
    where
        H: Handler,
    {
        self.stats.handler_started();
        let result = self.run(handler.as_ref()).await;
        self.stats.connection_closed(self.idle);
        result
    }

    async fn run<H>(&mut self, handler: &H) -> Result<(), HttpError>
    where
        H: Handler,
    {
        loop {
            let Some((head, payload_size)) = self.read_head().await? else {
                info!("connection done");
                return Ok(());
            };
            if !self.serve_one(head, payload_size, handler).await? {
                return Ok(());
            }
        }
    }

    /// Waits for the next request head; `None` means the connection is over
    /// (peer closed, idle timeout, or shutdown).
    async fn read_head(&mut self) -> Result<Option<(RequestHead, PayloadSize)>, HttpError> {
        if self.served_any {
            self.idle = true;
            self.stats.enter_keep_alive();
        }

        let shutdown = self.shutdown.clone();
        let idle_timeout = self.config.idle_timeout;
        let framed_read = &mut self.framed_read;
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("closing connection for shutdown");
                return Ok(None);
            }
            message = async {
                match idle_timeout {
                    Some(timeout) => tokio::time::timeout(timeout, framed_read.next()).await.unwrap_or_else(|_| {
                        info!("idle timeout, closing connection");
                        None
                    }),
                    None => framed_read.next().await,
                }
            } => message,
        };

        if message.is_some() && self.idle {
            self.idle = false;
            self.stats.leave_keep_alive();
        }

        match message {
            None => Ok(None),
            Some(Ok(Message::Head(head))) => Ok(Some(head)),
            Some(Ok(Message::Payload(_))) => {
                let e = ParseError::invalid_body("payload bytes where a request head was expected");
                self.write_parse_error(&e).await;
                Err(e.into())
            }
            Some(Err(e)) => {
                error!(cause = %e, "failed to read request");
                self.write_parse_error(&e).await;
                Err(e.into())
            }
        }
    }

    /// One keep-alive turn. Returns whether the connection survives it.
    async fn serve_one<H>(
        &mut self,
        head: RequestHead,
        payload_size: PayloadSize,
        handler: &H,
    ) -> Result<bool, HttpError>
    where
        H: Handler,
    {
        let meta = ResponseMeta::from_head(&head);

        if let Some(value) = head.headers().get(header::EXPECT) {
            let token = value.to_str().unwrap_or("").trim();
            if token.eq_ignore_ascii_case("100-continue") {
                let writer = self.framed_write.get_mut();
                writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.map_err(SendError::io)?;
                writer.flush().await.map_err(SendError::io)?;
            } else {
                let e = ParseError::unsupported_expect(token);
                self.write_parse_error(&e).await;
                return Err(e.into());
            }
        }

        let parsed = match self.read_body(&head, payload_size).await {
            Ok(parsed) => parsed,
            Err(e) => {
                self.write_parse_error(&e).await;
                return Err(e.into());
            }
        };

        // everything the engine must delete once the response is done
        let mut temp_files: Vec<(PathBuf, Option<Arc<AtomicBool>>)> = Vec::new();
        if let Some(path) = parsed.store.file_path() {
            temp_files.push((path.to_owned(), None));
        }
        for upload in &parsed.uploads {
            temp_files.push((upload.path().to_owned(), Some(upload.moved_flag())));
        }

        let request = Request::new(
            head,
            self.scheme,
            self.peer_addr,
            parsed.store,
            parsed.uploads,
            parsed.fields,
        );

        let response = match handler.handle(request).await {
            Ok(response) => response,
            Err(e) => {
                if self.config.propagate_handler_errors && e.status_code().is_none() {
                    self.delete_temp_files(&temp_files).await;
                    return Err(e.into());
                }
                error!(cause = %e, "handler failed");
                handler_error_response(&e, &self.config)
            }
        };

        let (status, headers, body, gzip, cleanup) = response.into_parts();
        let write_result = write_response(
            &mut self.framed_write,
            &self.config,
            &meta,
            status,
            headers,
            body,
            gzip,
            self.shutdown.is_cancelled(),
        )
        .await;

        if let Some(cleanup) = cleanup {
            cleanup();
        }
        self.delete_temp_files(&temp_files).await;

        self.served_any = true;
        Ok(write_result? && !self.shutdown.is_cancelled())
    }

    /// Best-effort error response; the connection closes afterwards either
    /// way, so failures here are only logged.
    async fn write_parse_error(&mut self, e: &ParseError) {
        let Some(status) = e.status() else { return };
        let detail = self.config.output_exception_information.then(|| e.to_string());
        let response = Response::error(status, detail.as_deref());
        let (status, headers, body, gzip, _) = response.into_parts();
        let meta = ResponseMeta::fallback();
        if let Err(we) =
            write_response(&mut self.framed_write, &self.config, &meta, status, headers, body, gzip, true)
                .await
        {
            warn!(cause = %we, "failed to write error response");
        }
    }

    /// Reads and stores the request body according to its content type.
    async fn read_body(
        &mut self,
        head: &RequestHead,
        payload_size: PayloadSize,
    ) -> Result<ParsedBody, ParseError> {
        if payload_size.is_empty() {
            return Ok(ParsedBody::empty());
        }

        if let (Some(max), Some(len)) = (self.config.max_body_bytes, payload_size.length()) {
            ensure!(len <= max, ParseError::body_too_large(len, max));
        }

        if head.method() != Method::POST {
            // tolerated but meaningless; drain to keep the framing intact
            self.drain_payload().await?;
            return Ok(ParsedBody::empty());
        }

        let content_type = head
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();
        let main_type = content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();

        if main_type.is_empty() || main_type == mime::APPLICATION_WWW_FORM_URLENCODED.as_ref() {
            self.read_body_buffered(payload_size).await
        } else if main_type == mime::MULTIPART_FORM_DATA.as_ref() {
            match boundary_from_content_type(&content_type) {
                Some(boundary) if !boundary.is_empty() && boundary.len() <= MAX_BOUNDARY_LEN => {
                    let boundary = boundary.to_owned();
                    self.read_body_multipart(&boundary).await
                }
                Some(_) => {
                    // oversized boundary: malformed, the body is ignored
                    warn!("multipart boundary too long, ignoring request body");
                    self.drain_payload().await?;
                    Ok(ParsedBody::empty())
                }
                None => Err(ParseError::unsupported_media_type(content_type)),
            }
        } else {
            Err(ParseError::unsupported_media_type(content_type))
        }
    }

    async fn next_payload(&mut self) -> Result<PayloadItem, ParseError> {
        match self.framed_read.next().await {
            Some(Ok(Message::Payload(item))) => Ok(item),
            Some(Ok(Message::Head(_))) => {
                Err(ParseError::invalid_body("request head while reading a body"))
            }
            Some(Err(e)) => Err(e),
            None => Err(ParseError::invalid_body("connection closed before the body was complete")),
        }
    }

    async fn drain_payload(&mut self) -> Result<(), ParseError> {
        let mut total: u64 = 0;
        loop {
            match self.next_payload().await? {
                PayloadItem::Chunk(bytes) => {
                    total += bytes.len() as u64;
                    self.check_body_limit(total)?;
                }
                PayloadItem::Eof => return Ok(()),
            }
        }
    }

    fn check_body_limit(&self, total: u64) -> Result<(), ParseError> {
        if let Some(max) = self.config.max_body_bytes {
            ensure!(total <= max, ParseError::body_too_large(total, max));
        }
        Ok(())
    }

    /// Buffers a plain body: memory up to the spill threshold, temp file past
    /// it.
    async fn read_body_buffered(&mut self, payload_size: PayloadSize) -> Result<ParsedBody, ParseError> {
        let spill_at = self.config.store_in_file_at;
        let mut sink = match payload_size.length() {
            Some(len) if len > spill_at => {
                let (path, file) = create_temp_file(&self.config.temp_dir).await?;
                BodySink::File { file, path, written: 0 }
            }
            _ => BodySink::Memory(BytesMut::new()),
        };

        let mut total: u64 = 0;
        loop {
            match self.next_payload().await {
                Ok(PayloadItem::Chunk(bytes)) => {
                    total += bytes.len() as u64;
                    if let Err(e) = self.check_body_limit(total) {
                        sink.discard().await;
                        return Err(e);
                    }
                    if matches!(sink, BodySink::Memory(_)) && total > spill_at {
                        sink = sink.spill(&self.config.temp_dir).await?;
                    }
                    if let Err(e) = sink.write(&bytes).await {
                        sink.discard().await;
                        return Err(ParseError::io(e));
                    }
                }
                Ok(PayloadItem::Eof) => break,
                Err(e) => {
                    sink.discard().await;
                    return Err(e);
                }
            }
        }

        let store = sink.finish().await?;
        Ok(ParsedBody { store, uploads: Vec::new(), fields: None })
    }

    /// Streams a multipart body part by part: text fields into memory, file
    /// parts into temp files.
    async fn read_body_multipart(&mut self, boundary: &str) -> Result<ParsedBody, ParseError> {
        let mut parser = MultipartParser::new(boundary)?;
        let mut fields: Vec<(String, String)> = Vec::new();
        let mut uploads: Vec<FileUpload> = Vec::new();
        let mut current: Option<PartSink> = None;
        let mut total: u64 = 0;
        // a malformed body stops parsing but is still drained for framing
        let mut malformed = false;

        loop {
            let item = match self.next_payload().await {
                Ok(item) => item,
                Err(e) => {
                    abort_part(&mut current).await;
                    delete_uploads(&uploads).await;
                    return Err(e);
                }
            };

            match item {
                PayloadItem::Chunk(bytes) => {
                    total += bytes.len() as u64;
                    if let Err(e) = self.check_body_limit(total) {
                        abort_part(&mut current).await;
                        delete_uploads(&uploads).await;
                        return Err(e);
                    }
                    if malformed {
                        continue;
                    }
                    parser.feed(&bytes);
                    if let Err(e) = pump_multipart(
                        &mut parser,
                        &mut current,
                        &mut fields,
                        &mut uploads,
                        &self.config.temp_dir,
                    )
                    .await
                    {
                        warn!(cause = %e, "malformed multipart body, ignoring remainder");
                        abort_part(&mut current).await;
                        malformed = true;
                    }
                }
                PayloadItem::Eof => {
                    if !malformed {
                        parser.input_done();
                        if let Err(e) = pump_multipart(
                            &mut parser,
                            &mut current,
                            &mut fields,
                            &mut uploads,
                            &self.config.temp_dir,
                        )
                        .await
                        {
                            warn!(cause = %e, "multipart body ended mid-part, ignoring remainder");
                            abort_part(&mut current).await;
                        }
                    }
                    break;
                }
            }
        }

        Ok(ParsedBody { store: BodyStore::Empty, uploads, fields: Some(fields) })
    }

    /// Deletes body spill files and uploads whose ownership was not taken.
    async fn delete_temp_files(&self, files: &[(PathBuf, Option<Arc<AtomicBool>>)]) {
        for (path, moved) in files {
            if moved.as_ref().is_some_and(|flag| flag.load(Ordering::Acquire)) {
                continue;
            }
            if let Err(e) = tokio::fs::remove_file(path).await {
                debug!(path = %path.display(), cause = %e, "failed to delete temp file");
            }
        }
    }
}

/// The stored outcome of the body phase.
struct ParsedBody {
    store: BodyStore,
    uploads: Vec<FileUpload>,
    /// `Some` when multipart parsing already extracted the text fields
    fields: Option<Vec<(String, String)>>,
}

impl ParsedBody {
    fn empty() -> Self {
        Self { store: BodyStore::Empty, uploads: Vec::new(), fields: None }
    }
}

/// Sink for a plain buffered body.
enum BodySink {
    Memory(BytesMut),
    File { file: tokio::fs::File, path: PathBuf, written: u64 },
}

impl BodySink {
    async fn write(&mut self, bytes: &Bytes) -> std::io::Result<()> {
        match self {
            BodySink::Memory(buf) => {
                buf.extend_from_slice(bytes);
                Ok(())
            }
            BodySink::File { file, written, .. } => {
                file.write_all(bytes).await?;
                *written += bytes.len() as u64;
                Ok(())
            }
        }
    }

    /// Moves an in-memory buffer into a fresh temp file.
    async fn spill(self, temp_dir: &Path) -> Result<BodySink, ParseError> {
        match self {
            BodySink::Memory(buf) => {
                let (path, mut file) = create_temp_file(temp_dir).await?;
                if let Err(e) = file.write_all(&buf).await {
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(ParseError::io(e));
                }
                Ok(BodySink::File { file, path, written: buf.len() as u64 })
            }
            spilled => Ok(spilled),
        }
    }

    async fn finish(self) -> Result<BodyStore, ParseError> {
        match self {
            BodySink::Memory(buf) if buf.is_empty() => Ok(BodyStore::Empty),
            BodySink::Memory(buf) => Ok(BodyStore::Memory(buf.freeze())),
            BodySink::File { mut file, path, written } => {
                file.flush().await.map_err(ParseError::io)?;
                Ok(BodyStore::File { path, len: written })
            }
        }
    }

    async fn discard(self) {
        if let BodySink::File { path, .. } = self {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
}

/// Sink for one multipart part.
enum PartSink {
    Field {
        name: Option<String>,
        data: BytesMut,
    },
    Upload {
        name: Option<String>,
        filename: String,
        content_type: Option<String>,
        file: tokio::fs::File,
        path: PathBuf,
        written: u64,
    },
}

/// Drains parser events into part sinks, fields and upload records.
async fn pump_multipart(
    parser: &mut MultipartParser,
    current: &mut Option<PartSink>,
    fields: &mut Vec<(String, String)>,
    uploads: &mut Vec<FileUpload>,
    temp_dir: &Path,
) -> Result<(), ParseError> {
    while let Some(event) = parser.next_event()? {
        match event {
            MultipartEvent::PartStart(headers) => {
                *current = Some(match headers.filename {
                    Some(filename) => {
                        let (path, file) = create_temp_file(temp_dir).await?;
                        PartSink::Upload {
                            name: headers.name,
                            filename,
                            content_type: headers.content_type,
                            file,
                            path,
                            written: 0,
                        }
                    }
                    None => PartSink::Field { name: headers.name, data: BytesMut::new() },
                });
            }
            MultipartEvent::Data(bytes) => match current {
                Some(PartSink::Field { data, .. }) => data.extend_from_slice(&bytes),
                Some(PartSink::Upload { file, written, .. }) => {
                    file.write_all(&bytes).await.map_err(ParseError::io)?;
                    *written += bytes.len() as u64;
                }
                None => return Err(ParseError::invalid_body("multipart data outside a part")),
            },
            MultipartEvent::PartEnd => match current.take() {
                Some(PartSink::Field { name, data }) => {
                    if let Some(name) = name {
                        fields.push((name, String::from_utf8_lossy(&data).into_owned()));
                    }
                }
                Some(PartSink::Upload { name, filename, content_type, mut file, path, written }) => {
                    file.flush().await.map_err(ParseError::io)?;
                    uploads.push(FileUpload::new(
                        name.unwrap_or_default(),
                        filename,
                        content_type,
                        path,
                        written,
                    ));
                }
                None => return Err(ParseError::invalid_body("multipart part ended twice")),
            },
            MultipartEvent::Finished => {}
        }
    }
    Ok(())
}

/// Closes and deletes a half-written upload part.
async fn abort_part(current: &mut Option<PartSink>) {
    if let Some(PartSink::Upload { path, .. }) = current.take() {
        let _ = tokio::fs::remove_file(&path).await;
    }
}

/// Deletes uploads recorded before a body-phase failure.
async fn delete_uploads(uploads: &[FileUpload]) {
    for upload in uploads {
        let _ = tokio::fs::remove_file(upload.path()).await;
    }
}

/// Creates an upload temp file with an unpredictable name.
async fn create_temp_file(dir: &Path) -> Result<(PathBuf, tokio::fs::File), ParseError> {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    let name: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    let path = dir.join(format!("moor-upload-{name}"));
    let file = tokio::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&path)
        .await
        .map_err(ParseError::io)?;
    Ok((path, file))
}

/// The engine's own fallback for failed handlers.
fn handler_error_response(e: &HandlerError, config: &EngineConfig) -> Response {
    match e.status_code() {
        Some(status) => Response::error(status, e.user_message()),
        None => {
            let detail = config.output_exception_information.then(|| e.to_string());
            Response::error(StatusCode::INTERNAL_SERVER_ERROR, detail.as_deref())
        }
    }
}
