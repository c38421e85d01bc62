//! The server shell: listeners, dispatch, graceful shutdown.
//!
//! A [`Server`] binds up to two listening sockets (plaintext and TLS), hands
//! every accepted socket to its own engine task, resolves requests through
//! the [`HookTable`](crate::hook::HookTable), and tracks the live connections
//! so [`ServerHandle::stop`] can shut down gracefully or brutally.
//!
//! # Examples
//!
//! ```no_run
//! use moor_web::hook::{UrlHook, hook_fn};
//! use moor_web::server::Server;
//! use moor_web::Response;
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::builder().port(3000).build().unwrap();
//!     server
//!         .hooks()
//!         .mount(
//!             UrlHook::path("/hello").unwrap(),
//!             hook_fn(|_req| async { Ok(Response::text("Hello, World!")) }),
//!         )
//!         .unwrap();
//!     let handle = server.start().await.unwrap();
//!     handle.wait_shutdown().await;
//! }
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, oneshot};
use tokio::task::AbortHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use moor_http::connection::{ConnectionStats, EngineConfig, HttpConnection, ResponseExceptionHandler};
use moor_http::handler::Handler;
use moor_http::protocol::{HandlerError, Request, Response, Scheme};

use crate::hook::HookTable;
use crate::tls::{self, TlsError};

/// User callback consulted for handler errors without an HTTP status.
///
/// Returning `None` falls back to the default error page.
pub type ErrorHandler = dyn Fn(&HandlerError) -> Option<Response> + Send + Sync;

/// Errors from building or starting a server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("at least one of port and secure_port must be set")]
    MissingPort,

    #[error("secure_port requires certificate_path")]
    MissingCertificate,

    #[error("tls setup failed: {source}")]
    Tls {
        #[from]
        source: TlsError,
    },

    #[error("failed to bind listener: {source}")]
    Bind {
        #[source]
        source: std::io::Error,
    },
}

/// Builder for a [`Server`].
///
/// The recognised options mirror the classic server configuration surface:
/// `port` / `secure_port`, `bind_address`, `certificate_path`, the idle
/// timeout, the header/body size limits, the upload spill threshold and temp
/// dir, the gzip thresholds, the default content type, and the error
/// reporting switches.
pub struct ServerBuilder {
    port: Option<u16>,
    secure_port: Option<u16>,
    bind_address: IpAddr,
    certificate_path: Option<PathBuf>,
    engine: EngineConfig,
    error_handler: Option<Arc<ErrorHandler>>,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("port", &self.port)
            .field("secure_port", &self.secure_port)
            .field("bind_address", &self.bind_address)
            .field("certificate_path", &self.certificate_path)
            .finish_non_exhaustive()
    }
}

impl ServerBuilder {
    fn new() -> Self {
        Self {
            port: None,
            secure_port: None,
            bind_address: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            certificate_path: None,
            engine: EngineConfig::new(),
            error_handler: None,
        }
    }

    /// Plaintext listening port. Port 0 picks an ephemeral port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// TLS listening port; requires [`certificate_path`](Self::certificate_path).
    pub fn secure_port(mut self, port: u16) -> Self {
        self.secure_port = Some(port);
        self
    }

    /// Address both listeners bind to; defaults to any.
    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// PEM file with the certificate chain and private key.
    pub fn certificate_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.certificate_path = Some(path.into());
        self
    }

    /// Idle receive timeout in milliseconds; 0 disables it.
    pub fn idle_timeout_ms(mut self, ms: u64) -> Self {
        let timeout = (ms > 0).then(|| Duration::from_millis(ms));
        self.engine.idle_timeout(timeout);
        self
    }

    /// Largest accepted request header block.
    pub fn max_header_bytes(mut self, bytes: usize) -> Self {
        self.engine.max_header_bytes(bytes);
        self
    }

    /// Largest accepted request body.
    pub fn max_body_bytes(mut self, bytes: u64) -> Self {
        self.engine.max_body_bytes(Some(bytes));
        self
    }

    /// Request bodies above this size are stored in a temp file.
    pub fn store_file_upload_at(mut self, bytes: u64) -> Self {
        self.engine.store_in_file_at(bytes);
        self
    }

    /// Directory for body spill files and uploads.
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.engine.temp_dir(dir);
        self
    }

    /// Responses up to this size are gzipped in memory.
    pub fn gzip_in_memory_up_to(mut self, bytes: u64) -> Self {
        self.engine.gzip_in_memory_limit(bytes);
        self
    }

    /// Sample size for the gzip auto-detect policy.
    pub fn gzip_autodetect_threshold(mut self, bytes: u64) -> Self {
        self.engine.gzip_autodetect_threshold(bytes);
        self
    }

    /// Content-Type for responses that never set one.
    pub fn default_content_type(mut self, value: impl Into<String>) -> Self {
        self.engine.default_content_type(value);
        self
    }

    /// Include error details in error pages and mid-stream traces.
    pub fn output_exception_information(mut self, value: bool) -> Self {
        self.engine.output_exception_information(value);
        self
    }

    /// Debugging: let non-HTTP handler errors escape instead of becoming 500s.
    pub fn propagate_handler_errors(mut self, value: bool) -> Self {
        self.engine.propagate_handler_errors(value);
        self
    }

    /// Value of the `Server` response header.
    pub fn server_header(mut self, value: impl Into<String>) -> Self {
        self.engine.server_header(value);
        self
    }

    /// Callback for handler errors without an HTTP status.
    pub fn error_handler(
        mut self,
        handler: impl Fn(&HandlerError) -> Option<Response> + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Callback fired when a response body fails after its head was sent.
    pub fn response_exception_handler(mut self, handler: Arc<ResponseExceptionHandler>) -> Self {
        self.engine.response_exception_handler(handler);
        self
    }

    pub fn build(mut self) -> Result<Server, ServerError> {
        if self.port.is_none() && self.secure_port.is_none() {
            return Err(ServerError::MissingPort);
        }

        let tls_acceptor = match self.secure_port {
            Some(_) => {
                let path = self.certificate_path.as_ref().ok_or(ServerError::MissingCertificate)?;
                Some(tls::load_acceptor(path)?)
            }
            None => None,
        };

        let hooks = Arc::new(HookTable::new());
        let config = self.engine.done();
        let dispatcher = Arc::new(Dispatcher {
            hooks: Arc::clone(&hooks),
            error_handler: self.error_handler.take(),
            output_exception_information: config.outputs_exception_information(),
            propagate_handler_errors: config.propagates_handler_errors(),
        });

        Ok(Server {
            inner: Arc::new(ServerInner {
                port: self.port,
                secure_port: self.secure_port,
                bind_address: self.bind_address,
                tls_acceptor,
                hooks,
                dispatcher,
                config,
                stats: Arc::new(ConnectionStats::new()),
                listener_shutdown: CancellationToken::new(),
                conn_shutdown: CancellationToken::new(),
                active: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(0),
                done: Notify::new(),
            }),
        })
    }
}

struct ServerInner {
    port: Option<u16>,
    secure_port: Option<u16>,
    bind_address: IpAddr,
    tls_acceptor: Option<TlsAcceptor>,
    hooks: Arc<HookTable>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<EngineConfig>,
    stats: Arc<ConnectionStats>,
    /// Cancels the accept loops, closing both listening sockets
    listener_shutdown: CancellationToken,
    /// Tells every connection to stop keeping alive
    conn_shutdown: CancellationToken,
    active: Mutex<HashMap<u64, AbortHandle>>,
    next_conn_id: AtomicU64,
    /// Pinged whenever the active set may have drained
    done: Notify,
}

/// A configured server, not yet listening.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("port", &self.inner.port)
            .field("secure_port", &self.inner.secure_port)
            .finish_non_exhaustive()
    }
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// The hook table; handlers can be mounted before or after `start`.
    pub fn hooks(&self) -> &HookTable {
        &self.inner.hooks
    }

    /// Binds the listeners and starts accepting.
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        let inner = self.inner;

        let mut local_addr = None;
        if let Some(port) = inner.port {
            let listener = TcpListener::bind(SocketAddr::new(inner.bind_address, port))
                .await
                .map_err(|source| ServerError::Bind { source })?;
            local_addr = listener.local_addr().ok();
            info!(addr = ?local_addr, "listening for http");
            tokio::spawn(accept_loop(Arc::clone(&inner), listener, None));
        }

        let mut secure_local_addr = None;
        if let Some(port) = inner.secure_port {
            let listener = TcpListener::bind(SocketAddr::new(inner.bind_address, port))
                .await
                .map_err(|source| ServerError::Bind { source })?;
            secure_local_addr = listener.local_addr().ok();
            info!(addr = ?secure_local_addr, "listening for https");
            let acceptor = inner.tls_acceptor.clone();
            tokio::spawn(accept_loop(Arc::clone(&inner), listener, acceptor));
        }

        Ok(ServerHandle { inner, local_addr, secure_local_addr })
    }
}

/// Control surface of a running server.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<ServerInner>,
    local_addr: Option<SocketAddr>,
    secure_local_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("secure_local_addr", &self.secure_local_addr)
            .finish_non_exhaustive()
    }
}

impl ServerHandle {
    /// Bound address of the plaintext listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bound address of the TLS listener.
    pub fn secure_local_addr(&self) -> Option<SocketAddr> {
        self.secure_local_addr
    }

    pub fn hooks(&self) -> &HookTable {
        &self.inner.hooks
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.inner.stats
    }

    /// Stops the server: closes both listening sockets and ends keep-alive.
    ///
    /// Non-brutal, connections currently serving a request finish it first;
    /// `brutal` force-closes every connection's socket instead. With
    /// `blocking` the call waits until the last connection has exited.
    pub async fn stop(&self, brutal: bool, blocking: bool) {
        info!(brutal, blocking, "stopping server");
        self.inner.listener_shutdown.cancel();
        self.inner.conn_shutdown.cancel();

        if brutal {
            let handles: Vec<AbortHandle> = {
                let active = self.inner.active.lock().expect("active set lock poisoned");
                active.values().cloned().collect()
            };
            for handle in handles {
                handle.abort();
            }
        }

        if blocking {
            self.wait_shutdown().await;
        }
    }

    /// The shutdown latch: completes once [`stop`](Self::stop) has been
    /// called and the last connection has exited.
    pub async fn wait_shutdown(&self) {
        self.inner.listener_shutdown.cancelled().await;
        loop {
            let notified = self.inner.done.notified();
            if self.inner.active.lock().expect("active set lock poisoned").is_empty() {
                return;
            }
            notified.await;
        }
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener, tls: Option<TlsAcceptor>) {
    let scheme = if tls.is_some() { Scheme::Https } else { Scheme::Http };
    loop {
        let accepted = tokio::select! {
            _ = inner.listener_shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                inner.stats.on_accept();
                spawn_connection(&inner, stream, peer, tls.clone(), scheme);
            }
            Err(e) => {
                warn!(cause = %e, "failed to accept");
            }
        }
    }
    // dropping the listener here closes the socket
    info!(?scheme, "listener closed");
}

fn spawn_connection(
    inner: &Arc<ServerInner>,
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    scheme: Scheme,
) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(cause = %e, "failed to set nodelay");
    }

    let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let inner = Arc::clone(inner);
    let (registered_tx, registered_rx) = oneshot::channel::<()>();

    let task = tokio::spawn({
        let inner = Arc::clone(&inner);
        async move {
            // wait until the abort handle is registered, then guarantee
            // deregistration even if the task is aborted
            let _ = registered_rx.await;
            let _guard = ConnGuard { inner: Arc::clone(&inner), id };

            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        let (reader, writer) = tokio::io::split(tls_stream);
                        serve(&inner, scheme, peer.ip(), reader, writer).await;
                    }
                    Err(e) => {
                        warn!(cause = %e, "tls handshake failed");
                    }
                },
                None => {
                    let (reader, writer) = stream.into_split();
                    serve(&inner, scheme, peer.ip(), reader, writer).await;
                }
            }
        }
    });

    inner.active.lock().expect("active set lock poisoned").insert(id, task.abort_handle());
    let _ = registered_tx.send(());
}

async fn serve<R, W>(inner: &Arc<ServerInner>, scheme: Scheme, peer: IpAddr, reader: R, writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let connection = HttpConnection::new(
        Arc::clone(&inner.config),
        Arc::clone(&inner.stats),
        scheme,
        peer,
        inner.conn_shutdown.child_token(),
        reader,
        writer,
    );
    match connection.process(Arc::clone(&inner.dispatcher)).await {
        Ok(()) => info!("connection closed"),
        Err(e) => error!(cause = %e, "connection failed"),
    }
}

/// Removes a connection from the active set when its task ends, however it
/// ends.
struct ConnGuard {
    inner: Arc<ServerInner>,
    id: u64,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let mut active = self.inner.active.lock().expect("active set lock poisoned");
        active.remove(&self.id);
        let drained = active.is_empty();
        drop(active);
        if drained {
            self.inner.done.notify_waiters();
        }
    }
}

/// Resolves requests against the hook table and applies the error policy.
pub(crate) struct Dispatcher {
    hooks: Arc<HookTable>,
    error_handler: Option<Arc<ErrorHandler>>,
    output_exception_information: bool,
    propagate_handler_errors: bool,
}

impl Handler for Dispatcher {
    async fn handle(&self, mut request: Request) -> Result<Response, HandlerError> {
        let resolved =
            self.hooks.resolve(request.scheme(), request.host(), request.port(), request.path());
        let Some((handler, rest)) = resolved else {
            return Ok(Response::error(StatusCode::NOT_FOUND, None));
        };
        request.set_rest_path(rest);

        match handler.handle(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if let Some(status) = e.status_code() {
                    return Ok(Response::error(status, e.user_message()));
                }
                if self.propagate_handler_errors {
                    return Err(e);
                }
                if let Some(error_handler) = &self.error_handler {
                    match catch_unwind(AssertUnwindSafe(|| error_handler(&e))) {
                        Ok(Some(response)) => return Ok(response),
                        Ok(None) => {}
                        Err(_panic) => {
                            error!("error handler panicked while handling: {e}");
                            let detail = self
                                .output_exception_information
                                .then(|| format!("{e}; the error handler itself failed"));
                            return Ok(Response::error(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                detail.as_deref(),
                            ));
                        }
                    }
                }
                Err(e)
            }
        }
    }
}
