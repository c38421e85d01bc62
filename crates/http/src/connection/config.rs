//! Engine-level configuration.
//!
//! These are the knobs the connection engine itself consults; the server
//! shell layers listener concerns (ports, TLS, bind address) on top and
//! projects the rest down to this struct.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::HttpError;

/// Callback fired when a response body fails mid-stream, after the head has
/// already been written.
pub type ResponseExceptionHandler = dyn Fn(&HttpError) + Send + Sync;

/// Configuration consulted by [`HttpConnection`](crate::connection::HttpConnection).
#[derive(Clone)]
pub struct EngineConfig {
    pub(crate) max_header_bytes: usize,
    pub(crate) max_body_bytes: Option<u64>,
    pub(crate) store_in_file_at: u64,
    pub(crate) temp_dir: PathBuf,
    pub(crate) gzip_in_memory_limit: u64,
    pub(crate) gzip_autodetect_threshold: u64,
    pub(crate) default_content_type: String,
    pub(crate) server_header: String,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) output_exception_information: bool,
    pub(crate) propagate_handler_errors: bool,
    pub(crate) response_exception_handler: Option<Arc<ResponseExceptionHandler>>,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("max_header_bytes", &self.max_header_bytes)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("store_in_file_at", &self.store_in_file_at)
            .field("temp_dir", &self.temp_dir)
            .field("gzip_in_memory_limit", &self.gzip_in_memory_limit)
            .field("gzip_autodetect_threshold", &self.gzip_autodetect_threshold)
            .field("default_content_type", &self.default_content_type)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    /// A config with the stock limits.
    pub fn new() -> Self {
        Self {
            max_header_bytes: 256 * 1024,
            max_body_bytes: None,
            store_in_file_at: 16 * 1024 * 1024,
            temp_dir: std::env::temp_dir(),
            gzip_in_memory_limit: 1024 * 1024,
            gzip_autodetect_threshold: 4 * 1024,
            default_content_type: "text/html; charset=utf-8".to_owned(),
            server_header: concat!("moor/", env!("CARGO_PKG_VERSION")).to_owned(),
            idle_timeout: None,
            output_exception_information: false,
            propagate_handler_errors: false,
            response_exception_handler: None,
        }
    }

    /// Largest accepted request header block, in bytes.
    pub fn max_header_bytes(&mut self, value: usize) -> &mut Self {
        self.max_header_bytes = value;
        self
    }

    /// Largest accepted request body; `None` means unlimited.
    pub fn max_body_bytes(&mut self, value: Option<u64>) -> &mut Self {
        self.max_body_bytes = value;
        self
    }

    /// Bodies above this size are spilled to a temp file instead of memory.
    pub fn store_in_file_at(&mut self, value: u64) -> &mut Self {
        self.store_in_file_at = value;
        self
    }

    /// Directory for body spill files and uploads.
    pub fn temp_dir(&mut self, value: impl Into<PathBuf>) -> &mut Self {
        self.temp_dir = value.into();
        self
    }

    /// Bodies up to this size are gzipped in memory to get an exact
    /// Content-Length; larger ones stream.
    pub fn gzip_in_memory_limit(&mut self, value: u64) -> &mut Self {
        self.gzip_in_memory_limit = value;
        self
    }

    /// Sample size for gzip auto-detection, and the smallest body worth
    /// compressing at all.
    pub fn gzip_autodetect_threshold(&mut self, value: u64) -> &mut Self {
        self.gzip_autodetect_threshold = value;
        self
    }

    /// Content-Type applied when a response has a body but never set one.
    pub fn default_content_type(&mut self, value: impl Into<String>) -> &mut Self {
        self.default_content_type = value.into();
        self
    }

    /// Value of the `Server` header added to responses.
    pub fn server_header(&mut self, value: impl Into<String>) -> &mut Self {
        self.server_header = value.into();
        self
    }

    /// Receive timeout while waiting for a request head; `None` disables.
    pub fn idle_timeout(&mut self, value: Option<Duration>) -> &mut Self {
        self.idle_timeout = value;
        self
    }

    /// Include error details in generated error pages and mid-stream traces.
    pub fn output_exception_information(&mut self, value: bool) -> &mut Self {
        self.output_exception_information = value;
        self
    }

    /// Let non-HTTP handler errors escape the engine instead of becoming 500s.
    pub fn propagate_handler_errors(&mut self, value: bool) -> &mut Self {
        self.propagate_handler_errors = value;
        self
    }

    /// Callback fired when a response body fails after its head was sent.
    pub fn response_exception_handler(&mut self, value: Arc<ResponseExceptionHandler>) -> &mut Self {
        self.response_exception_handler = Some(value);
        self
    }

    /// An `Arc`'d clone to hand to connections.
    pub fn done(&mut self) -> Arc<Self> {
        Arc::new(self.clone())
    }

    /// Whether error details are included in generated output.
    pub fn outputs_exception_information(&self) -> bool {
        self.output_exception_information
    }

    /// Whether non-HTTP handler errors escape the engine.
    pub fn propagates_handler_errors(&self) -> bool {
        self.propagate_handler_errors
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
