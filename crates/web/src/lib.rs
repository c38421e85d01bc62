pub mod hook;
pub mod server;

mod tls;

pub use hook::{HookError, HookHandler, HookTable, Protocols, UrlHook, hook_fn};
pub use server::{ErrorHandler, Server, ServerBuilder, ServerHandle, ServerError};
pub use tls::TlsError;

pub use moor_http::connection::ConnectionStats;
pub use moor_http::headers;
pub use moor_http::protocol::{
    BodyProvider, ByteStream, ChunkProducer, GzipPolicy, HandlerError, Request, Response, Scheme,
};
pub use moor_http::protocol::body::{BodyStore, FileUpload};
