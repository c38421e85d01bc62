pub mod body;
mod error;
mod message;
mod request;
mod response;

pub use body::{BodyStore, FileUpload};
pub use error::{HandlerError, HttpError, ParseError, SendError};
pub use message::{Message, PayloadItem, PayloadSize};
pub use request::{Request, RequestHead, Scheme};
pub use response::{BodyProvider, ByteStream, ChunkProducer, GzipPolicy, Response, status_forbids_body};

/// The head of an HTTP response on its way to the wire.
///
/// Handler-facing responses are [`Response`]; by the time the engine has made
/// its framing decisions the head collapses to the plain `http` type.
pub type ResponseHead = http::Response<()>;
