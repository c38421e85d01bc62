//! The handler abstraction the engine dispatches to.
//!
//! A handler consumes the parsed [`Request`] and produces a [`Response`], or
//! fails with a [`HandlerError`] — with an explicit HTTP status if it has
//! one, as anything else if it does not. The engine turns failures into
//! error responses unless error propagation is switched on.
//!
//! # Examples
//!
//! ```no_run
//! use moor_http::handler::{Handler, handler_fn};
//! use moor_http::protocol::{HandlerError, Request, Response};
//!
//! async fn hello(req: Request) -> Result<Response, HandlerError> {
//!     Ok(Response::text(format!("hello from {}", req.path())))
//! }
//!
//! let handler = handler_fn(hello);
//! ```

use std::future::Future;

use crate::protocol::{HandlerError, Request, Response};

/// Processes one HTTP request.
#[trait_variant::make(Handler: Send)]
pub trait LocalHandler: Sync {
    async fn handle(&self, request: Request) -> Result<Response, HandlerError>;
}

/// A [`Handler`] built from an async function.
#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, HandlerError>> + Send,
{
    async fn handle(&self, request: Request) -> Result<Response, HandlerError> {
        (self.f)(request).await
    }
}

/// Wraps an async function as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, HandlerError>> + Send,
{
    HandlerFn { f }
}
