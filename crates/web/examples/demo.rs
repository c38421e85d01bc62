//! A small demo server exercising the main surfaces: plain text, JSON,
//! form posts with file uploads, and a large seekable body that supports
//! range requests and gzip.
//!
//! Run with `cargo run --example demo`, then e.g.
//!
//! ```text
//! curl -v http://localhost:8080/hello
//! curl -v -H 'Range: bytes=0-99,200-299' http://localhost:8080/wall
//! curl -v -F name=alice -F photo=@Cargo.toml http://localhost:8080/upload
//! ```

use tracing::Level;

use moor_web::hook::{UrlHook, hook_fn};
use moor_web::server::Server;
use moor_web::{HandlerError, Request, Response};

async fn hello(req: Request) -> Result<Response, HandlerError> {
    Ok(Response::text(format!("hello, {} (rest: {})\n", req.client_addr(), req.rest_path())))
}

async fn info(req: Request) -> Result<Response, HandlerError> {
    let value = serde_json::json!({
        "method": req.method().as_str(),
        "path": req.path(),
        "host": req.host(),
        "query_q": req.query("q"),
    });
    Response::json(&value).map_err(HandlerError::other)
}

async fn wall(_req: Request) -> Result<Response, HandlerError> {
    // big enough to trigger range serving and gzip auto-detection
    Ok(Response::bytes("text/plain", "all work and no play makes jack a dull boy\n".repeat(2_000)))
}

async fn upload(req: Request) -> Result<Response, HandlerError> {
    let name = req.form("name").unwrap_or("anonymous").to_owned();
    let summary = match req.file("photo") {
        Some(upload) => format!("{name} sent {} ({} bytes)\n", upload.filename(), upload.len()),
        None => format!("{name} sent no file\n"),
    };
    Ok(Response::text(summary))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let server = Server::builder().port(8080).build().expect("server config");
    let hooks = server.hooks();
    hooks.mount(UrlHook::path("/hello").unwrap(), hook_fn(hello)).unwrap();
    hooks.mount(UrlHook::path("/info").unwrap(), hook_fn(info)).unwrap();
    hooks.mount(UrlHook::path("/wall").unwrap(), hook_fn(wall)).unwrap();
    hooks.mount(UrlHook::path("/upload").unwrap(), hook_fn(upload)).unwrap();

    let handle = server.start().await.expect("bind");
    println!("listening on http://localhost:8080 — ctrl-c to stop");

    tokio::signal::ctrl_c().await.ok();
    handle.stop(false, true).await;
}
