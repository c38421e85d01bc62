//! End-to-end tests over real TCP sockets.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use moor_web::hook::{UrlHook, hook_fn};
use moor_web::server::{Server, ServerHandle};
use moor_web::{HandlerError, Protocols, Response};

async fn started_server() -> ServerHandle {
    let server = Server::builder()
        .port(0)
        .bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .build()
        .unwrap();

    server
        .hooks()
        .mount(
            UrlHook::builder().domain("example.com").build().unwrap(),
            hook_fn(|req| async move { Ok(Response::bytes("text/plain", format!("H1:{}", req.rest_path()))) }),
        )
        .unwrap();
    server
        .hooks()
        .mount(
            UrlHook::builder()
                .domain("api.example.com")
                .specific_domain()
                .path("/v1")
                .build()
                .unwrap(),
            hook_fn(|req| async move { Ok(Response::bytes("text/plain", format!("H2:{}", req.rest_path()))) }),
        )
        .unwrap();
    server
        .hooks()
        .mount(
            UrlHook::builder().protocols(Protocols::BOTH).path("/fail").build().unwrap(),
            hook_fn(|_req| async { Err(HandlerError::other("backend gone")) }),
        )
        .unwrap();

    server.start().await.unwrap()
}

async fn read_response(stream: &mut TcpStream) -> (String, HashMap<String, String>, Vec<u8>) {
    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.unwrap();
        assert_ne!(n, 0, "connection closed before a full response head");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();
    let mut lines = head.trim_end().split("\r\n");
    let status_line = lines.next().unwrap().to_owned();
    let mut headers = HashMap::new();
    for line in lines {
        let (name, value) = line.split_once(':').unwrap();
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
    }

    let length: usize = headers.get("content-length").map(|v| v.parse().unwrap()).unwrap_or(0);
    let mut body = buf[head_end..].to_vec();
    while body.len() < length {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.unwrap();
        assert_ne!(n, 0, "connection closed before a full response body");
        body.extend_from_slice(&chunk[..n]);
    }
    (status_line, headers, body)
}

#[tokio::test]
async fn hook_specificity_and_rest_paths() {
    let handle = started_server().await;
    let addr = handle.local_addr().unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // the specific api hook wins and strips its prefix
    stream
        .write_all(b"GET /v1/users HTTP/1.1\r\nHost: api.example.com\r\n\r\n")
        .await
        .unwrap();
    let (status, _, body) = read_response(&mut stream).await;
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(body, b"H2:/users");

    // same connection, different host: the loose domain hook matches
    stream
        .write_all(b"GET /v1 HTTP/1.1\r\nHost: www.example.com\r\n\r\n")
        .await
        .unwrap();
    let (status, _, body) = read_response(&mut stream).await;
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(body, b"H1:/v1");

    handle.stop(true, true).await;
}

#[tokio::test]
async fn unmatched_requests_get_404() {
    let handle = started_server().await;
    let addr = handle.local_addr().unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(b"GET / HTTP/1.1\r\nHost: nowhere.org\r\n\r\n").await.unwrap();
    let (status, _, _) = read_response(&mut stream).await;
    assert_eq!(status, "HTTP/1.1 404 Not Found");

    handle.stop(true, true).await;
}

#[tokio::test]
async fn error_handler_supplies_the_response() {
    let server = Server::builder()
        .port(0)
        .bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .error_handler(|e| {
            Some(Response::bytes("text/plain", format!("rescued: {e}")))
        })
        .build()
        .unwrap();
    server
        .hooks()
        .mount(
            UrlHook::path("/fail").unwrap(),
            hook_fn(|_req| async { Err(HandlerError::other("backend gone")) }),
        )
        .unwrap();
    let handle = server.start().await.unwrap();

    let mut stream = TcpStream::connect(handle.local_addr().unwrap()).await.unwrap();
    stream.write_all(b"GET /fail HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    let (status, _, body) = read_response(&mut stream).await;
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(body, b"rescued: backend gone");

    handle.stop(true, true).await;
}

#[tokio::test]
async fn stats_count_accepts_and_idle_connections() {
    let handle = started_server().await;
    let addr = handle.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET /v1 HTTP/1.1\r\nHost: example.com\r\n\r\n").await.unwrap();
    read_response(&mut stream).await;

    // the connection is now parked between keep-alive turns
    let mut parked = false;
    for _ in 0..50 {
        if handle.stats().keep_alive_idle() == 1 {
            parked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(parked, "connection should be counted as keep-alive idle");
    assert_eq!(handle.stats().total_accepted(), 1);
    assert_eq!(handle.stats().active(), 0);

    handle.stop(true, true).await;
}

#[tokio::test]
async fn graceful_stop_closes_idle_connections_and_listener() {
    let handle = started_server().await;
    let addr = handle.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET /v1 HTTP/1.1\r\nHost: example.com\r\n\r\n").await.unwrap();
    let (_, headers, _) = read_response(&mut stream).await;
    assert_eq!(headers["connection"], "keep-alive");

    handle.stop(false, true).await;

    // the parked connection was closed by the shutdown
    let mut chunk = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
        .await
        .expect("close should be prompt")
        .unwrap();
    assert_eq!(n, 0);

    // and the listening socket is gone
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn brutal_stop_aborts_in_flight_connections() {
    let server = Server::builder().port(0).bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST)).build().unwrap();
    server
        .hooks()
        .mount(
            UrlHook::path("/slow").unwrap(),
            hook_fn(|_req| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Response::bytes("text/plain", "late"))
            }),
        )
        .unwrap();
    let handle = server.start().await.unwrap();

    let mut stream = TcpStream::connect(handle.local_addr().unwrap()).await.unwrap();
    stream.write_all(b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

    // give the request a moment to reach the handler
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stopped = tokio::time::timeout(Duration::from_secs(5), handle.stop(true, true)).await;
    assert!(stopped.is_ok(), "brutal stop must not wait for the slow handler");

    let mut chunk = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
        .await
        .expect("socket should be closed")
        .unwrap_or(0);
    assert_eq!(n, 0, "the in-flight connection should observe a close");
}
