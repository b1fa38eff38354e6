//! Per-connection serving and request dispatch.
//!
//! The embedded application is a boxed async handler; everything behind it
//! (routing, business logic) belongs to the embedder. This module owns the
//! seam: run the handler, time it, and hand the completed transaction to the
//! access log.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpStream;

use crate::observability::{AccessLogger, RequestEvent};

/// Boxed response future produced by a handler.
pub type ResponseFuture = Pin<Box<dyn Future<Output = Response<Full<Bytes>>> + Send>>;

/// The embedded application: an async function over whole requests.
pub type Handler = Arc<dyn Fn(Request<Incoming>) -> ResponseFuture + Send + Sync>;

/// Built-in application used when the embedder supplies none.
pub fn default_app() -> Handler {
    Arc::new(|req| {
        let (status, body) = route(req.uri().path());
        Box::pin(async move {
            let mut response = Response::new(Full::new(Bytes::from_static(body)));
            *response.status_mut() = status;
            response
        })
    })
}

/// Routing table of the built-in application.
fn route(path: &str) -> (StatusCode, &'static [u8]) {
    match path {
        "/health" => (StatusCode::OK, b"OK\n"),
        _ => (StatusCode::NOT_FOUND, b"Not Found\n"),
    }
}

/// Serve one TCP connection with HTTP/1.1.
///
/// `keepalive` is the idle retention between requests on the same
/// connection; `None` closes after the first response.
pub async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: &Handler,
    logger: Option<&AccessLogger>,
    keepalive: Option<Duration>,
) {
    let io = TokioIo::new(stream);
    let app = app.clone();
    let logger = logger.cloned();
    let service =
        service_fn(move |req| handle(req, app.clone(), logger.clone(), peer));

    let mut builder = hyper::server::conn::http1::Builder::new();
    builder.timer(TokioTimer::new());
    match keepalive {
        Some(idle) => {
            builder.keep_alive(true).header_read_timeout(idle);
        }
        None => {
            builder.keep_alive(false);
        }
    }

    if let Err(e) = builder.serve_connection(io, service).await {
        tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
    }
}

/// Dispatch one request to the application and record the transaction.
async fn handle(
    req: Request<Incoming>,
    app: Handler,
    logger: Option<AccessLogger>,
    peer: SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let started = Instant::now();
    let timestamp = chrono::Local::now();

    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let protocol = format!("{:?}", req.version());
    let referrer = header_string(&req, header::REFERER);
    let user_agent = header_string(&req, header::USER_AGENT);

    let response = app(req).await;

    if let Some(logger) = &logger {
        use hyper::body::Body as _;

        logger.record(&RequestEvent {
            remote_addr: peer.ip(),
            method,
            path,
            query,
            protocol,
            status: response.status().as_u16(),
            bytes_sent: response.body().size_hint().exact().unwrap_or(0),
            referrer,
            user_agent,
            duration: started.elapsed(),
            timestamp,
            pid: std::process::id(),
        });
    }

    Ok(response)
}

fn header_string(req: &Request<Incoming>, name: header::HeaderName) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_route_is_ok() {
        let (status, body) = route("/health");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK\n");
    }

    #[test]
    fn unknown_routes_are_not_found() {
        let (status, _) = route("/nope");
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = route("/");
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
