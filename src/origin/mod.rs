//! Origin servers.
//!
//! An *origin* is the in-process HTTP server the tunnel points at: a
//! reverse proxy in port mode, a static file server in files mode. Both
//! share the accept-loop/shutdown plumbing here: a TCP listener on a free
//! localhost port, one task per connection, and a watch-channel shutdown
//! that lets in-flight requests finish.

mod error;
pub mod files;
pub mod proxy;
pub mod range;
pub mod render;

pub use error::OriginError;

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{Local, SecondsFormat};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::access::AccessState;
use crate::netutil::find_free_port;
use crate::policy::AccessMode;

/// Body type produced by the origins.
pub type OriginBody = BoxBody<Bytes, hyper::Error>;

/// A request handler hosted by the shared accept loop.
pub trait OriginService: Send + Sync + 'static {
    /// Handle one request from `remote`.
    fn call(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
        remote: SocketAddr,
    ) -> impl Future<Output = Response<OriginBody>> + Send;
}

/// Handle to a running origin server.
pub struct OriginHandle {
    /// The localhost port the origin listens on.
    pub port: u16,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl OriginHandle {
    /// Signal shutdown and wait briefly for the accept loop to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(2), self.task).await;
    }
}

/// Bind a free localhost port and run `service` behind it.
pub async fn spawn_origin<S: OriginService>(service: Arc<S>) -> Result<OriginHandle, OriginError> {
    let port = find_free_port()?;
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    debug!("origin listening on 127.0.0.1:{port}");
    let task = tokio::spawn(accept_loop(listener, shutdown_rx, service));

    Ok(OriginHandle {
        port,
        shutdown_tx,
        task,
    })
}

async fn accept_loop<S: OriginService>(
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
    service: Arc<S>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, remote)) => {
                        let service = service.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let svc = service_fn(move |req| {
                                let service = service.clone();
                                async move {
                                    Ok::<_, Infallible>(service.call(req, remote).await)
                                }
                            });
                            if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                                debug!("origin connection ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("origin accept failed: {e}");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("origin shutting down");
                    break;
                }
            }
        }
    }
}

/// Current time, ISO-8601 millisecond with local offset, for origin-side
/// logs and stats.
pub(crate) fn now_iso() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Millis, false)
}

/// A full in-memory body.
pub(crate) fn full_body(bytes: impl Into<Bytes>) -> OriginBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

/// An empty body.
pub(crate) fn empty_body() -> OriginBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// A JSON error response `{ "error": <kind>, ... }`.
pub(crate) fn json_error(status: StatusCode, body: serde_json::Value) -> Response<OriginBody> {
    let payload = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(full_body(payload));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// The 401 response, with a basic-auth challenge when applicable.
pub(crate) fn unauthorized_response(access: &AccessState) -> Response<OriginBody> {
    let mut response = json_error(
        StatusCode::UNAUTHORIZED,
        serde_json::json!({"error": "unauthorized"}),
    );
    if access.mode == AccessMode::Basic {
        response.headers_mut().insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"cfshare\""),
        );
    }
    response
}
