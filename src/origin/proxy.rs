//! Reverse proxy origin for port exposures.
//!
//! Wraps an upstream `http://127.0.0.1:<port>`, layering the session's
//! access controls in front: rate limit, path allow-list, authorization.
//! Each request opens a fresh upstream connection; the response streams
//! back with body bytes counted into the session stats. Once response
//! headers are out, an upstream failure cannot replace the status; the
//! stream just ends.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

use super::{json_error, now_iso, unauthorized_response, OriginBody, OriginService};
use crate::access::{authorize, path_allowed, AuthOutcome};
use crate::session::record::{LogComponent, SessionShared};

/// The reverse proxy origin.
pub struct ReverseProxyOrigin {
    upstream_port: u16,
    shared: Arc<SessionShared>,
}

impl ReverseProxyOrigin {
    /// Create a proxy forwarding to `127.0.0.1:upstream_port`.
    pub fn new(upstream_port: u16, shared: Arc<SessionShared>) -> Self {
        Self {
            upstream_port,
            shared,
        }
    }

    async fn forward(&self, req: Request<Incoming>) -> Response<OriginBody> {
        let upstream_addr = SocketAddr::from(([127, 0, 0, 1], self.upstream_port));
        let stream = match TcpStream::connect(upstream_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                self.shared.log(
                    now_iso(),
                    LogComponent::Origin,
                    format!("upstream connect failed: {e}"),
                );
                return json_error(
                    StatusCode::BAD_GATEWAY,
                    serde_json::json!({"error": "proxy_error"}),
                );
            }
        };

        let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await
        {
            Ok(pair) => pair,
            Err(e) => {
                self.shared.log(
                    now_iso(),
                    LogComponent::Origin,
                    format!("upstream handshake failed: {e}"),
                );
                return json_error(
                    StatusCode::BAD_GATEWAY,
                    serde_json::json!({"error": "proxy_error"}),
                );
            }
        };
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("upstream connection ended: {e}");
            }
        });

        // Forward method, path+query, headers and body; only Host is
        // rewritten to the upstream authority.
        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let mut builder = Request::builder().method(parts.method).uri(path_and_query);
        for (name, value) in parts.headers.iter() {
            if name != HOST {
                builder = builder.header(name, value);
            }
        }
        let host_value = format!("127.0.0.1:{}", self.upstream_port);
        builder = builder.header(
            HOST,
            HeaderValue::from_str(&host_value).expect("host header is ascii"),
        );

        let upstream_req = match builder.body(body) {
            Ok(req) => req,
            Err(e) => {
                self.shared.log(
                    now_iso(),
                    LogComponent::Origin,
                    format!("failed to build upstream request: {e}"),
                );
                return json_error(
                    StatusCode::BAD_GATEWAY,
                    serde_json::json!({"error": "proxy_error"}),
                );
            }
        };

        match sender.send_request(upstream_req).await {
            Ok(response) => {
                let shared = self.shared.clone();
                let (parts, body) = response.into_parts();
                let counted = body
                    .map_frame(move |frame| {
                        if let Some(data) = frame.data_ref() {
                            shared.add_bytes_sent(data.len() as u64);
                        }
                        frame
                    })
                    .boxed();
                Response::from_parts(parts, counted)
            }
            Err(e) => {
                self.shared.log(
                    now_iso(),
                    LogComponent::Origin,
                    format!("upstream request failed: {e}"),
                );
                json_error(
                    StatusCode::BAD_GATEWAY,
                    serde_json::json!({"error": "proxy_error"}),
                )
            }
        }
    }
}

impl OriginService for ReverseProxyOrigin {
    async fn call(self: Arc<Self>, req: Request<Incoming>, remote: SocketAddr) -> Response<OriginBody> {
        self.shared.note_request(now_iso());

        if !self.shared.limiter.check(remote.ip()) {
            self.shared.log(
                now_iso(),
                LogComponent::Origin,
                format!("rate limited {} {} from {}", req.method(), req.uri().path(), remote.ip()),
            );
            return json_error(
                StatusCode::TOO_MANY_REQUESTS,
                serde_json::json!({"error": "rate_limited"}),
            );
        }

        let path = req.uri().path().to_string();
        if !path_allowed(&self.shared.access.allowlist_paths, &path) {
            return json_error(
                StatusCode::FORBIDDEN,
                serde_json::json!({"error": "path_not_allowed", "path": path}),
            );
        }

        if authorize(&self.shared.access, req.uri().query(), req.headers()) == AuthOutcome::Unauthorized
        {
            return unauthorized_response(&self.shared.access);
        }

        // CONNECT has no meaning behind the tunnel.
        if req.method() == Method::CONNECT {
            return json_error(
                StatusCode::METHOD_NOT_ALLOWED,
                serde_json::json!({"error": "method_not_allowed"}),
            );
        }

        self.forward(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessState, RateLimiter};
    use crate::origin::spawn_origin;
    use crate::policy::{AccessMode, RateLimitPolicy};
    use crate::session::record::{ExposeKind, LogRing, SessionStats};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Minimal upstream that answers every request with `200 hi`.
    async fn spawn_upstream() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nhi",
                        )
                        .await;
                });
            }
        });
        port
    }

    fn shared(access: AccessState, limiter: RateLimiter) -> Arc<SessionShared> {
        let (stop_tx, _stop_rx) = mpsc::unbounded_channel();
        Arc::new(SessionShared {
            id: "port_test_aabbcc".to_string(),
            kind: ExposeKind::Port,
            access,
            limiter,
            max_downloads: None,
            stats: Mutex::new(SessionStats::default()),
            logs: LogRing::new(),
            stop_tx,
        })
    }

    async fn get(port: u16, path_and_query: &str, extra_header: Option<(&str, &str)>) -> (u16, String) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let header = extra_header
            .map(|(k, v)| format!("{k}: {v}\r\n"))
            .unwrap_or_default();
        let request = format!(
            "GET {path_and_query} HTTP/1.1\r\nhost: localhost\r\n{header}connection: close\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let status: u16 = response
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap();
        (status, response)
    }

    #[tokio::test]
    async fn test_forwards_to_upstream() {
        let upstream = spawn_upstream().await;
        let shared = shared(
            AccessState::issue(AccessMode::None, false, Vec::new()),
            RateLimiter::disabled(),
        );
        let origin = spawn_origin(Arc::new(ReverseProxyOrigin::new(upstream, shared.clone())))
            .await
            .unwrap();

        let (status, body) = get(origin.port, "/anything", None).await;
        assert_eq!(status, 200);
        assert!(body.ends_with("hi"));

        let stats = shared.stats_snapshot();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.bytes_sent, 2);
        origin.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_502() {
        let dead_port = crate::netutil::find_free_port().unwrap();
        let shared = shared(
            AccessState::issue(AccessMode::None, false, Vec::new()),
            RateLimiter::disabled(),
        );
        let origin = spawn_origin(Arc::new(ReverseProxyOrigin::new(dead_port, shared)))
            .await
            .unwrap();

        let (status, body) = get(origin.port, "/", None).await;
        assert_eq!(status, 502);
        assert!(body.contains("proxy_error"));
        origin.shutdown().await;
    }

    #[tokio::test]
    async fn test_token_auth_enforced() {
        let upstream = spawn_upstream().await;
        let access = AccessState::issue(AccessMode::Token, true, Vec::new());
        let token = access.token.clone().unwrap();
        let shared = shared(access, RateLimiter::disabled());
        let origin = spawn_origin(Arc::new(ReverseProxyOrigin::new(upstream, shared)))
            .await
            .unwrap();

        let (status, body) = get(origin.port, "/", None).await;
        assert_eq!(status, 401);
        assert!(body.contains("unauthorized"));

        let (status, _) = get(origin.port, &format!("/?token={token}"), None).await;
        assert_eq!(status, 200);

        let (status, _) = get(origin.port, "/", Some(("x-cfshare-token", &token))).await;
        assert_eq!(status, 200);
        origin.shutdown().await;
    }

    #[tokio::test]
    async fn test_path_allowlist_enforced() {
        let upstream = spawn_upstream().await;
        let access = AccessState::issue(AccessMode::None, false, vec!["/api".to_string()]);
        let shared = shared(access, RateLimiter::disabled());
        let origin = spawn_origin(Arc::new(ReverseProxyOrigin::new(upstream, shared)))
            .await
            .unwrap();

        let (status, body) = get(origin.port, "/private", None).await;
        assert_eq!(status, 403);
        assert!(body.contains("path_not_allowed"));

        let (status, _) = get(origin.port, "/api/v1", None).await;
        assert_eq!(status, 200);
        origin.shutdown().await;
    }

    #[tokio::test]
    async fn test_rate_limit_enforced() {
        let upstream = spawn_upstream().await;
        let limiter = RateLimiter::from_policy(&RateLimitPolicy {
            enabled: true,
            window_ms: 60_000,
            max_requests: 2,
        });
        let shared = shared(
            AccessState::issue(AccessMode::None, false, Vec::new()),
            limiter,
        );
        let origin = spawn_origin(Arc::new(ReverseProxyOrigin::new(upstream, shared)))
            .await
            .unwrap();

        let (s1, _) = get(origin.port, "/", None).await;
        let (s2, _) = get(origin.port, "/", None).await;
        let (s3, body) = get(origin.port, "/", None).await;
        assert_eq!((s1, s2, s3), (200, 200, 429));
        assert!(body.contains("rate_limited"));
        origin.shutdown().await;
    }
}
