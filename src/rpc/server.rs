//! JSON-RPC over HTTP/1.1 (optionally TLS), served with hyper.
//!
//! Each connection carries one request and is closed after the reply.
//! Credentials are HTTP Basic, compared as SHA-256 digests in constant
//! time. A command whose client hangs up is cancelled so long polls can
//! be abandoned. `/ws` upgrades to a notification websocket.

use base64::Engine;
use hyper::body::HttpBody;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, StatusCode};
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::error::{HandlerError, RpcError};
use super::handler::RpcHandler;
use super::tls;
use super::types::{Request, Response};
use super::websocket::{self, WsEvent, WsNotifier};
use crate::chain::{ChainNotification, Hash, TxDesc};
use crate::config::{Config, RpcConfig};
use crate::error::AppError;
use crate::network::MempoolListener;

/// Seconds a client has to send a complete request.
pub const RPC_AUTH_TIMEOUT_SECONDS: u64 = 10;
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;
const AUTH_CHALLENGE: &str = "Basic realm=\"pod RPC\"";

type AuthDigest = [u8; 32];
type HttpRequest = hyper::Request<Body>;
type HttpResponse = hyper::Response<Body>;

/// Digest of the `Authorization` header a client must send.
pub fn auth_digest(user: &str, pass: &str) -> AuthDigest {
    let login = format!("{}:{}", user, pass);
    let header = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(login)
    );
    Sha256::digest(header.as_bytes()).into()
}

/// One occupied client slot, released on drop.
pub struct ClientSlot(Arc<AtomicUsize>);

impl ClientSlot {
    /// Takes a slot unless `max` are already held.
    pub fn acquire(count: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()?;
        Some(Self(count.clone()))
    }
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn text_response(status: StatusCode, body: &'static str) -> HttpResponse {
    let mut resp = HttpResponse::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

fn unauthorized() -> HttpResponse {
    let mut resp = text_response(StatusCode::UNAUTHORIZED, "401 Unauthorized.\n");
    resp.headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(AUTH_CHALLENGE));
    resp
}

fn is_websocket_upgrade(req: &HttpRequest) -> bool {
    req.uri().path() == "/ws"
        && req
            .headers()
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Collects a request body, refusing anything over `MAX_BODY_BYTES`.
async fn read_body(mut body: Body) -> Result<Vec<u8>, String> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| e.to_string())?;
        if buf.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(format!("request body exceeds {} bytes", MAX_BODY_BYTES));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

pub struct RpcServer {
    handler: Arc<RpcHandler>,
    listeners: Vec<String>,
    auth: Option<AuthDigest>,
    limit_auth: Option<AuthDigest>,
    max_clients: usize,
    num_clients: Arc<AtomicUsize>,
    max_websockets: usize,
    num_websockets: Arc<AtomicUsize>,
    quirks: bool,
    tls: Option<TlsAcceptor>,
    notifier: WsNotifier,
    shutdown: CancellationToken,
}

impl RpcServer {
    pub fn new(config: &Config, handler: Arc<RpcHandler>) -> Result<Self, AppError> {
        let rpc: &RpcConfig = &config.rpc;
        let network = config.node.network_type();

        let auth = (!rpc.username.is_empty() && !rpc.password.is_empty())
            .then(|| auth_digest(&rpc.username, &rpc.password));
        let limit_auth = (!rpc.limit_user.is_empty() && !rpc.limit_pass.is_empty())
            .then(|| auth_digest(&rpc.limit_user, &rpc.limit_pass));
        if auth.is_none() && limit_auth.is_none() {
            return Err(AppError::Config(
                "RPC requires a username and password (or limited credentials)".into(),
            ));
        }

        let listeners = if rpc.listeners.is_empty() {
            vec![format!("127.0.0.1:{}", network.default_rpc_port())]
        } else {
            rpc.listeners.clone()
        };

        let tls = if rpc.tls {
            let data_dir = config.data_dir();
            let cert_path = if rpc.cert_path.is_empty() {
                data_dir.join("rpc.cert")
            } else {
                PathBuf::from(&rpc.cert_path)
            };
            let key_path = if rpc.key_path.is_empty() {
                data_dir.join("rpc.key")
            } else {
                PathBuf::from(&rpc.key_path)
            };
            let acceptor = tls::load_acceptor(&cert_path, &key_path)
                .map_err(|e| AppError::Initialization(format!("RPC TLS: {}", e)))?;
            Some(acceptor)
        } else {
            None
        };

        let shutdown = handler.node().rpc_shutdown_token();
        Ok(Self {
            handler,
            listeners,
            auth,
            limit_auth,
            max_clients: rpc.max_clients,
            num_clients: Arc::new(AtomicUsize::new(0)),
            max_websockets: rpc.max_websockets,
            num_websockets: Arc::new(AtomicUsize::new(0)),
            quirks: rpc.quirks,
            tls,
            notifier: WsNotifier::new(),
            shutdown,
        })
    }

    pub fn handler(&self) -> &Arc<RpcHandler> {
        &self.handler
    }

    pub fn notifier(&self) -> &WsNotifier {
        &self.notifier
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Binds every listener and spawns the accept loops plus the block
    /// notification task. Fails if any listener cannot be bound.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, AppError> {
        let node = self.handler.node().clone();
        node.set_mempool_listener(self.clone());

        let mut tasks = Vec::with_capacity(self.listeners.len() + 1);
        for addr in &self.listeners {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| AppError::Network(format!("failed to bind RPC listener {}: {}", addr, e)))?;
            tracing::info!("✅ RPC server listening on {}", addr);
            let server = self.clone();
            tasks.push(tokio::spawn(async move { server.accept_loop(listener).await }));
        }
        tasks.push(tokio::spawn(block_notifications(self.clone())));
        Ok(tasks)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, remote) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("RPC accept failed: {}", e);
                    continue;
                }
            };
            let server = self.clone();
            tokio::spawn(async move {
                match server.tls.clone() {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => server.serve_conn(tls_stream, remote).await,
                        Err(e) => tracing::debug!("RPC TLS handshake with {} failed: {}", remote, e),
                    },
                    None => server.serve_conn(stream, remote).await,
                }
            });
        }
        tracing::info!("RPC listener stopped");
    }

    /// Returns whether the connection is admin, or `None` on failure.
    pub fn check_auth(&self, authorization: Option<&str>) -> Option<bool> {
        let header = authorization?;
        let digest: AuthDigest = Sha256::digest(header.as_bytes()).into();
        // Limited users first; they are expected to make most calls.
        if let Some(limit) = &self.limit_auth {
            if bool::from(digest[..].ct_eq(&limit[..])) {
                return Some(false);
            }
        }
        if let Some(admin) = &self.auth {
            if bool::from(digest[..].ct_eq(&admin[..])) {
                return Some(true);
            }
        }
        None
    }

    async fn serve_conn<S>(self: Arc<Self>, stream: S, remote: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let slot = ClientSlot::acquire(&self.num_clients, self.max_clients);
        if slot.is_none() {
            tracing::info!("max RPC clients exceeded [{}] - disconnecting client {}", self.max_clients, remote);
        }
        let busy = slot.is_none();

        let server = self.clone();
        let service = service_fn(move |req| {
            let server = server.clone();
            async move { Ok::<_, Infallible>(server.route(req, remote, busy).await) }
        });
        let conn = Http::new()
            .http1_only(true)
            .http1_title_case_headers(true)
            .http1_header_read_timeout(Duration::from_secs(RPC_AUTH_TIMEOUT_SECONDS))
            .serve_connection(stream, service)
            .with_upgrades();
        if let Err(e) = conn.await {
            tracing::debug!("RPC connection with {} ended: {}", remote, e);
        }
        drop(slot);
    }

    async fn route(self: Arc<Self>, mut req: HttpRequest, remote: SocketAddr, busy: bool) -> HttpResponse {
        let mut resp = if busy {
            text_response(StatusCode::SERVICE_UNAVAILABLE, "503 Too busy.  Try again later.\n")
        } else if is_websocket_upgrade(&req) {
            return self.upgrade_websocket(&mut req, remote);
        } else {
            self.json_rpc(req, remote).await
        };
        resp.headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        resp
    }

    async fn json_rpc(&self, req: HttpRequest, remote: SocketAddr) -> HttpResponse {
        let authorization = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let Some(is_admin) = self.check_auth(authorization) else {
            tracing::warn!("RPC authentication failure from {}", remote);
            return unauthorized();
        };

        if self.shutdown.is_cancelled() {
            return text_response(StatusCode::SERVICE_UNAVAILABLE, "503 Server is shutting down.\n");
        }

        let timeout = Duration::from_secs(RPC_AUTH_TIMEOUT_SECONDS);
        let body = match tokio::time::timeout(timeout, read_body(req.into_body())).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                tracing::debug!("bad RPC request from {}: {}", remote, e);
                return text_response(StatusCode::BAD_REQUEST, "400 Bad Request.\n");
            }
            Err(_) => {
                tracing::debug!("RPC client {} timed out", remote);
                return text_response(StatusCode::REQUEST_TIMEOUT, "408 Request Timeout.\n");
            }
        };

        match self.json_rpc_read(&body, is_admin).await {
            Some(reply) => {
                let mut resp = HttpResponse::new(Body::from(reply));
                resp.headers_mut()
                    .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
                resp
            }
            None => HttpResponse::new(Body::empty()),
        }
    }

    /// Runs the JSON-RPC request in `body` and returns the reply body, or
    /// `None` when nothing should be written back.
    async fn json_rpc_read(&self, body: &[u8], is_admin: bool) -> Option<Vec<u8>> {
        let (id, outcome) = match serde_json::from_slice::<Request>(body) {
            Err(e) => (None, Err(RpcError::parse(e))),
            Ok(request) => {
                // Requests without an id are notifications unless quirks
                // mode answers id-less JSON-RPC 1.0 calls.
                if request.id.is_none() && !(self.quirks && request.jsonrpc.is_empty()) {
                    return None;
                }
                // Fires when hyper drops this future on client hangup.
                let close = CancellationToken::new();
                let _hangup = close.clone().drop_guard();

                let id = request.id.clone();
                let handler = self.handler.clone();
                let work = tokio::spawn(async move { handler.process(&request, is_admin, &close).await });
                match work.await {
                    Ok(Ok(value)) => (id, Ok(value)),
                    Ok(Err(HandlerError::Rpc(err))) => (id, Err(err)),
                    Ok(Err(HandlerError::ClientQuit)) => return None,
                    Err(e) => (id, Err(RpcError::internal(e, "request task"))),
                }
            }
        };

        match serde_json::to_vec(&Response::new(id, outcome)) {
            Ok(mut bytes) => {
                bytes.push(b'\n');
                Some(bytes)
            }
            Err(e) => {
                tracing::error!("Failed to marshal reply: {}", e);
                None
            }
        }
    }

    /// Answers the upgrade handshake and hands the socket to the websocket
    /// client loop. Credentials are optional here; without them the first
    /// message must be `authenticate`.
    fn upgrade_websocket(self: &Arc<Self>, req: &mut HttpRequest, remote: SocketAddr) -> HttpResponse {
        let accept = req
            .headers()
            .get(header::SEC_WEBSOCKET_KEY)
            .map(|key| derive_accept_key(key.as_bytes()))
            .and_then(|accept| HeaderValue::from_str(&accept).ok());
        let Some(accept) = accept else {
            return text_response(StatusCode::BAD_REQUEST, "400 Bad Request.\n");
        };

        let authorization = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let is_admin = match authorization {
            None => None,
            Some(header) => match self.check_auth(Some(header)) {
                Some(admin) => Some(admin),
                None => {
                    tracing::warn!("websocket authentication failure from {}", remote);
                    return unauthorized();
                }
            },
        };

        let Some(slot) = ClientSlot::acquire(&self.num_websockets, self.max_websockets) else {
            tracing::info!(
                "max websocket clients exceeded [{}] - disconnecting client {}",
                self.max_websockets,
                remote
            );
            return text_response(StatusCode::SERVICE_UNAVAILABLE, "503 Too busy.  Try again later.\n");
        };

        let upgrade = hyper::upgrade::on(req);
        let server = self.clone();
        tokio::spawn(async move {
            match upgrade.await {
                Ok(upgraded) => {
                    let ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
                    websocket::serve_client(server, ws, is_admin, remote).await;
                }
                Err(e) => tracing::debug!("websocket upgrade with {} failed: {}", remote, e),
            }
            drop(slot);
        });

        let mut resp = HttpResponse::new(Body::empty());
        *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = resp.headers_mut();
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
        resp
    }
}

impl MempoolListener for RpcServer {
    fn notify_mempool_tx(&self, last_updated: i64) {
        self.handler.gbt().notify_mempool_tx(last_updated);
    }

    fn notify_new_transactions(&self, txns: &[TxDesc]) {
        self.notifier.notify_new_transactions(txns);
    }
}

/// Wakes long pollers when a block lands on the main chain and forwards
/// chain changes to websocket clients.
async fn block_notifications(server: Arc<RpcServer>) {
    let node = server.handler.node().clone();
    let mut rx = node.chain.subscribe();
    let block_time = |hash: &Hash| node.chain.header_by_hash(hash).map(|h| h.timestamp).unwrap_or_default();
    loop {
        let notification = tokio::select! {
            _ = server.shutdown.cancelled() => break,
            n = rx.recv() => n,
        };
        match notification {
            Ok(ChainNotification::BlockConnected { hash, height }) => {
                if node.sync_manager.is_current() {
                    server.handler.gbt().notify_block_connected(&hash);
                }
                let time = block_time(&hash);
                server.notifier.publish(WsEvent::BlockConnected { hash, height, time });
            }
            Ok(ChainNotification::BlockDisconnected { hash, height }) => {
                let time = block_time(&hash);
                server.notifier.publish(WsEvent::BlockDisconnected { hash, height, time });
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("RPC missed {} chain notifications", n);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_digest_matches_header() {
        let header = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("user:pass")
        );
        let digest: AuthDigest = Sha256::digest(header.as_bytes()).into();
        assert_eq!(digest, auth_digest("user", "pass"));
        assert_ne!(digest, auth_digest("user", "other"));
    }

    #[test]
    fn test_client_slots_never_exceed_max() {
        let count = Arc::new(AtomicUsize::new(0));
        let first = ClientSlot::acquire(&count, 2).unwrap();
        let second = ClientSlot::acquire(&count, 2).unwrap();
        assert!(ClientSlot::acquire(&count, 2).is_none());
        assert_eq!(count.load(Ordering::SeqCst), 2);

        drop(first);
        let third = ClientSlot::acquire(&count, 2);
        assert!(third.is_some());
        drop(second);
        drop(third);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_acquire_respects_max() {
        let count = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let count = count.clone();
                std::thread::spawn(move || ClientSlot::acquire(&count, 4))
            })
            .collect();
        let slots: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(slots.len(), 4);
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_read_body_caps_size() {
        let body = read_body(Body::from("hello")).await.unwrap();
        assert_eq!(body, b"hello");
        assert!(read_body(Body::from(vec![0u8; MAX_BODY_BYTES + 1])).await.is_err());
    }
}
