//! Websocket JSON-RPC clients on `/ws`.
//!
//! A client either presents HTTP Basic credentials on the upgrade or sends
//! `authenticate [user, pass]` as its first request. After that it may run
//! any command the HTTP listener accepts plus the session and
//! notification commands below. Notifications are JSON-RPC 1.0 requests
//! with a null id:
//!
//!   blockconnected      [hash, height, time]
//!   blockdisconnected   [hash, height, time]
//!   txaccepted          [txid, amount]
//!   txacceptedverbose   [rawtx]

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::error::{HandlerError, RpcError};
use super::handler::{coins, tx_raw_result, RPC_LIMITED};
use super::server::RpcServer;
use super::types::{Params, Request, Response};
use crate::chain::{Hash, Tx, TxDesc};
use crate::network_type::NetworkType;

const WS_EVENT_BUFFER: usize = 256;
const WS_HEARTBEAT_SECONDS: u64 = 30;

/// Wallet-facing notification commands this node does not serve.
const WS_UNIMPLEMENTED: &[&str] = &[
    "loadtxfilter",
    "notifyreceived",
    "notifyspent",
    "rescan",
    "rescanblocks",
    "stopnotifyreceived",
    "stopnotifyspent",
];

#[derive(Clone, Debug)]
pub enum WsEvent {
    BlockConnected { hash: Hash, height: i32, time: i64 },
    BlockDisconnected { hash: Hash, height: i32, time: i64 },
    TxAccepted(Arc<Tx>),
}

/// Fans chain and mempool events out to every websocket client.
pub struct WsNotifier {
    events: broadcast::Sender<WsEvent>,
}

impl Default for WsNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl WsNotifier {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WS_EVENT_BUFFER);
        Self { events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: WsEvent) {
        // No receivers just means no websocket clients.
        let _ = self.events.send(event);
    }

    pub fn notify_new_transactions(&self, txns: &[TxDesc]) {
        for desc in txns {
            self.publish(WsEvent::TxAccepted(Arc::new(desc.tx.clone())));
        }
    }
}

fn notification(method: &str, params: Value) -> String {
    json!({
        "jsonrpc": "1.0",
        "method": method,
        "params": params,
        "id": null,
    })
    .to_string()
}

fn encode_reply(id: Option<Value>, outcome: Result<Value, RpcError>) -> Option<String> {
    match serde_json::to_string(&Response::new(id, outcome)) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::error!("Failed to marshal websocket reply: {}", e);
            None
        }
    }
}

/// Per-connection state.
struct WsClient {
    remote: SocketAddr,
    network: NetworkType,
    /// `None` until the client authenticates.
    is_admin: Option<bool>,
    session_id: u64,
    notify_blocks: bool,
    /// `Some(verbose)` while transaction notifications are on.
    notify_txs: Option<bool>,
}

impl WsClient {
    /// Renders an event for this client, or `None` if it is not subscribed.
    fn render(&self, event: &WsEvent) -> Option<String> {
        match event {
            WsEvent::BlockConnected { hash, height, time } if self.notify_blocks => Some(notification(
                "blockconnected",
                json!([hash.to_string(), height, time]),
            )),
            WsEvent::BlockDisconnected { hash, height, time } if self.notify_blocks => Some(notification(
                "blockdisconnected",
                json!([hash.to_string(), height, time]),
            )),
            WsEvent::TxAccepted(tx) => match self.notify_txs? {
                false => {
                    let amount: i64 = tx.tx_out.iter().map(|out| out.value).sum();
                    Some(notification(
                        "txaccepted",
                        json!([tx.tx_hash().to_string(), coins(amount)]),
                    ))
                }
                true => {
                    let raw = serde_json::to_value(tx_raw_result(tx, self.network)).ok()?;
                    Some(notification("txacceptedverbose", json!([raw])))
                }
            },
            _ => None,
        }
    }

    /// Handles one text frame. Returns the immediate reply, if any, or an
    /// error naming why the connection must be dropped. Commands shared
    /// with the HTTP listener run on their own task and answer through
    /// `replies`.
    fn handle_text(
        &mut self,
        server: &Arc<RpcServer>,
        text: &str,
        replies: &mpsc::UnboundedSender<String>,
        close: &CancellationToken,
    ) -> Result<Option<String>, String> {
        let request: Request = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(_) if self.is_admin.is_none() => {
                return Err("unauthenticated client sent malformed JSON".to_string());
            }
            Err(e) => return Ok(encode_reply(None, Err(RpcError::parse(e)))),
        };

        let Some(is_admin) = self.is_admin else {
            if request.method != "authenticate" {
                return Err(format!("unauthenticated client sent {}", request.method));
            }
            let params = Params::from_value(request.params.clone());
            let user: String = params.req(0, "username").map_err(|e| e.message)?;
            let pass: String = params.req(1, "passphrase").map_err(|e| e.message)?;
            let login = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
            let Some(admin) = server.check_auth(Some(&format!("Basic {}", login))) else {
                return Err("authentication failure".to_string());
            };
            self.is_admin = Some(admin);
            tracing::debug!("websocket client {} authenticated (admin: {})", self.remote, admin);
            if request.id.is_none() {
                return Ok(None);
            }
            return Ok(encode_reply(request.id, Ok(Value::Null)));
        };

        if request.method == "authenticate" {
            return Err("client authenticated twice".to_string());
        }

        let method = request.method.as_str();
        let outcome = if !is_admin && !RPC_LIMITED.contains(&method) {
            Err(RpcError::limited_user())
        } else {
            match method {
                "session" => Ok(json!({ "sessionid": self.session_id })),
                "notifyblocks" => {
                    self.notify_blocks = true;
                    Ok(Value::Null)
                }
                "stopnotifyblocks" => {
                    self.notify_blocks = false;
                    Ok(Value::Null)
                }
                "notifynewtransactions" => {
                    let params = Params::from_value(request.params.clone());
                    params.opt::<bool>(0, "verbose").map(|verbose| {
                        self.notify_txs = Some(verbose.unwrap_or(false));
                        Value::Null
                    })
                }
                "stopnotifynewtransactions" => {
                    self.notify_txs = None;
                    Ok(Value::Null)
                }
                m if WS_UNIMPLEMENTED.contains(&m) => Err(RpcError::unimplemented()),
                _ => {
                    self.spawn_command(server, request, is_admin, replies, close);
                    return Ok(None);
                }
            }
        };

        if request.id.is_none() {
            return Ok(None);
        }
        Ok(encode_reply(request.id, outcome))
    }

    fn spawn_command(
        &self,
        server: &Arc<RpcServer>,
        request: Request,
        is_admin: bool,
        replies: &mpsc::UnboundedSender<String>,
        close: &CancellationToken,
    ) {
        let handler = server.handler().clone();
        let replies = replies.clone();
        let close = close.clone();
        tokio::spawn(async move {
            let outcome = match handler.process(&request, is_admin, &close).await {
                Ok(value) => Ok(value),
                Err(HandlerError::Rpc(err)) => Err(err),
                Err(HandlerError::ClientQuit) => return,
            };
            if request.id.is_none() {
                return;
            }
            if let Some(text) = encode_reply(request.id, outcome) {
                let _ = replies.send(text);
            }
        });
    }
}

/// Runs one websocket client until it disconnects, fails to
/// authenticate, or the RPC server shuts down.
pub async fn serve_client<S>(
    server: Arc<RpcServer>,
    ws: WebSocketStream<S>,
    is_admin: Option<bool>,
    remote: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    tracing::debug!("websocket client connected: {}", remote);
    let (mut ws_sender, mut ws_receiver) = ws.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();
    let mut events = server.notifier().subscribe();
    let shutdown = server.shutdown_token();

    // Cancels commands still running when the client goes away.
    let close = CancellationToken::new();
    let _close_on_exit = close.clone().drop_guard();

    let mut client = WsClient {
        remote,
        network: server.handler().node().settings.network,
        is_admin,
        session_id: rand::random(),
        notify_blocks: false,
        notify_txs: None,
    };

    let mut heartbeat = tokio::time::interval(Duration::from_secs(WS_HEARTBEAT_SECONDS));

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match client.handle_text(&server, text.as_str(), &reply_tx, &close) {
                            Ok(Some(reply)) => {
                                if ws_sender.send(Message::Text(reply.into())).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(reason) => {
                                tracing::warn!("disconnecting websocket client {}: {}", remote, reason);
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!("websocket receive error from {}: {}", remote, e);
                        break;
                    }
                    _ => {}
                }
            }

            Some(reply) = reply_rx.recv() => {
                if ws_sender.send(Message::Text(reply.into())).await.is_err() {
                    break;
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Some(text) = client.render(&event) {
                            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("websocket client {} lagged by {} events", remote, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = heartbeat.tick() => {
                if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }

            _ = shutdown.cancelled() => break,
        }
    }

    let _ = ws_sender.close().await;
    tracing::debug!("websocket client disconnected: {}", remote);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{OutPoint, TxIn, TxOut};

    fn client(notify_blocks: bool, notify_txs: Option<bool>) -> WsClient {
        WsClient {
            remote: "127.0.0.1:1".parse().unwrap(),
            network: NetworkType::Simnet,
            is_admin: Some(true),
            session_id: 7,
            notify_blocks,
            notify_txs,
        }
    }

    fn sample_tx() -> Arc<Tx> {
        Arc::new(Tx {
            version: 1,
            tx_in: vec![TxIn {
                previous_out_point: OutPoint {
                    hash: Hash::default(),
                    index: 0,
                },
                signature_script: vec![0x51],
                sequence: u32::MAX,
            }],
            tx_out: vec![
                TxOut {
                    value: 150_000_000,
                    pk_script: vec![0x51],
                },
                TxOut {
                    value: 50_000_000,
                    pk_script: vec![0x51],
                },
            ],
            lock_time: 0,
        })
    }

    #[test]
    fn test_block_events_need_subscription() {
        let event = WsEvent::BlockConnected {
            hash: Hash::default(),
            height: 3,
            time: 1_600_000_000,
        };
        assert!(client(false, None).render(&event).is_none());

        let text = client(true, None).render(&event).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["method"], "blockconnected");
        assert_eq!(v["params"][1], 3);
        assert_eq!(v["params"][2], 1_600_000_000i64);
        assert!(v["id"].is_null());
    }

    #[test]
    fn test_tx_events_follow_verbosity() {
        let event = WsEvent::TxAccepted(sample_tx());
        assert!(client(true, None).render(&event).is_none());

        let v: Value = serde_json::from_str(&client(false, Some(false)).render(&event).unwrap()).unwrap();
        assert_eq!(v["method"], "txaccepted");
        assert_eq!(v["params"][0], sample_tx().tx_hash().to_string());
        assert!((v["params"][1].as_f64().unwrap() - 2.0).abs() < 1e-9);

        let v: Value = serde_json::from_str(&client(false, Some(true)).render(&event).unwrap()).unwrap();
        assert_eq!(v["method"], "txacceptedverbose");
        assert_eq!(v["params"][0]["txid"], sample_tx().tx_hash().to_string());
        assert_eq!(v["params"][0]["vout"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_notifier_without_clients_is_silent() {
        let notifier = WsNotifier::new();
        notifier.publish(WsEvent::TxAccepted(sample_tx()));

        let mut rx = notifier.subscribe();
        notifier.publish(WsEvent::BlockDisconnected {
            hash: Hash::default(),
            height: 1,
            time: 0,
        });
        assert!(matches!(rx.recv().await.unwrap(), WsEvent::BlockDisconnected { height: 1, .. }));
    }
}
