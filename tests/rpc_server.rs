mod common;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use common::{test_node, test_settings, TestNode};
use podd::address::{Address, AddressKind};
use podd::chain::{Chain, Hash, OutPoint, Tx, TxIn, TxMemPool, TxOut};
use podd::config::Config;
use podd::kopach::HashrateMeter;
use podd::network::NodeSettings;
use podd::network_type::NetworkType;
use podd::rpc::error::{
    ERR_RPC_BLOCK_NOT_FOUND, ERR_RPC_INTERNAL, ERR_RPC_INVALID_PARAMETER, ERR_RPC_INVALID_PARAMS,
    ERR_RPC_INVALID_TX_VOUT, ERR_RPC_METHOD_NOT_FOUND, ERR_RPC_NO_TX_INFO, ERR_RPC_NO_WALLET,
    ERR_RPC_OUT_OF_RANGE, ERR_RPC_TYPE,
};
use podd::rpc::types::Request;
use podd::rpc::{GbtWorkState, HandlerError, RpcHandler, RpcServer, RPC_HANDLERS};

fn handler(t: &TestNode) -> Arc<RpcHandler> {
    let gbt = Arc::new(GbtWorkState::new(t.time_source.clone()));
    Arc::new(RpcHandler::new(
        t.node.clone(),
        gbt,
        Arc::new(HashrateMeter::new()),
        2,
        RPC_HANDLERS,
    ))
}

fn request(method: &str, params: Value) -> Request {
    Request {
        jsonrpc: "1.0".to_string(),
        method: method.to_string(),
        params,
        id: Some(json!(1)),
    }
}

async fn call(h: &RpcHandler, method: &str, params: Value, admin: bool) -> Result<Value, HandlerError> {
    h.process(&request(method, params), admin, &CancellationToken::new())
        .await
}

fn rpc_code(res: Result<Value, HandlerError>) -> i32 {
    match res {
        Err(HandlerError::Rpc(e)) => e.code,
        other => panic!("expected an RPC error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dispatch_and_fallbacks() {
    let t = test_node(test_settings());
    let h = handler(&t);

    assert_eq!(call(&h, "getblockcount", json!([]), true).await.unwrap(), json!(0));
    assert_eq!(call(&h, "getgenerate", json!([]), true).await.unwrap(), json!(false));
    assert_eq!(rpc_code(call(&h, "getbalance", json!([]), true).await), ERR_RPC_NO_WALLET);
    assert_eq!(rpc_code(call(&h, "frobnicate", json!([]), true).await), ERR_RPC_METHOD_NOT_FOUND);
    assert_eq!(rpc_code(call(&h, "getblockhash", json!([99]), true).await), ERR_RPC_OUT_OF_RANGE);
}

#[tokio::test]
async fn test_limited_user_is_restricted() {
    let t = test_node(test_settings());
    let h = handler(&t);

    assert!(call(&h, "getbestblockhash", json!([]), false).await.is_ok());
    assert_eq!(rpc_code(call(&h, "stop", json!([]), false).await), ERR_RPC_INVALID_PARAMS);
    // wallet commands are refused before the wallet check for limited users
    assert_eq!(rpc_code(call(&h, "getbalance", json!([]), false).await), ERR_RPC_INVALID_PARAMS);
}

#[tokio::test]
async fn test_help_lists_commands() {
    let t = test_node(test_settings());
    let h = handler(&t);

    let usage = call(&h, "help", json!([]), true).await.unwrap();
    let usage = usage.as_str().unwrap();
    assert!(usage.contains("getblocktemplate"));
    assert!(usage.contains("submitblock"));

    let one = call(&h, "help", json!(["getblockcount"]), true).await.unwrap();
    assert!(one.as_str().unwrap().starts_with("getblockcount"));

    assert_eq!(
        rpc_code(call(&h, "help", json!(["nope"]), true).await),
        ERR_RPC_INVALID_PARAMETER
    );
}

#[tokio::test]
async fn test_stop_requests_shutdown() {
    let t = test_node(test_settings());
    let h = handler(&t);

    let reply = call(&h, "stop", json!([]), true).await.unwrap();
    assert_eq!(reply, json!("node stopping"));
    tokio::time::timeout(Duration::from_secs(1), t.node.shutdown_requested().cancelled())
        .await
        .unwrap();
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn start_server(t: &TestNode, port: u16) -> Vec<JoinHandle<()>> {
    let mut config = Config::default();
    config.node.network = "regtest".to_string();
    config.rpc.listeners = vec![format!("127.0.0.1:{}", port)];
    config.rpc.username = "admin".to_string();
    config.rpc.password = "secret".to_string();
    config.rpc.limit_user = "viewer".to_string();
    config.rpc.limit_pass = "look".to_string();

    let server = Arc::new(RpcServer::new(&config, handler(t)).unwrap());
    server.start().await.unwrap()
}

async fn stop_server(t: &TestNode, tasks: Vec<JoinHandle<()>>) {
    t.node.stop().unwrap();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}

fn basic_auth(user: &str, pass: &str) -> String {
    let token = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
    format!("Basic {}", token)
}

fn reply_body(reply: &str) -> Value {
    serde_json::from_str(reply.split("\r\n\r\n").nth(1).unwrap().trim()).unwrap()
}

async fn read_reply(mut stream: TcpStream) -> String {
    let mut reply = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut reply))
        .await
        .unwrap()
        .unwrap();
    reply
}

async fn post(port: u16, auth: Option<(&str, &str)>, body: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut head = format!(
        "POST / HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n",
        body.len()
    );
    if let Some((user, pass)) = auth {
        head.push_str(&format!("Authorization: {}\r\n", basic_auth(user, pass)));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(body.as_bytes()).await.unwrap();
    read_reply(stream).await
}

#[tokio::test]
async fn test_http_round_trip_with_auth() {
    let t = test_node(test_settings());
    let port = free_port();
    let tasks = start_server(&t, port).await;

    let body = r#"{"jsonrpc":"1.0","id":7,"method":"getblockcount","params":[]}"#;
    let reply = post(port, Some(("admin", "secret")), body).await;
    assert!(reply.starts_with("HTTP/1.1 200 OK"));
    let json_body = reply_body(&reply);
    assert_eq!(json_body["id"], json!(7));
    assert_eq!(json_body["result"], json!(0));
    assert_eq!(json_body["error"], Value::Null);

    let reply = post(port, Some(("admin", "wrong")), body).await;
    assert!(reply.starts_with("HTTP/1.1 401"));
    assert!(reply
        .to_ascii_lowercase()
        .contains("www-authenticate: basic realm=\"pod rpc\""));

    let stop = r#"{"jsonrpc":"1.0","id":1,"method":"stop","params":[]}"#;
    let reply = post(port, Some(("viewer", "look")), stop).await;
    let json_body = reply_body(&reply);
    assert_eq!(json_body["result"], Value::Null);
    assert_eq!(json_body["error"]["code"], json!(ERR_RPC_INVALID_PARAMS));

    let reply = post(port, Some(("admin", "secret")), "{not json").await;
    let json_body = reply_body(&reply);
    assert_eq!(json_body["error"]["code"], json!(-32700));
    assert_eq!(json_body["id"], Value::Null);

    stop_server(&t, tasks).await;
}

#[tokio::test]
async fn test_chunked_request_body() {
    let t = test_node(test_settings());
    let port = free_port();
    let tasks = start_server(&t, port).await;

    let body = r#"{"jsonrpc":"1.0","id":3,"method":"getblockcount","params":[]}"#;
    let (first, second) = body.split_at(20);
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!(
        "POST / HTTP/1.1\r\nHost: 127.0.0.1\r\nAuthorization: {}\r\nTransfer-Encoding: chunked\r\n\r\n\
         {:x}\r\n{}\r\n{:x}\r\n{}\r\n0\r\n\r\n",
        basic_auth("admin", "secret"),
        first.len(),
        first,
        second.len(),
        second
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let reply = read_reply(stream).await;
    assert!(reply.starts_with("HTTP/1.1 200 OK"));
    let json_body = reply_body(&reply);
    assert_eq!(json_body["id"], json!(3));
    assert_eq!(json_body["result"], json!(0));

    stop_server(&t, tasks).await;
}

#[tokio::test]
async fn test_notification_gets_empty_reply() {
    let t = test_node(test_settings());
    let port = free_port();
    let tasks = start_server(&t, port).await;

    let body = r#"{"jsonrpc":"1.0","method":"getblockcount","params":[]}"#;
    let reply = post(port, Some(("admin", "secret")), body).await;
    assert!(reply.starts_with("HTTP/1.1 200 OK"));
    assert!(reply.split("\r\n\r\n").nth(1).unwrap().is_empty());

    stop_server(&t, tasks).await;
}

fn mining_settings() -> NodeSettings {
    let mut settings = test_settings();
    settings.mining_addrs = vec![Address::new(NetworkType::Regtest, AddressKind::PubKeyHash, [9u8; 20])];
    settings
}

fn pooled_tx() -> Tx {
    Tx {
        version: 1,
        tx_in: vec![TxIn {
            previous_out_point: OutPoint {
                hash: Hash([7u8; 32]),
                index: 0,
            },
            signature_script: vec![],
            sequence: u32::MAX,
        }],
        tx_out: vec![TxOut {
            value: 5_000,
            pk_script: vec![0x51],
        }],
        lock_time: 0,
    }
}

#[tokio::test]
async fn test_generate_mines_blocks() {
    let t = test_node(mining_settings());
    let h = handler(&t);

    let hashes = call(&h, "generate", json!([2]), true).await.unwrap();
    let hashes = hashes.as_array().unwrap().clone();
    assert_eq!(hashes.len(), 2);
    assert_eq!(call(&h, "getblockcount", json!([]), true).await.unwrap(), json!(2));
    assert_eq!(call(&h, "getbestblockhash", json!([]), true).await.unwrap(), hashes[1]);

    assert_eq!(rpc_code(call(&h, "generate", json!([0]), true).await), ERR_RPC_INTERNAL);

    let bare = test_node(test_settings());
    assert_eq!(rpc_code(call(&handler(&bare), "generate", json!([1]), true).await), ERR_RPC_INTERNAL);

    let mainnet = test_node(NodeSettings::new(NetworkType::Mainnet));
    assert_eq!(rpc_code(call(&handler(&mainnet), "generate", json!([1]), true).await), ERR_RPC_TYPE);
}

#[tokio::test]
async fn test_block_header_and_chain_info() {
    let t = test_node(mining_settings());
    let h = handler(&t);
    call(&h, "generate", json!([1]), true).await.unwrap();

    let genesis = call(&h, "getblockhash", json!([0]), true).await.unwrap();
    let tip = call(&h, "getblockhash", json!([1]), true).await.unwrap();

    let header = call(&h, "getblockheader", json!([tip]), true).await.unwrap();
    assert_eq!(header["height"], json!(1));
    assert_eq!(header["confirmations"], json!(1));
    assert_eq!(header["previousblockhash"], genesis);
    assert!(header.get("nextblockhash").is_none());

    let genesis_header = call(&h, "getblockheader", json!([genesis]), true).await.unwrap();
    assert_eq!(genesis_header["confirmations"], json!(2));
    assert_eq!(genesis_header["nextblockhash"], tip);
    assert!(genesis_header.get("previousblockhash").is_none());

    let raw = call(&h, "getblockheader", json!([tip, false]), true).await.unwrap();
    assert_eq!(raw.as_str().unwrap().len(), 160);

    let unknown = Hash([0xab; 32]).to_string();
    assert_eq!(
        rpc_code(call(&h, "getblockheader", json!([unknown]), true).await),
        ERR_RPC_BLOCK_NOT_FOUND
    );

    let info = call(&h, "getblockchaininfo", json!([]), true).await.unwrap();
    assert_eq!(info["chain"], json!("regtest"));
    assert_eq!(info["blocks"], json!(1));
    assert_eq!(info["bestblockhash"], tip);
    assert_eq!(info["chainwork"].as_str().unwrap().len(), 64);
}

#[tokio::test]
async fn test_get_headers_after_locator() {
    let t = test_node(mining_settings());
    let h = handler(&t);
    call(&h, "generate", json!([2]), true).await.unwrap();

    let genesis = call(&h, "getblockhash", json!([0]), true).await.unwrap();
    let headers = call(&h, "getheaders", json!([[genesis], ""]), true).await.unwrap();
    let headers = headers.as_array().unwrap();
    assert_eq!(headers.len(), 2);
    assert!(headers.iter().all(|h| h.as_str().unwrap().len() == 160));
}

#[tokio::test]
async fn test_network_hash_ps() {
    let t = test_node(mining_settings());
    let h = handler(&t);

    assert_eq!(call(&h, "getnetworkhashps", json!([]), true).await.unwrap(), json!(0));
    call(&h, "generate", json!([3]), true).await.unwrap();
    let rate = call(&h, "getnetworkhashps", json!([-1]), true).await.unwrap();
    assert!(rate.as_i64().unwrap() >= 0);
}

#[tokio::test]
async fn test_raw_transaction_from_mempool() {
    let t = test_node(test_settings());
    let h = handler(&t);
    let tx = pooled_tx();
    let txid = tx.tx_hash().to_string();
    t.mempool.process_transaction(tx.clone(), false, false).unwrap();

    let raw = call(&h, "getrawtransaction", json!([txid]), true).await.unwrap();
    assert_eq!(raw, json!(hex::encode(tx.serialize())));

    let verbose = call(&h, "getrawtransaction", json!([txid, 1]), true).await.unwrap();
    assert_eq!(verbose["txid"], json!(txid));
    assert_eq!(verbose["vin"][0]["txid"], json!(Hash([7u8; 32]).to_string()));
    assert_eq!(verbose["vout"][0]["scriptPubKey"]["type"], json!("nonstandard"));

    let unknown = Hash([0xcd; 32]).to_string();
    assert_eq!(
        rpc_code(call(&h, "getrawtransaction", json!([unknown]), true).await),
        ERR_RPC_NO_TX_INFO
    );
}

#[tokio::test]
async fn test_tx_out_from_mempool_and_chain() {
    let t = test_node(test_settings());
    let h = handler(&t);
    let tx = pooled_tx();
    let txid = tx.tx_hash().to_string();
    t.mempool.process_transaction(tx, false, false).unwrap();

    let out = call(&h, "gettxout", json!([txid, 0]), true).await.unwrap();
    assert_eq!(out["confirmations"], json!(0));
    assert_eq!(out["coinbase"], json!(false));
    assert!((out["value"].as_f64().unwrap() - 0.000_05).abs() < 1e-12);

    assert_eq!(
        rpc_code(call(&h, "gettxout", json!([txid, 5]), true).await),
        ERR_RPC_INVALID_TX_VOUT
    );
    // not in the chain once the mempool is skipped
    assert_eq!(call(&h, "gettxout", json!([txid, 0, false]), true).await.unwrap(), Value::Null);

    let genesis = t.chain.block_by_hash(&t.chain.best_snapshot().hash).unwrap();
    let coinbase = &genesis.transactions[0];
    let out = call(&h, "gettxout", json!([coinbase.tx_hash().to_string(), 0]), true)
        .await
        .unwrap();
    assert_eq!(out["coinbase"], json!(true));
    assert_eq!(out["confirmations"], json!(1));
    assert_eq!(out["bestblock"], json!(genesis.block_hash().to_string()));
}

#[tokio::test]
async fn test_set_generate_toggles_mining() {
    let t = test_node(mining_settings());
    let h = handler(&t);

    call(&h, "setgenerate", json!([true, 3]), true).await.unwrap();
    assert_eq!(call(&h, "getgenerate", json!([]), true).await.unwrap(), json!(true));
    assert!(t.node.is_generating());

    // a zero process limit turns mining off
    call(&h, "setgenerate", json!([true, 0]), true).await.unwrap();
    assert_eq!(call(&h, "getgenerate", json!([]), true).await.unwrap(), json!(false));

    let bare = test_node(test_settings());
    let bare_handler = handler(&bare);
    assert_eq!(rpc_code(call(&bare_handler, "setgenerate", json!([true]), true).await), ERR_RPC_INTERNAL);
    assert_eq!(call(&bare_handler, "setgenerate", json!([false]), true).await.unwrap(), Value::Null);
    assert!(!bare.node.is_generating());
}

type WsClient = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

async fn ws_connect(port: u16, auth: Option<(&str, &str)>) -> WsClient {
    let mut request = format!("ws://127.0.0.1:{}/ws", port).into_client_request().unwrap();
    if let Some((user, pass)) = auth {
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&basic_auth(user, pass)).unwrap(),
        );
    }
    let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    ws
}

async fn ws_send(ws: &mut WsClient, id: u64, method: &str, params: Value) {
    let text = json!({"jsonrpc": "1.0", "id": id, "method": method, "params": params}).to_string();
    ws.send(Message::Text(text.into())).await.unwrap();
}

/// Next text frame as JSON, or `None` once the server closes the socket.
async fn ws_next(ws: &mut WsClient) -> Option<Value> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next()).await.unwrap();
        match msg {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test]
async fn test_websocket_block_notifications() {
    let t = test_node(mining_settings());
    let port = free_port();
    let tasks = start_server(&t, port).await;

    let mut ws = ws_connect(port, None).await;
    ws_send(&mut ws, 1, "authenticate", json!(["admin", "secret"])).await;
    let reply = ws_next(&mut ws).await.unwrap();
    assert_eq!(reply["id"], json!(1));
    assert_eq!(reply["error"], Value::Null);

    ws_send(&mut ws, 2, "session", json!([])).await;
    let reply = ws_next(&mut ws).await.unwrap();
    assert!(reply["result"]["sessionid"].is_u64());

    ws_send(&mut ws, 3, "notifyblocks", json!([])).await;
    assert_eq!(ws_next(&mut ws).await.unwrap()["id"], json!(3));

    ws_send(&mut ws, 4, "generate", json!([1])).await;
    let mut mined = None;
    let mut connected = None;
    while mined.is_none() || connected.is_none() {
        let msg = ws_next(&mut ws).await.unwrap();
        if msg["method"] == json!("blockconnected") {
            connected = Some(msg);
        } else if msg["id"] == json!(4) {
            mined = Some(msg["result"][0].clone());
        }
    }
    let connected = connected.unwrap();
    assert_eq!(connected["params"][0], mined.unwrap());
    assert_eq!(connected["params"][1], json!(1));
    assert!(connected["id"].is_null());

    // header credentials work too, with the limited user's restrictions
    let mut limited = ws_connect(port, Some(("viewer", "look"))).await;
    ws_send(&mut limited, 1, "stop", json!([])).await;
    let reply = ws_next(&mut limited).await.unwrap();
    assert_eq!(reply["error"]["code"], json!(ERR_RPC_INVALID_PARAMS));
    ws_send(&mut limited, 2, "getblockcount", json!([])).await;
    assert_eq!(ws_next(&mut limited).await.unwrap()["result"], json!(1));

    stop_server(&t, tasks).await;
}

#[tokio::test]
async fn test_websocket_requires_authentication_first() {
    let t = test_node(test_settings());
    let port = free_port();
    let tasks = start_server(&t, port).await;

    let mut ws = ws_connect(port, None).await;
    ws_send(&mut ws, 1, "getblockcount", json!([])).await;
    assert!(ws_next(&mut ws).await.is_none());

    let mut ws = ws_connect(port, None).await;
    ws_send(&mut ws, 1, "authenticate", json!(["admin", "wrong"])).await;
    assert!(ws_next(&mut ws).await.is_none());

    stop_server(&t, tasks).await;
}
