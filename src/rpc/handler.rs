//! JSON-RPC command handlers.
//!
//! Commands are registered from a static table when the handler is built;
//! `process` applies the limited-user policy and falls back to the wallet
//! and unimplemented lists for names without a handler.

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::error::{
    chain_err_to_gbt_err_string, HandlerError, RpcError, ERR_RPC_BLOCK_NOT_FOUND,
    ERR_RPC_CLIENT_IN_INITIAL_DOWNLOAD, ERR_RPC_CLIENT_NODE_NOT_ADDED, ERR_RPC_CLIENT_NOT_CONNECTED,
    ERR_RPC_INTERNAL, ERR_RPC_INVALID_TX_VOUT, ERR_RPC_TYPE, ERR_RPC_VERIFY,
};
use super::gbt::{GbtWorkState, NO_PAY_ADDRESS};
use super::help;
use super::types::{
    GetAddedNodeInfoResult, GetAddedNodeInfoResultAddr, GetBestBlockResult,
    GetBlockChainInfoResult, GetBlockHeaderVerboseResult, GetMiningInfoResult, GetNetTotalsResult,
    GetPeerInfoResult, GetTxOutResult, InfoChainResult, Params, Request, ScriptPubKeyResult,
    ScriptSig, TemplateRequest, TxRawResult, ValidateAddressResult, VersionResult, Vin, Vout,
};
use crate::address::Address;
use crate::chain::memory::solve_block;
use crate::chain::{
    block_work, difficulty_from_bits, Block, FilterType, Hash, InvType, InvVect, OutPoint, Tx,
    SATOSHI_PER_COIN,
};
use crate::kopach::HashrateMeter;
use crate::network::addr::{host_of, normalize_address};
use crate::network::message::Message;
use crate::network::{Node, PeerMatch, RelayData};
use crate::network_type::NetworkType;

pub type HandlerResult = Result<Value, HandlerError>;

/// Signature every registered command shares.
pub type HandlerFn =
    for<'a> fn(&'a RpcHandler, Params, &'a CancellationToken) -> BoxFuture<'a, HandlerResult>;

pub struct Command {
    pub name: &'static str,
    pub handler: HandlerFn,
}

pub const JSONRPC_SEMVER_MAJOR: u32 = 1;
pub const JSONRPC_SEMVER_MINOR: u32 = 3;
pub const JSONRPC_SEMVER_PATCH: u32 = 0;

/// Protocol version reported by `getinfo`.
pub const RPC_PROTOCOL_VERSION: i32 = 70002;
/// Minimum relay fee in coins per kilobyte.
pub const DEFAULT_MIN_RELAY_TX_FEE: f64 = 0.000_01;
/// Difficulty retarget interval, two weeks of ten minute blocks.
pub const BLOCKS_PER_RETARGET: i32 = 2016;
const NO_MINING_ADDRS: &str = "No payment addresses specified via miningaddrs";

/// Commands a limited user may call.
pub const RPC_LIMITED: &[&str] = &[
    // websocket commands
    "loadtxfilter",
    "notifyblocks",
    "notifynewtransactions",
    "notifyreceived",
    "notifyspent",
    "rescan",
    "rescanblocks",
    "session",
    "stopnotifyblocks",
    "stopnotifynewtransactions",
    // http and websocket commands
    "help",
    "createrawtransaction",
    "decoderawtransaction",
    "decodescript",
    "estimatefee",
    "getbestblock",
    "getbestblockhash",
    "getblock",
    "getblockcount",
    "getblockhash",
    "getblockheader",
    "getcfilter",
    "getcfilterheader",
    "getcurrentnet",
    "getdifficulty",
    "getheaders",
    "getinfo",
    "getnettotals",
    "getnetworkhashps",
    "getrawmempool",
    "getrawtransaction",
    "gettxout",
    "searchrawtransactions",
    "sendrawtransaction",
    "submitblock",
    "uptime",
    "validateaddress",
    "verifymessage",
    "version",
];

/// Wallet commands, answered with a pointer to the wallet server.
pub const RPC_ASK_WALLET: &[&str] = &[
    "addmultisigaddress",
    "backupwallet",
    "createencryptedwallet",
    "createmultisig",
    "dumpprivkey",
    "dumpwallet",
    "dropwallethistory",
    "encryptwallet",
    "getaccount",
    "getaccountaddress",
    "getaddressesbyaccount",
    "getbalance",
    "getnewaddress",
    "getrawchangeaddress",
    "getreceivedbyaccount",
    "getreceivedbyaddress",
    "gettransaction",
    "gettxoutsetinfo",
    "getunconfirmedbalance",
    "getwalletinfo",
    "importprivkey",
    "importwallet",
    "keypoolrefill",
    "listaccounts",
    "listaddressgroupings",
    "listlockunspent",
    "listreceivedbyaccount",
    "listreceivedbyaddress",
    "listsinceblock",
    "listtransactions",
    "listunspent",
    "lockunspent",
    "move",
    "sendfrom",
    "sendmany",
    "sendtoaddress",
    "setaccount",
    "settxfee",
    "signmessage",
    "signrawtransaction",
    "walletlock",
    "walletpassphrase",
    "walletpassphrasechange",
];

/// Known commands without an implementation.
pub const RPC_UNIMPLEMENTED: &[&str] = &[
    "estimatepriority",
    "getchaintips",
    "getmempoolentry",
    "getnetworkinfo",
    "getwork",
    "invalidateblock",
    "preciousblock",
    "reconsiderblock",
];

/// Every command this server answers.
pub const RPC_HANDLERS: &[Command] = &[
    Command { name: "addnode", handler: |h, p, _| h.add_node(p).boxed() },
    Command { name: "estimatefee", handler: |h, p, _| h.estimate_fee(p).boxed() },
    Command { name: "getaddednodeinfo", handler: |h, p, _| h.get_added_node_info(p).boxed() },
    Command { name: "getbestblock", handler: |h, p, _| h.get_best_block(p).boxed() },
    Command { name: "getbestblockhash", handler: |h, p, _| h.get_best_block_hash(p).boxed() },
    Command { name: "getblock", handler: |h, p, _| h.get_block(p).boxed() },
    Command { name: "getblockchaininfo", handler: |h, p, _| h.get_blockchain_info(p).boxed() },
    Command { name: "getblockcount", handler: |h, p, _| h.get_block_count(p).boxed() },
    Command { name: "getblockhash", handler: |h, p, _| h.get_block_hash(p).boxed() },
    Command { name: "getblockheader", handler: |h, p, _| h.get_block_header(p).boxed() },
    Command { name: "getblocktemplate", handler: |h, p, c| h.get_block_template(p, c).boxed() },
    Command { name: "getcfilter", handler: |h, p, _| h.get_cfilter(p).boxed() },
    Command { name: "getcfilterheader", handler: |h, p, _| h.get_cfilter_header(p).boxed() },
    Command { name: "getconnectioncount", handler: |h, p, _| h.get_connection_count(p).boxed() },
    Command { name: "getcurrentnet", handler: |h, p, _| h.get_current_net(p).boxed() },
    Command { name: "getdifficulty", handler: |h, p, _| h.get_difficulty(p).boxed() },
    Command { name: "generate", handler: |h, p, c| h.generate(p, c).boxed() },
    Command { name: "getgenerate", handler: |h, p, _| h.get_generate(p).boxed() },
    Command { name: "gethashespersec", handler: |h, p, _| h.get_hashes_per_sec(p).boxed() },
    Command { name: "getheaders", handler: |h, p, _| h.get_headers(p).boxed() },
    Command { name: "getinfo", handler: |h, p, _| h.get_info(p).boxed() },
    Command { name: "getmempoolinfo", handler: |h, p, _| h.get_mempool_info(p).boxed() },
    Command { name: "getmininginfo", handler: |h, p, _| h.get_mining_info(p).boxed() },
    Command { name: "getnettotals", handler: |h, p, _| h.get_net_totals(p).boxed() },
    Command { name: "getnetworkhashps", handler: |h, p, _| h.get_network_hash_ps(p).boxed() },
    Command { name: "getpeerinfo", handler: |h, p, _| h.get_peer_info(p).boxed() },
    Command { name: "getrawmempool", handler: |h, p, _| h.get_raw_mempool(p).boxed() },
    Command { name: "getrawtransaction", handler: |h, p, _| h.get_raw_transaction(p).boxed() },
    Command { name: "gettxout", handler: |h, p, _| h.get_tx_out(p).boxed() },
    Command { name: "help", handler: |h, p, _| h.help(p).boxed() },
    Command { name: "node", handler: |h, p, _| h.node_command(p).boxed() },
    Command { name: "ping", handler: |h, p, _| h.ping(p).boxed() },
    Command { name: "sendrawtransaction", handler: |h, p, _| h.send_raw_transaction(p).boxed() },
    Command { name: "setgenerate", handler: |h, p, _| h.set_generate(p).boxed() },
    Command { name: "stop", handler: |h, p, _| h.stop(p).boxed() },
    Command { name: "submitblock", handler: |h, p, _| h.submit_block(p).boxed() },
    Command { name: "uptime", handler: |h, p, _| h.uptime(p).boxed() },
    Command { name: "validateaddress", handler: |h, p, _| h.validate_address(p).boxed() },
    Command { name: "version", handler: |h, p, _| h.version(p).boxed() },
];

fn app_version() -> i32 {
    let part = |s: &str| s.parse::<i32>().unwrap_or(0);
    1_000_000 * part(env!("CARGO_PKG_VERSION_MAJOR"))
        + 10_000 * part(env!("CARGO_PKG_VERSION_MINOR"))
        + 100 * part(env!("CARGO_PKG_VERSION_PATCH"))
}

/// Hex strings may omit the leading zero of the first byte.
fn pad_hex(s: &str) -> String {
    if s.len() % 2 != 0 {
        format!("0{}", s)
    } else {
        s.to_string()
    }
}

fn parse_hash(s: &str) -> Result<Hash, RpcError> {
    s.parse::<Hash>().map_err(|_| RpcError::decode_hex(s))
}

/// Satoshi to coins.
pub fn coins(satoshi: i64) -> f64 {
    satoshi as f64 / SATOSHI_PER_COIN as f64
}

fn script_pub_key(script: &[u8], network: NetworkType) -> ScriptPubKeyResult {
    match Address::from_script(script, network) {
        Some(addr) => ScriptPubKeyResult {
            hex: hex::encode(script),
            req_sigs: Some(1),
            script_type: addr.kind().script_class().to_string(),
            addresses: vec![addr.encode()],
        },
        None => ScriptPubKeyResult {
            hex: hex::encode(script),
            req_sigs: None,
            script_type: "nonstandard".to_string(),
            addresses: Vec::new(),
        },
    }
}

/// Verbose transaction rendering shared by `getrawtransaction` and the
/// websocket transaction notifications.
pub fn tx_raw_result(tx: &Tx, network: NetworkType) -> TxRawResult {
    let bytes = tx.serialize();
    let txid = tx.tx_hash().to_string();
    let vin = tx
        .tx_in
        .iter()
        .map(|input| {
            if tx.is_coinbase() {
                Vin {
                    coinbase: Some(hex::encode(&input.signature_script)),
                    txid: None,
                    vout: None,
                    script_sig: None,
                    sequence: input.sequence,
                }
            } else {
                Vin {
                    coinbase: None,
                    txid: Some(input.previous_out_point.hash.to_string()),
                    vout: Some(input.previous_out_point.index),
                    script_sig: Some(ScriptSig {
                        hex: hex::encode(&input.signature_script),
                    }),
                    sequence: input.sequence,
                }
            }
        })
        .collect();
    let vout = tx
        .tx_out
        .iter()
        .enumerate()
        .map(|(n, out)| Vout {
            value: coins(out.value),
            n: n as u32,
            script_pub_key: script_pub_key(&out.pk_script, network),
        })
        .collect();
    TxRawResult {
        hex: hex::encode(&bytes),
        hash: txid.clone(),
        txid,
        size: bytes.len(),
        vsize: bytes.len(),
        weight: bytes.len() * 4,
        version: tx.version,
        lock_time: tx.lock_time,
        vin,
        vout,
        block_hash: String::new(),
        confirmations: None,
        time: None,
    }
}

fn direction_string(inbound: bool) -> &'static str {
    if inbound {
        "inbound"
    } else {
        "outbound"
    }
}

pub struct RpcHandler {
    node: Arc<Node>,
    gbt: Arc<GbtWorkState>,
    hashrate: Arc<HashrateMeter>,
    gen_threads: AtomicUsize,
    commands: HashMap<&'static str, HandlerFn>,
}

impl RpcHandler {
    pub fn new(
        node: Arc<Node>,
        gbt: Arc<GbtWorkState>,
        hashrate: Arc<HashrateMeter>,
        gen_threads: usize,
        table: &[Command],
    ) -> Self {
        let commands = table.iter().map(|c| (c.name, c.handler)).collect();
        Self {
            node,
            gbt,
            hashrate,
            gen_threads: AtomicUsize::new(gen_threads),
            commands,
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn gbt(&self) -> &Arc<GbtWorkState> {
        &self.gbt
    }

    fn network(&self) -> NetworkType {
        self.node.settings.network
    }

    /// Runs one request on behalf of a client. `close` fires when the
    /// client disconnects.
    pub async fn process(&self, request: &Request, is_admin: bool, close: &CancellationToken) -> HandlerResult {
        let method = request.method.as_str();
        if !is_admin && !RPC_LIMITED.contains(&method) {
            return Err(RpcError::limited_user().into());
        }
        if let Some(handler) = self.commands.get(method) {
            let params = Params::from_value(request.params.clone());
            return handler(self, params, close).await;
        }
        if RPC_ASK_WALLET.contains(&method) {
            return Err(RpcError::no_wallet().into());
        }
        if RPC_UNIMPLEMENTED.contains(&method) {
            return Err(RpcError::unimplemented().into());
        }
        Err(RpcError::method_not_found().into())
    }

    async fn add_node(&self, params: Params) -> HandlerResult {
        let addr: String = params.req(0, "addr")?;
        let sub_cmd: String = params.req(1, "subcmd")?;
        let addr = normalize_address(&addr, self.network().default_p2p_port());
        let result = match sub_cmd.as_str() {
            "add" => self.node.connect_node(&addr, true).await,
            "remove" => self.node.remove_node(PeerMatch::Addr(addr)).await,
            "onetry" => self.node.connect_node(&addr, false).await,
            _ => return Err(RpcError::invalid_parameter("invalid subcommand for addnode").into()),
        };
        result.map_err(|e| RpcError::invalid_parameter(e.to_string()))?;
        Ok(Value::Null)
    }

    /// Whether a connected peer matches the address or ID.
    async fn peer_exists(&self, addr: &str, id: Option<i32>) -> bool {
        self.node
            .peers()
            .await
            .iter()
            .any(|sp| Some(sp.id()) == id || sp.peer.addr() == addr)
    }

    fn parse_target(&self, target: &str) -> Result<PeerMatch, RpcError> {
        if let Ok(id) = target.parse::<u32>() {
            return Ok(PeerMatch::Id(id as i32));
        }
        if host_of(target).is_some() || target.parse::<IpAddr>().is_ok() {
            let addr = normalize_address(target, self.network().default_p2p_port());
            return Ok(PeerMatch::Addr(addr));
        }
        Err(RpcError::invalid_parameter("invalid address or node ID"))
    }

    async fn node_command(&self, params: Params) -> HandlerResult {
        let sub_cmd: String = params.req(0, "subcmd")?;
        let target: String = params.req(1, "target")?;
        let connect_sub_cmd: Option<String> = params.opt(2, "connectsubcmd")?;

        let result = match sub_cmd.as_str() {
            "disconnect" | "remove" => {
                let peer = self.parse_target(&target)?;
                let result = if sub_cmd == "disconnect" {
                    self.node.disconnect_node(peer.clone()).await
                } else {
                    self.node.remove_node(peer.clone()).await
                };
                if result.is_err() {
                    let (addr, id) = match &peer {
                        PeerMatch::Id(id) => ("", Some(*id)),
                        PeerMatch::Addr(addr) => (addr.as_str(), None),
                    };
                    if self.peer_exists(addr, id).await {
                        let message = if sub_cmd == "disconnect" {
                            "can't disconnect a permanent peer, use remove"
                        } else {
                            "can't remove a temporary peer, use disconnect"
                        };
                        return Err(RpcError::misc(message).into());
                    }
                }
                result
            }
            "connect" => {
                let addr = normalize_address(&target, self.network().default_p2p_port());
                match connect_sub_cmd.as_deref().unwrap_or("temp") {
                    sub @ ("perm" | "temp") => self.node.connect_node(&addr, sub == "perm").await,
                    _ => {
                        return Err(RpcError::invalid_parameter("invalid subcommand for node connect").into())
                    }
                }
            }
            _ => return Err(RpcError::invalid_parameter("invalid subcommand for node").into()),
        };
        result.map_err(|e| RpcError::invalid_parameter(e.to_string()))?;
        Ok(Value::Null)
    }

    async fn get_added_node_info(&self, params: Params) -> HandlerResult {
        let dns: bool = params.req(0, "dns")?;
        let wanted: Option<String> = params.opt(1, "node")?;

        let mut peers = self.node.added_nodes().await;
        if let Some(wanted) = &wanted {
            peers.retain(|sp| sp.peer.addr() == *wanted);
            if peers.is_empty() {
                return Err(RpcError::new(ERR_RPC_CLIENT_NODE_NOT_ADDED, "Node has not been added").into());
            }
        }

        if !dns {
            let addrs: Vec<String> = peers.iter().map(|sp| sp.peer.addr()).collect();
            return Ok(json!(addrs));
        }

        let mut results = Vec::with_capacity(peers.len());
        for sp in &peers {
            let peer_addr = sp.peer.addr();
            let connected = sp.peer.connected();
            let host = host_of(&peer_addr).unwrap_or(peer_addr.as_str()).to_string();

            let ips = if host.parse::<IpAddr>().is_ok() || host.ends_with(".onion") {
                vec![host.clone()]
            } else {
                match tokio::net::lookup_host((host.as_str(), 0)).await {
                    Ok(found) => found.map(|a| a.ip().to_string()).collect(),
                    Err(e) => {
                        tracing::warn!("failed to resolve {}: {}", host, e);
                        vec![host.clone()]
                    }
                }
            };

            let addresses = ips
                .into_iter()
                .map(|ip| {
                    let state = if ip == host && connected {
                        direction_string(sp.peer.inbound())
                    } else {
                        "false"
                    };
                    GetAddedNodeInfoResultAddr {
                        address: ip,
                        connected: state.to_string(),
                    }
                })
                .collect();
            results.push(GetAddedNodeInfoResult {
                added_node: peer_addr,
                connected,
                addresses,
            });
        }
        Ok(json!(results))
    }

    async fn estimate_fee(&self, params: Params) -> HandlerResult {
        let num_blocks: i64 = params.req(0, "numblocks")?;
        let Some(estimator) = &self.node.fee_estimator else {
            return Err(RpcError::internal("Fee estimation disabled", "").into());
        };
        if num_blocks <= 0 {
            return Err(RpcError::internal("Parameter NumBlocks must be positive", "").into());
        }
        let fee = estimator
            .estimate_fee(num_blocks as u32)
            .map_err(|e| RpcError::internal(e, "Failed to estimate fee"))?;
        Ok(json!(fee))
    }

    async fn get_best_block(&self, _params: Params) -> HandlerResult {
        let best = self.node.chain.best_snapshot();
        Ok(json!(GetBestBlockResult {
            hash: best.hash.to_string(),
            height: best.height,
        }))
    }

    async fn get_best_block_hash(&self, _params: Params) -> HandlerResult {
        Ok(json!(self.node.chain.best_snapshot().hash.to_string()))
    }

    async fn get_block(&self, params: Params) -> HandlerResult {
        let hash: String = params.req(0, "hash")?;
        let verbose: bool = params.opt(1, "verbose")?.unwrap_or(true);
        let hash = parse_hash(&hash)?;

        let block = self
            .node
            .chain
            .block_by_hash(&hash)
            .map_err(|_| RpcError::block_not_found())?;
        if !verbose {
            return Ok(json!(hex::encode(block.serialize())));
        }

        let best = self.node.chain.best_snapshot();
        let height = self
            .node
            .chain
            .height_by_hash(&hash)
            .map_err(|e| RpcError::internal(e, "Failed to obtain block height"))?;
        let header = &block.header;
        let txids: Vec<String> = block.transactions.iter().map(|tx| tx.tx_hash().to_string()).collect();
        let mut reply = json!({
            "hash": hash.to_string(),
            "confirmations": i64::from(best.height) - i64::from(height) + 1,
            "size": block.serialize().len(),
            "height": height,
            "version": header.version,
            "merkleroot": header.merkle_root.to_string(),
            "tx": txids,
            "time": header.timestamp,
            "nonce": header.nonce,
            "bits": format!("{:x}", header.bits),
            "difficulty": difficulty_from_bits(header.bits),
            "previousblockhash": header.prev_block.to_string(),
        });
        if height < best.height {
            if let Ok(next) = self.node.chain.block_hash_by_height(height + 1) {
                reply["nextblockhash"] = json!(next.to_string());
            }
        }
        Ok(reply)
    }

    async fn get_blockchain_info(&self, _params: Params) -> HandlerResult {
        let best = self.node.chain.best_snapshot();
        let mut work = 0f64;
        for height in 0..=best.height {
            let hash = self
                .node
                .chain
                .block_hash_by_height(height)
                .map_err(|e| RpcError::internal(e, "Failed to fetch block hash"))?;
            let header = self
                .node
                .chain
                .header_by_hash(&hash)
                .map_err(|e| RpcError::internal(e, "Failed to fetch block header"))?;
            work += block_work(header.bits);
        }
        Ok(json!(GetBlockChainInfoResult {
            chain: self.network().name().to_string(),
            blocks: best.height,
            headers: best.height,
            best_block_hash: best.hash.to_string(),
            difficulty: difficulty_from_bits(best.bits),
            median_time: best.median_time,
            pruned: false,
            chain_work: format!("{:064x}", work as u128),
        }))
    }

    async fn get_block_header(&self, params: Params) -> HandlerResult {
        let hash: String = params.req(0, "hash")?;
        let verbose: bool = params.opt(1, "verbose")?.unwrap_or(true);
        let hash = parse_hash(&hash)?;

        let header = self
            .node
            .chain
            .header_by_hash(&hash)
            .map_err(|_| RpcError::block_not_found())?;
        if !verbose {
            return Ok(json!(hex::encode(header.serialize())));
        }

        let height = self
            .node
            .chain
            .height_by_hash(&hash)
            .map_err(|e| RpcError::internal(e, "Failed to obtain block height"))?;
        let best = self.node.chain.best_snapshot();
        let next_hash = if height < best.height {
            self.node
                .chain
                .block_hash_by_height(height + 1)
                .map(|h| h.to_string())
                .map_err(|e| RpcError::internal(e, "No next block"))?
        } else {
            String::new()
        };
        let previous_hash = if header.prev_block.is_zero() {
            String::new()
        } else {
            header.prev_block.to_string()
        };
        Ok(json!(GetBlockHeaderVerboseResult {
            hash: hash.to_string(),
            confirmations: i64::from(best.height) - i64::from(height) + 1,
            height,
            version: header.version,
            version_hex: format!("{:08x}", header.version),
            merkle_root: header.merkle_root.to_string(),
            time: header.timestamp,
            nonce: u64::from(header.nonce),
            bits: format!("{:x}", header.bits),
            difficulty: difficulty_from_bits(header.bits),
            previous_hash,
            next_hash,
        }))
    }

    async fn get_headers(&self, params: Params) -> HandlerResult {
        let locators: Vec<String> = params.req(0, "blocklocators")?;
        let hash_stop: Option<String> = params.opt(1, "hashstop")?;
        let locators = locators
            .iter()
            .map(|l| parse_hash(l))
            .collect::<Result<Vec<Hash>, RpcError>>()?;
        let hash_stop = match hash_stop.as_deref() {
            None | Some("") => Hash::ZERO,
            Some(stop) => parse_hash(stop)?,
        };
        let headers: Vec<String> = self
            .node
            .chain
            .locate_headers(&locators, &hash_stop)
            .iter()
            .map(|h| hex::encode(h.serialize()))
            .collect();
        Ok(json!(headers))
    }

    /// Estimated network hash rate over the `blocks` blocks ending at
    /// `height`. A non-positive count means since the last retarget.
    async fn get_network_hash_ps(&self, params: Params) -> HandlerResult {
        let blocks: i64 = params.opt(0, "blocks")?.unwrap_or(120);
        let height: i64 = params.opt(1, "height")?.unwrap_or(-1);

        let best = self.node.chain.best_snapshot();
        let end_height = if height < 0 || height > i64::from(best.height) {
            i64::from(best.height)
        } else {
            height
        };
        let blocks = if blocks <= 0 {
            end_height % i64::from(BLOCKS_PER_RETARGET) + 1
        } else {
            blocks
        };
        let start_height = (end_height - blocks).max(0);

        let mut min_time = i64::MAX;
        let mut max_time = i64::MIN;
        let mut total_work = 0f64;
        for h in start_height..=end_height {
            let hash = self
                .node
                .chain
                .block_hash_by_height(h as i32)
                .map_err(|e| RpcError::internal(e, "Failed to fetch block hash"))?;
            let header = self
                .node
                .chain
                .header_by_hash(&hash)
                .map_err(|e| RpcError::internal(e, "Failed to fetch block header"))?;
            // the first block only anchors the time span
            if h > start_height {
                total_work += block_work(header.bits);
            }
            min_time = min_time.min(header.timestamp);
            max_time = max_time.max(header.timestamp);
        }
        if max_time <= min_time {
            return Ok(json!(0));
        }
        Ok(json!((total_work / (max_time - min_time) as f64) as i64))
    }

    async fn get_raw_transaction(&self, params: Params) -> HandlerResult {
        let txid: String = params.req(0, "txid")?;
        let verbose: i64 = params.opt(1, "verbose")?.unwrap_or(0);
        let hash = parse_hash(&txid)?;

        let Some(tx) = self.node.mempool.fetch_transaction(&hash) else {
            return Err(RpcError::no_tx_info().into());
        };
        if verbose == 0 {
            return Ok(json!(hex::encode(tx.serialize())));
        }
        Ok(json!(tx_raw_result(&tx, self.network())))
    }

    async fn get_tx_out(&self, params: Params) -> HandlerResult {
        let txid: String = params.req(0, "txid")?;
        let vout: u32 = params.req(1, "vout")?;
        let include_mempool: bool = params.opt(2, "includemempool")?.unwrap_or(true);
        let hash = parse_hash(&txid)?;
        let best = self.node.chain.best_snapshot();

        let pooled = if include_mempool {
            self.node.mempool.fetch_transaction(&hash)
        } else {
            None
        };
        let (confirmations, value, pk_script, coinbase) = match pooled {
            Some(tx) => {
                let Some(out) = tx.tx_out.get(vout as usize) else {
                    return Err(RpcError::new(
                        ERR_RPC_INVALID_TX_VOUT,
                        "Output index number (vout) does not exist for transaction.",
                    )
                    .into());
                };
                (0, out.value, out.pk_script.clone(), false)
            }
            None => {
                let outpoint = OutPoint { hash, index: vout };
                let entry = self
                    .node
                    .chain
                    .fetch_utxo_entry(&outpoint)
                    .map_err(|_| RpcError::no_tx_info())?;
                let Some(entry) = entry else {
                    return Ok(Value::Null);
                };
                (
                    i64::from(best.height) - i64::from(entry.block_height) + 1,
                    entry.amount,
                    entry.pk_script,
                    entry.is_coinbase,
                )
            }
        };
        Ok(json!(GetTxOutResult {
            best_block: best.hash.to_string(),
            confirmations,
            value: coins(value),
            script_pub_key: script_pub_key(&pk_script, self.network()),
            coinbase,
        }))
    }

    /// Mines `numblocks` blocks on the CPU. Only offered on the test
    /// networks, where the difficulty makes that feasible.
    async fn generate(&self, params: Params, close: &CancellationToken) -> HandlerResult {
        let num_blocks: u32 = params.req(0, "numblocks")?;
        if !self.network().is_test_harness() {
            return Err(RpcError::new(
                ERR_RPC_TYPE,
                format!(
                    "No support for `generate` on the current network, {}, as it's unlikely to be possible to mine a block with the CPU.",
                    self.network().name()
                ),
            )
            .into());
        }
        if num_blocks == 0 {
            return Err(RpcError::new(
                ERR_RPC_INTERNAL,
                "Please request a nonzero number of blocks to generate.",
            )
            .into());
        }
        let addrs = &self.node.settings.mining_addrs;
        if addrs.is_empty() {
            return Err(RpcError::new(ERR_RPC_INTERNAL, NO_MINING_ADDRS).into());
        }

        let mut hashes = Vec::with_capacity(num_blocks as usize);
        for _ in 0..num_blocks {
            if close.is_cancelled() {
                return Err(HandlerError::ClientQuit);
            }
            let pay_to = &addrs[rand::random::<usize>() % addrs.len()];
            let mut template = self
                .node
                .template_generator
                .new_block_template(Some(pay_to))
                .map_err(|e| RpcError::internal(e, "Failed to create new block template"))?;
            let mut block = template.block;
            let solved = tokio::task::spawn_blocking(move || solve_block(&mut block).then_some(block))
                .await
                .map_err(|e| RpcError::internal(e, "Block solver failed"))?;
            let Some(block) = solved else {
                return Err(RpcError::internal("nonce space exhausted", "Failed to solve block").into());
            };
            template.block = block;
            let hash = template.block.block_hash();
            self.node
                .sync_manager
                .submit_block(template.block)
                .map_err(|e| RpcError::internal(e, "Failed to process generated block"))?;
            tracing::info!("generated block {} at height {}", hash, template.height);
            hashes.push(hash.to_string());
        }
        Ok(json!(hashes))
    }

    async fn set_generate(&self, params: Params) -> HandlerResult {
        let generate: bool = params.req(0, "generate")?;
        let proc_limit: i64 = params.opt(1, "genproclimit")?.unwrap_or(-1);

        let generate = generate && proc_limit != 0;
        if !generate {
            self.node.set_generate(false);
            return Ok(Value::Null);
        }
        if self.node.settings.mining_addrs.is_empty() {
            return Err(RpcError::new(ERR_RPC_INTERNAL, NO_MINING_ADDRS).into());
        }
        if proc_limit > 0 {
            self.gen_threads.store(proc_limit as usize, Ordering::SeqCst);
        }
        self.node.set_generate(true);
        Ok(Value::Null)
    }

    async fn get_block_count(&self, _params: Params) -> HandlerResult {
        Ok(json!(self.node.chain.best_snapshot().height))
    }

    async fn get_block_hash(&self, params: Params) -> HandlerResult {
        let index: i64 = params.req(0, "index")?;
        let height = i32::try_from(index).map_err(|_| RpcError::out_of_range("Block number out of range"))?;
        let hash = self
            .node
            .chain
            .block_hash_by_height(height)
            .map_err(|_| RpcError::out_of_range("Block number out of range"))?;
        Ok(json!(hash.to_string()))
    }

    async fn get_block_template(&self, params: Params, close: &CancellationToken) -> HandlerResult {
        let request: TemplateRequest = params.opt(0, "request")?.unwrap_or_default();
        match request.mode.as_str() {
            "" | "template" => self.handle_gbt_request(&request, close).await,
            "proposal" => Ok(self.handle_gbt_proposal(&request)?),
            _ => Err(RpcError::invalid_parameter("Invalid mode").into()),
        }
    }

    async fn handle_gbt_request(&self, request: &TemplateRequest, close: &CancellationToken) -> HandlerResult {
        let has_cap = |name: &str| request.capabilities.iter().any(|c| c == name);
        let use_coinbase_value = !(has_cap("coinbasetxn") && !has_cap("coinbasevalue"));
        if !use_coinbase_value && self.node.settings.mining_addrs.is_empty() {
            return Err(RpcError::new(ERR_RPC_INTERNAL, NO_PAY_ADDRESS).into());
        }

        if !self.network().is_test_harness() && self.node.connected_count().await == 0 {
            return Err(RpcError::new(ERR_RPC_CLIENT_NOT_CONNECTED, "Pod is not connected to network").into());
        }

        let best = self.node.chain.best_snapshot();
        if best.height != 0 && !self.node.sync_manager.is_current() {
            return Err(RpcError::new(
                ERR_RPC_CLIENT_IN_INITIAL_DOWNLOAD,
                "Pod is not yet synchronised...",
            )
            .into());
        }

        let result = if request.long_poll_id.is_empty() {
            self.gbt.current_template(&self.node, use_coinbase_value)?
        } else {
            self.gbt
                .long_poll(&self.node, &request.long_poll_id, use_coinbase_value, close)
                .await?
        };
        Ok(json!(result))
    }

    fn handle_gbt_proposal(&self, request: &TemplateRequest) -> Result<Value, RpcError> {
        if request.data.is_empty() {
            return Err(RpcError::new(
                ERR_RPC_TYPE,
                "Data must contain the hex-encoded serialized block that is being proposed",
            ));
        }
        let bytes = hex::decode(pad_hex(&request.data)).map_err(|_| {
            RpcError::deserialization(format!(
                "data must be hexadecimal string (not {:?})",
                request.data
            ))
        })?;
        let block = Block::deserialize(&bytes)
            .map_err(|e| RpcError::deserialization(format!("block decode failed: {}", e)))?;

        let best = self.node.chain.best_snapshot();
        if block.header.prev_block != best.hash {
            return Ok(json!("bad-prevblk"));
        }

        match self.node.chain.check_connect_block_template(&block) {
            Ok(()) => Ok(Value::Null),
            Err(e) if e.as_rule().is_none() => Err(RpcError::new(
                ERR_RPC_VERIFY,
                format!("failed to process block proposal: {}", e),
            )),
            Err(e) => {
                tracing::info!("Rejected block proposal: {}", e);
                Ok(json!(chain_err_to_gbt_err_string(&e)))
            }
        }
    }

    fn filter_request(&self, params: &Params) -> Result<(Hash, FilterType), RpcError> {
        let hash: String = params.req(0, "hash")?;
        let filter_type: u8 = params.req(1, "filtertype")?;
        let hash = parse_hash(&hash)?;
        let filter_type = FilterType::from_u8(filter_type)
            .ok_or_else(|| RpcError::invalid_parameter(format!("unknown filter type {}", filter_type)))?;
        Ok((hash, filter_type))
    }

    async fn get_cfilter(&self, params: Params) -> HandlerResult {
        let Some(cf_index) = &self.node.cf_index else {
            return Err(RpcError::no_cf_index().into());
        };
        let (hash, filter_type) = self.filter_request(&params)?;
        match cf_index.filter_by_block_hash(&hash, filter_type) {
            Ok(Some(filter)) => {
                tracing::debug!("Found committed filter for {}", hash);
                Ok(json!(hex::encode(filter)))
            }
            _ => {
                tracing::debug!("Could not find committed filter for {}", hash);
                Err(RpcError::new(ERR_RPC_BLOCK_NOT_FOUND, "block not found").into())
            }
        }
    }

    async fn get_cfilter_header(&self, params: Params) -> HandlerResult {
        let Some(cf_index) = &self.node.cf_index else {
            return Err(RpcError::no_cf_index().into());
        };
        let (hash, filter_type) = self.filter_request(&params)?;
        match cf_index.filter_header_by_block_hash(&hash, filter_type) {
            Ok(Some(header)) => {
                tracing::debug!("Found header of committed filter for {}", hash);
                Ok(json!(header.to_string()))
            }
            _ => {
                tracing::debug!("Could not find header of committed filter for {}", hash);
                Err(RpcError::block_not_found().into())
            }
        }
    }

    async fn get_connection_count(&self, _params: Params) -> HandlerResult {
        Ok(json!(self.node.connected_count().await))
    }

    async fn get_current_net(&self, _params: Params) -> HandlerResult {
        Ok(json!(u32::from_be_bytes(self.network().magic_bytes())))
    }

    async fn get_difficulty(&self, _params: Params) -> HandlerResult {
        Ok(json!(difficulty_from_bits(self.node.chain.best_snapshot().bits)))
    }

    async fn get_generate(&self, _params: Params) -> HandlerResult {
        Ok(json!(self.node.is_generating()))
    }

    async fn get_hashes_per_sec(&self, _params: Params) -> HandlerResult {
        Ok(json!(self.hashrate.hashes_per_sec()))
    }

    async fn get_info(&self, _params: Params) -> HandlerResult {
        let best = self.node.chain.best_snapshot();
        Ok(json!(InfoChainResult {
            version: app_version(),
            protocol_version: RPC_PROTOCOL_VERSION,
            blocks: best.height,
            time_offset: self.node.time_source.offset_seconds(),
            connections: self.node.connected_count().await,
            proxy: String::new(),
            difficulty: difficulty_from_bits(best.bits),
            testnet: self.network() == NetworkType::Testnet,
            relay_fee: DEFAULT_MIN_RELAY_TX_FEE,
            errors: String::new(),
        }))
    }

    async fn get_mempool_info(&self, _params: Params) -> HandlerResult {
        let descs = self.node.mempool.tx_descs();
        let bytes: usize = descs.iter().map(|d| d.tx.serialize_size()).sum();
        Ok(json!({
            "size": descs.len(),
            "bytes": bytes,
        }))
    }

    async fn get_mining_info(&self, _params: Params) -> HandlerResult {
        let best = self.node.chain.best_snapshot();
        Ok(json!(GetMiningInfoResult {
            blocks: i64::from(best.height),
            current_block_size: best.block_size,
            current_block_weight: best.block_weight,
            current_block_tx: best.num_txns,
            difficulty: difficulty_from_bits(best.bits),
            errors: String::new(),
            generate: self.node.is_generating(),
            gen_threads: self.gen_threads.load(Ordering::SeqCst),
            hashes_per_sec: self.hashrate.hashes_per_sec(),
            pooled_tx: self.node.mempool.count() as u64,
            testnet: self.network() == NetworkType::Testnet,
        }))
    }

    async fn get_net_totals(&self, _params: Params) -> HandlerResult {
        let (recv, sent) = self.node.net_totals();
        Ok(json!(GetNetTotalsResult {
            total_bytes_recv: recv,
            total_bytes_sent: sent,
            time_millis: chrono::Utc::now().timestamp_millis(),
        }))
    }

    async fn get_peer_info(&self, _params: Params) -> HandlerResult {
        let peers = self.node.peers().await;
        let infos: Vec<GetPeerInfoResult> = peers
            .iter()
            .map(|sp| {
                let stats = sp.peer.stats();
                GetPeerInfoResult {
                    id: stats.id,
                    addr: stats.addr,
                    addr_local: sp.peer.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                    services: format!("{:08}", stats.services),
                    relay_txes: !sp.relay_tx_disabled(),
                    last_send: stats.last_send,
                    last_recv: stats.last_recv,
                    bytes_sent: stats.bytes_sent,
                    bytes_recv: stats.bytes_recv,
                    conn_time: stats.conn_time,
                    time_offset: stats.time_offset,
                    ping_time: stats.last_ping_micros as f64,
                    version: stats.version,
                    sub_ver: stats.user_agent,
                    inbound: stats.inbound,
                    starting_height: stats.starting_height,
                    current_height: stats.last_block,
                    ban_score: sp.ban_score() as i32,
                    fee_filter: sp.fee_filter(),
                }
            })
            .collect();
        Ok(json!(infos))
    }

    async fn get_raw_mempool(&self, params: Params) -> HandlerResult {
        let verbose: bool = params.opt(0, "verbose")?.unwrap_or(false);
        if !verbose {
            let hashes: Vec<String> = self
                .node
                .mempool
                .tx_hashes()
                .iter()
                .map(Hash::to_string)
                .collect();
            return Ok(json!(hashes));
        }

        let descs = self.node.mempool.tx_descs();
        let pooled: std::collections::HashSet<Hash> = descs.iter().map(|d| d.tx.tx_hash()).collect();
        let mut reply = serde_json::Map::with_capacity(descs.len());
        for desc in &descs {
            let mut depends: Vec<String> = desc
                .tx
                .tx_in
                .iter()
                .map(|input| input.previous_out_point.hash)
                .filter(|h| pooled.contains(h))
                .map(|h| h.to_string())
                .collect();
            depends.sort();
            depends.dedup();
            reply.insert(
                desc.tx.tx_hash().to_string(),
                json!({
                    "size": desc.tx.serialize_size(),
                    "fee": coins(desc.fee),
                    "time": desc.added,
                    "height": desc.height,
                    "startingpriority": desc.starting_priority,
                    "depends": depends,
                }),
            );
        }
        Ok(Value::Object(reply))
    }

    async fn help(&self, params: Params) -> HandlerResult {
        let command: Option<String> = params.opt(0, "command")?;
        match command.as_deref() {
            None | Some("") => Ok(json!(help::usage())),
            Some(method) => {
                if !self.commands.contains_key(method) {
                    return Err(RpcError::invalid_parameter(format!("Unknown command: {}", method)).into());
                }
                Ok(json!(help::method_help(method)?))
            }
        }
    }

    async fn ping(&self, _params: Params) -> HandlerResult {
        let nonce: u64 = rand::random();
        self.node.broadcast_message(Message::Ping(nonce), Vec::new()).await;
        Ok(Value::Null)
    }

    async fn send_raw_transaction(&self, params: Params) -> HandlerResult {
        let hex_tx: String = params.req(0, "hextx")?;
        let bytes = hex::decode(pad_hex(&hex_tx)).map_err(|_| RpcError::decode_hex(&hex_tx))?;
        let tx = Tx::deserialize(&bytes)
            .map_err(|e| RpcError::deserialization(format!("TX decode failed: {}", e)))?;
        let tx_hash = tx.tx_hash();

        let accepted = self
            .node
            .mempool
            .process_transaction(tx.clone(), false, false)
            .map_err(|e| {
                tracing::debug!("Rejected transaction {}: {}", tx_hash, e);
                RpcError::deserialization(format!("TX rejected: {}", e))
            })?;

        // An orphan or a transaction dropped from the pool while it was
        // being processed.
        let Some(first) = accepted.first().filter(|d| d.tx.tx_hash() == tx_hash) else {
            self.node.mempool.remove_transaction(&tx, true);
            return Err(RpcError::internal(
                format!("transaction {} is not in accepted list", tx_hash),
                "",
            )
            .into());
        };
        let desc = first.clone();

        self.node.announce_new_transactions(&accepted).await;
        self.node
            .add_rebroadcast_inventory(InvVect::new(InvType::Tx, tx_hash), RelayData::TxDesc(desc))
            .await;
        Ok(json!(tx_hash.to_string()))
    }

    async fn stop(&self, _params: Params) -> HandlerResult {
        self.node.request_shutdown();
        Ok(json!("node stopping"))
    }

    async fn submit_block(&self, params: Params) -> HandlerResult {
        let hex_block: String = params.req(0, "hexblock")?;
        let bytes = hex::decode(pad_hex(&hex_block)).map_err(|_| RpcError::decode_hex(&hex_block))?;
        let block = Block::deserialize(&bytes)
            .map_err(|e| RpcError::deserialization(format!("Block decode failed: {}", e)))?;
        let hash = block.block_hash();

        if let Err(e) = self.node.sync_manager.submit_block(block) {
            return Ok(json!(format!("rejected: {}", e)));
        }
        tracing::info!("accepted block {} via submitblock", hash);
        Ok(Value::Null)
    }

    async fn uptime(&self, _params: Params) -> HandlerResult {
        Ok(json!(chrono::Utc::now().timestamp() - self.node.start_time()))
    }

    async fn validate_address(&self, params: Params) -> HandlerResult {
        let address: String = params.req(0, "address")?;
        let reply = match Address::decode(&address, self.network()) {
            Ok(addr) => ValidateAddressResult {
                is_valid: true,
                address: addr.encode(),
            },
            Err(_) => ValidateAddressResult::default(),
        };
        Ok(json!(reply))
    }

    async fn version(&self, _params: Params) -> HandlerResult {
        Ok(json!({
            "podjsonrpcapi": VersionResult {
                version_string: format!(
                    "{}.{}.{}",
                    JSONRPC_SEMVER_MAJOR, JSONRPC_SEMVER_MINOR, JSONRPC_SEMVER_PATCH
                ),
                major: JSONRPC_SEMVER_MAJOR,
                minor: JSONRPC_SEMVER_MINOR,
                patch: JSONRPC_SEMVER_PATCH,
                prerelease: String::new(),
                build_metadata: String::new(),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_command_lists_are_disjoint() {
        let handled: HashSet<&str> = RPC_HANDLERS.iter().map(|c| c.name).collect();
        assert_eq!(handled.len(), RPC_HANDLERS.len());
        for name in RPC_ASK_WALLET.iter().chain(RPC_UNIMPLEMENTED) {
            assert!(!handled.contains(name), "{} is both handled and listed", name);
        }
    }

    #[test]
    fn test_every_handled_command_has_help() {
        for command in RPC_HANDLERS {
            assert!(help::is_documented(command.name), "{} lacks help", command.name);
        }
    }

    #[test]
    fn test_pad_hex() {
        assert_eq!(pad_hex("abc"), "0abc");
        assert_eq!(pad_hex("abcd"), "abcd");
    }

    #[test]
    fn test_app_version_encoding() {
        assert!(app_version() > 0);
    }
}
