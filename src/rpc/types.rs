//! JSON shapes of requests, replies and command results.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::RpcError;

/// JSON-RPC 1.0 request. `id` is `None` both when absent and when `null`.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Option<Value>,
}

/// Reply envelope. Both `result` and `error` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub result: Value,
    pub error: Option<RpcError>,
    pub id: Value,
}

impl Response {
    pub fn new(id: Option<Value>, outcome: Result<Value, RpcError>) -> Self {
        let id = id.unwrap_or(Value::Null);
        match outcome {
            Ok(result) => Self {
                result,
                error: None,
                id,
            },
            Err(err) => Self {
                result: Value::Null,
                error: Some(err),
                id,
            },
        }
    }
}

/// Positional parameters of a command.
#[derive(Debug, Clone, Default)]
pub struct Params(Vec<Value>);

impl Params {
    pub fn from_value(v: Value) -> Self {
        match v {
            Value::Array(items) => Self(items),
            Value::Null => Self(Vec::new()),
            other => Self(vec![other]),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rejects calls with more than `max` positional parameters.
    pub fn at_most(&self, method: &str, max: usize) -> Result<(), RpcError> {
        if self.0.len() > max {
            return Err(RpcError::invalid_params(format!(
                "wrong number of params (expected at most {}, received {}) for {}",
                max,
                self.0.len(),
                method
            )));
        }
        Ok(())
    }

    /// Optional parameter at `idx`; `null` counts as absent.
    pub fn opt<T: DeserializeOwned>(&self, idx: usize, name: &str) -> Result<Option<T>, RpcError> {
        match self.0.get(idx) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| RpcError::invalid_params(format!("parameter '{}': {}", name, e))),
        }
    }

    pub fn req<T: DeserializeOwned>(&self, idx: usize, name: &str) -> Result<T, RpcError> {
        self.opt(idx, name)?
            .ok_or_else(|| RpcError::invalid_params(format!("missing required parameter '{}'", name)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TemplateRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, rename = "longpollid", skip_serializing_if = "String::is_empty")]
    pub long_poll_id: String,
    #[serde(default, rename = "sigoplimit", skip_serializing_if = "Option::is_none")]
    pub sig_op_limit: Option<i64>,
    #[serde(default, rename = "sizelimit", skip_serializing_if = "Option::is_none")]
    pub size_limit: Option<i64>,
    #[serde(default, rename = "maxversion", skip_serializing_if = "Option::is_none")]
    pub max_version: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    /// Hex block for proposal mode.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default, rename = "workid", skip_serializing_if = "String::is_empty")]
    pub work_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetBlockTemplateResultTx {
    pub data: String,
    pub hash: String,
    pub depends: Vec<i64>,
    pub fee: i64,
    pub sigops: i64,
    pub weight: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetBlockTemplateResultAux {
    pub flags: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetBlockTemplateResult {
    pub bits: String,
    #[serde(rename = "curtime")]
    pub cur_time: i64,
    pub height: i64,
    #[serde(rename = "previousblockhash")]
    pub previous_hash: String,
    #[serde(rename = "sigoplimit")]
    pub sig_op_limit: i64,
    #[serde(rename = "sizelimit")]
    pub size_limit: i64,
    #[serde(rename = "weightlimit")]
    pub weight_limit: i64,
    pub transactions: Vec<GetBlockTemplateResultTx>,
    pub version: i32,
    #[serde(rename = "coinbaseaux", skip_serializing_if = "Option::is_none")]
    pub coinbase_aux: Option<GetBlockTemplateResultAux>,
    #[serde(rename = "coinbasetxn", skip_serializing_if = "Option::is_none")]
    pub coinbase_txn: Option<GetBlockTemplateResultTx>,
    #[serde(rename = "coinbasevalue", skip_serializing_if = "Option::is_none")]
    pub coinbase_value: Option<i64>,
    #[serde(
        rename = "default_witness_commitment",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_witness_commitment: Option<String>,
    #[serde(rename = "longpollid")]
    pub long_poll_id: String,
    #[serde(rename = "submitold", skip_serializing_if = "Option::is_none")]
    pub submit_old: Option<bool>,
    pub target: String,
    #[serde(rename = "maxtime")]
    pub max_time: i64,
    #[serde(rename = "mintime")]
    pub min_time: i64,
    pub mutable: Vec<String>,
    #[serde(rename = "noncerange")]
    pub nonce_range: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetBestBlockResult {
    pub hash: String,
    pub height: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetAddedNodeInfoResultAddr {
    pub address: String,
    pub connected: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetAddedNodeInfoResult {
    #[serde(rename = "addednode")]
    pub added_node: String,
    pub connected: bool,
    pub addresses: Vec<GetAddedNodeInfoResultAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InfoChainResult {
    pub version: i32,
    #[serde(rename = "protocolversion")]
    pub protocol_version: i32,
    pub blocks: i32,
    #[serde(rename = "timeoffset")]
    pub time_offset: i64,
    pub connections: i32,
    pub proxy: String,
    pub difficulty: f64,
    pub testnet: bool,
    #[serde(rename = "relayfee")]
    pub relay_fee: f64,
    pub errors: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetMiningInfoResult {
    pub blocks: i64,
    #[serde(rename = "currentblocksize")]
    pub current_block_size: u64,
    #[serde(rename = "currentblockweight")]
    pub current_block_weight: u64,
    #[serde(rename = "currentblocktx")]
    pub current_block_tx: u64,
    pub difficulty: f64,
    pub errors: String,
    pub generate: bool,
    #[serde(rename = "genthreads")]
    pub gen_threads: usize,
    #[serde(rename = "hashespersec")]
    pub hashes_per_sec: u64,
    #[serde(rename = "pooledtx")]
    pub pooled_tx: u64,
    pub testnet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetNetTotalsResult {
    #[serde(rename = "totalbytesrecv")]
    pub total_bytes_recv: u64,
    #[serde(rename = "totalbytessent")]
    pub total_bytes_sent: u64,
    #[serde(rename = "timemillis")]
    pub time_millis: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetPeerInfoResult {
    pub id: i32,
    pub addr: String,
    #[serde(rename = "addrlocal", skip_serializing_if = "String::is_empty")]
    pub addr_local: String,
    pub services: String,
    #[serde(rename = "relaytxes")]
    pub relay_txes: bool,
    #[serde(rename = "lastsend")]
    pub last_send: i64,
    #[serde(rename = "lastrecv")]
    pub last_recv: i64,
    #[serde(rename = "bytessent")]
    pub bytes_sent: u64,
    #[serde(rename = "bytesrecv")]
    pub bytes_recv: u64,
    #[serde(rename = "conntime")]
    pub conn_time: i64,
    #[serde(rename = "timeoffset")]
    pub time_offset: i64,
    #[serde(rename = "pingtime")]
    pub ping_time: f64,
    pub version: u32,
    #[serde(rename = "subver")]
    pub sub_ver: String,
    pub inbound: bool,
    #[serde(rename = "startingheight")]
    pub starting_height: i32,
    #[serde(rename = "currentheight")]
    pub current_height: i32,
    #[serde(rename = "banscore")]
    pub ban_score: i32,
    #[serde(rename = "feefilter")]
    pub fee_filter: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidateAddressResult {
    #[serde(rename = "isvalid")]
    pub is_valid: bool,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionResult {
    #[serde(rename = "versionstring")]
    pub version_string: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub prerelease: String,
    #[serde(rename = "buildmetadata")]
    pub build_metadata: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetBlockHeaderVerboseResult {
    pub hash: String,
    pub confirmations: i64,
    pub height: i32,
    pub version: i32,
    #[serde(rename = "versionHex")]
    pub version_hex: String,
    #[serde(rename = "merkleroot")]
    pub merkle_root: String,
    pub time: i64,
    pub nonce: u64,
    pub bits: String,
    pub difficulty: f64,
    #[serde(rename = "previousblockhash", skip_serializing_if = "String::is_empty", default)]
    pub previous_hash: String,
    #[serde(rename = "nextblockhash", skip_serializing_if = "String::is_empty", default)]
    pub next_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetBlockChainInfoResult {
    pub chain: String,
    pub blocks: i32,
    pub headers: i32,
    #[serde(rename = "bestblockhash")]
    pub best_block_hash: String,
    pub difficulty: f64,
    #[serde(rename = "mediantime")]
    pub median_time: i64,
    pub pruned: bool,
    #[serde(rename = "chainwork")]
    pub chain_work: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScriptPubKeyResult {
    pub hex: String,
    #[serde(rename = "reqSigs", skip_serializing_if = "Option::is_none", default)]
    pub req_sigs: Option<i32>,
    #[serde(rename = "type")]
    pub script_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptSig {
    pub hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vin {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub coinbase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub vout: Option<u32>,
    #[serde(rename = "scriptSig", skip_serializing_if = "Option::is_none", default)]
    pub script_sig: Option<ScriptSig>,
    pub sequence: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vout {
    pub value: f64,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKeyResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TxRawResult {
    pub hex: String,
    pub txid: String,
    pub hash: String,
    pub size: usize,
    pub vsize: usize,
    pub weight: usize,
    pub version: i32,
    #[serde(rename = "locktime")]
    pub lock_time: u32,
    pub vin: Vec<Vin>,
    pub vout: Vec<Vout>,
    #[serde(rename = "blockhash", skip_serializing_if = "String::is_empty", default)]
    pub block_hash: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub confirmations: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub time: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetTxOutResult {
    #[serde(rename = "bestblock")]
    pub best_block: String,
    pub confirmations: i64,
    pub value: f64,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKeyResult,
    pub coinbase: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_null_and_missing_id() {
        let with_null: Request =
            serde_json::from_value(json!({"method": "ping", "id": null})).unwrap();
        assert!(with_null.id.is_none());
        let missing: Request = serde_json::from_value(json!({"method": "ping"})).unwrap();
        assert!(missing.id.is_none());
        assert!(missing.jsonrpc.is_empty());
    }

    #[test]
    fn test_params_access() {
        let params = Params::from_value(json!(["abc", 5, null]));
        assert_eq!(params.req::<String>(0, "hash").unwrap(), "abc");
        assert_eq!(params.opt::<i64>(1, "n").unwrap(), Some(5));
        assert_eq!(params.opt::<i64>(2, "n").unwrap(), None);
        assert!(params.req::<i64>(3, "missing").is_err());
        assert!(params.req::<i64>(0, "hash").is_err());
        assert!(params.at_most("x", 2).is_err());
    }

    #[test]
    fn test_response_always_carries_result_and_error() {
        let reply = Response::new(Some(json!(1)), Ok(json!("ok")));
        let v = serde_json::to_value(&reply).unwrap();
        assert_eq!(v, json!({"result": "ok", "error": null, "id": 1}));
    }
}
