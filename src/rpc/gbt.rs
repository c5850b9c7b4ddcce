//! Shared `getblocktemplate` work state: the cached template, the long-poll
//! registry and the rules for when to regenerate.

use parking_lot::{Mutex, MutexGuard};
use rand::seq::SliceRandom;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::error::{HandlerError, RpcError, ERR_RPC_INTERNAL};
use super::types::{GetBlockTemplateResult, GetBlockTemplateResultAux, GetBlockTemplateResultTx};
use crate::chain::{
    merkle_root, target_hex, BlockTemplate, Hash, TimeSource, MAX_BLOCK_SIGOPS_COST,
    MAX_BLOCK_WEIGHT, MAX_TIME_OFFSET_SECONDS,
};
use crate::network::{MempoolListener, Node};

/// Minimum seconds between template rebuilds triggered by mempool churn.
pub const GBT_REGENERATE_SECONDS: i64 = 60;
pub const GBT_NONCE_RANGE: &str = "00000000ffffffff";
pub const GBT_MUTABLE_FIELDS: [&str; 4] = ["time", "transactions/add", "prevblock", "coinbase/append"];
pub const GBT_CAPABILITIES: [&str; 1] = ["proposal"];
pub const COINBASE_FLAGS: &str = "/P2SH/pod/";
pub const MAX_BLOCK_PAYLOAD: i64 = 4_000_000;
pub const NO_PAY_ADDRESS: &str = "A coinbase transaction has been requested, but the server has not been configured with any payment addresses via [mining] mining_addrs";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid longpollid format")]
pub struct InvalidTemplateId;

/// `<prev block hash>-<unix seconds the template was generated>`.
pub fn encode_template_id(prev_hash: &Hash, last_generated: i64) -> String {
    format!("{}-{}", prev_hash, last_generated)
}

pub fn decode_template_id(id: &str) -> Result<(Hash, i64), InvalidTemplateId> {
    let mut fields = id.split('-');
    let (Some(hash), Some(time), None) = (fields.next(), fields.next(), fields.next()) else {
        return Err(InvalidTemplateId);
    };
    let prev_hash = hash.parse::<Hash>().map_err(|_| InvalidTemplateId)?;
    let last_generated = time.parse::<i64>().map_err(|_| InvalidTemplateId)?;
    Ok((prev_hash, last_generated))
}

fn coinbase_aux() -> GetBlockTemplateResultAux {
    let mut script = Vec::with_capacity(COINBASE_FLAGS.len() + 1);
    script.push(COINBASE_FLAGS.len() as u8);
    script.extend_from_slice(COINBASE_FLAGS.as_bytes());
    GetBlockTemplateResultAux {
        flags: hex::encode(script),
    }
}

/// Template state. Every method expects the caller to hold the lock, which
/// `GbtWorkState::lock` hands out.
#[derive(Default)]
pub struct GbtState {
    /// Mempool update time the template was built from (unix seconds).
    pub last_tx_update: i64,
    /// Unix seconds of the last full regeneration; zero before the first.
    pub last_generated: i64,
    pub min_timestamp: i64,
    pub template: Option<BlockTemplate>,
    prev_hash: Option<Hash>,
    notify_map: HashMap<Hash, HashMap<i64, CancellationToken>>,
}

impl GbtState {
    pub fn prev_hash(&self) -> Option<Hash> {
        self.prev_hash
    }

    /// Number of distinct (tip, generation time) pairs with waiters.
    pub fn pending_long_polls(&self) -> usize {
        self.notify_map.values().map(HashMap::len).sum()
    }

    /// Wakes long pollers whose template went stale. Waiters on any other
    /// tip are always released; waiters on `latest_hash` only when their
    /// template predates `last_generated`.
    pub fn notify_long_pollers(&mut self, latest_hash: &Hash, last_generated: i64) {
        self.notify_map.retain(|hash, waiters| {
            if hash == latest_hash {
                return true;
            }
            for token in waiters.values() {
                token.cancel();
            }
            false
        });

        if last_generated == 0 {
            return;
        }
        let Some(waiters) = self.notify_map.get_mut(latest_hash) else {
            return;
        };
        waiters.retain(|generated, token| {
            if *generated < last_generated {
                token.cancel();
                false
            } else {
                true
            }
        });
        if waiters.is_empty() {
            self.notify_map.remove(latest_hash);
        }
    }

    /// Token cancelled once the template identified by the pair is stale.
    /// Requests for the same pair share a token.
    pub fn template_update_chan(&mut self, prev_hash: Hash, last_generated: i64) -> CancellationToken {
        self.notify_map
            .entry(prev_hash)
            .or_default()
            .entry(last_generated)
            .or_default()
            .clone()
    }

    /// Regenerates the template when the tip moved or the mempool changed
    /// and enough time has passed; otherwise refreshes its time and nonce.
    /// `now` is the local clock in unix seconds.
    pub fn update_block_template(
        &mut self,
        node: &Node,
        now: i64,
        use_coinbase_value: bool,
    ) -> Result<(), RpcError> {
        let mut last_tx_update = node.mempool.last_updated();
        if last_tx_update == 0 {
            last_tx_update = now;
        }

        let best = node.chain.best_snapshot();
        let latest_hash = best.hash;
        let stale = match (&self.template, self.prev_hash) {
            (Some(_), Some(prev)) => {
                prev != latest_hash
                    || (self.last_tx_update != last_tx_update
                        && now > self.last_generated + GBT_REGENERATE_SECONDS)
            }
            _ => true,
        };

        if stale {
            // Cleared first so a failure below forces the next call to retry.
            self.prev_hash = None;

            let pay_to = if use_coinbase_value {
                None
            } else {
                Some(
                    node.settings
                        .mining_addrs
                        .choose(&mut rand::thread_rng())
                        .ok_or_else(|| RpcError::internal("no mining addresses configured", ""))?,
                )
            };
            let template = node.template_generator.new_block_template(pay_to).map_err(|e| {
                RpcError::internal(e, "Failed to create new block template")
            })?;

            tracing::debug!(
                "generated block template (timestamp {}, target {}, merkle root {})",
                template.block.header.timestamp,
                target_hex(template.block.header.bits),
                template.block.header.merkle_root
            );
            self.template = Some(template);
            self.last_generated = now;
            self.last_tx_update = last_tx_update;
            self.prev_hash = Some(latest_hash);
            self.min_timestamp = best.median_time + 1;

            self.notify_long_pollers(&latest_hash, last_tx_update);
            return Ok(());
        }

        let Some(template) = self.template.as_mut() else {
            return Err(RpcError::internal("block template missing", ""));
        };
        if !use_coinbase_value && !template.valid_pay_address {
            let pay_to = node
                .settings
                .mining_addrs
                .choose(&mut rand::thread_rng())
                .ok_or_else(|| RpcError::internal("no mining addresses configured", ""))?;
            let block = &mut template.block;
            match block.transactions.first_mut().and_then(|cb| cb.tx_out.first_mut()) {
                Some(out) => out.pk_script = pay_to.pay_to_script(),
                None => return Err(RpcError::internal("template has no coinbase output", "")),
            }
            template.valid_pay_address = true;
            block.header.merkle_root = merkle_root(&block.transactions);
        }

        let block = &mut template.block;
        if let Err(e) = node.template_generator.update_block_time(block) {
            tracing::error!("failed to update block time: {}", e);
        }
        block.header.nonce = 0;
        tracing::debug!(
            "updated block template (timestamp {}, target {})",
            block.header.timestamp,
            target_hex(block.header.bits)
        );
        Ok(())
    }

    /// Renders the cached template for the wire.
    pub fn block_template_result(
        &self,
        time_source: &dyn TimeSource,
        use_coinbase_value: bool,
        submit_old: Option<bool>,
    ) -> Result<GetBlockTemplateResult, RpcError> {
        let Some(template) = self.template.as_ref() else {
            return Err(RpcError::internal("no block template available", ""));
        };
        let block = &template.block;
        let header = &block.header;

        let adjusted_time = time_source.adjusted_time();
        let max_time = adjusted_time + MAX_TIME_OFFSET_SECONDS;
        if header.timestamp > max_time {
            return Err(RpcError::out_of_range(format!(
                "The template time is after the maximum allowed time for a block - template time {}, maximum time {}",
                adjusted_time, max_time
            )));
        }

        let mut tx_index: HashMap<Hash, i64> = HashMap::with_capacity(block.transactions.len());
        let mut transactions = Vec::with_capacity(block.transactions.len().saturating_sub(1));
        for (i, tx) in block.transactions.iter().enumerate() {
            let hash = tx.tx_hash();
            tx_index.insert(hash, i as i64);
            if i == 0 {
                continue;
            }
            let depends: BTreeSet<i64> = tx
                .tx_in
                .iter()
                .filter_map(|input| tx_index.get(&input.previous_out_point.hash).copied())
                .collect();
            transactions.push(GetBlockTemplateResultTx {
                data: hex::encode(tx.serialize()),
                hash: hash.to_string(),
                depends: depends.into_iter().collect(),
                fee: template.fees.get(i).copied().unwrap_or_default(),
                sigops: template.sig_op_costs.get(i).copied().unwrap_or_default(),
                weight: tx.serialize_size() as i64 * 4,
            });
        }

        let prev_hash = self.prev_hash.unwrap_or(header.prev_block);
        let mut reply = GetBlockTemplateResult {
            bits: format!("{:x}", header.bits),
            cur_time: header.timestamp,
            height: i64::from(template.height),
            previous_hash: header.prev_block.to_string(),
            sig_op_limit: MAX_BLOCK_SIGOPS_COST,
            size_limit: MAX_BLOCK_PAYLOAD,
            weight_limit: MAX_BLOCK_WEIGHT,
            transactions,
            version: header.version,
            coinbase_aux: None,
            coinbase_txn: None,
            coinbase_value: None,
            default_witness_commitment: template.witness_commitment.as_ref().map(hex::encode),
            long_poll_id: encode_template_id(&prev_hash, self.last_generated),
            submit_old,
            target: target_hex(header.bits),
            max_time,
            min_time: self.min_timestamp,
            mutable: GBT_MUTABLE_FIELDS.iter().map(|s| s.to_string()).collect(),
            nonce_range: GBT_NONCE_RANGE.to_string(),
            capabilities: GBT_CAPABILITIES.iter().map(|s| s.to_string()).collect(),
        };

        let Some(coinbase) = block.transactions.first() else {
            return Err(RpcError::internal("block template has no coinbase", ""));
        };
        if use_coinbase_value {
            reply.coinbase_aux = Some(coinbase_aux());
            reply.coinbase_value = coinbase.tx_out.first().map(|out| out.value);
        } else {
            if !template.valid_pay_address {
                return Err(RpcError::new(ERR_RPC_INTERNAL, NO_PAY_ADDRESS));
            }
            reply.coinbase_txn = Some(GetBlockTemplateResultTx {
                data: hex::encode(coinbase.serialize()),
                hash: coinbase.tx_hash().to_string(),
                depends: Vec::new(),
                fee: template.fees.first().copied().unwrap_or_default(),
                sigops: template.sig_op_costs.first().copied().unwrap_or_default(),
                weight: coinbase.serialize_size() as i64 * 4,
            });
        }
        Ok(reply)
    }
}

pub struct GbtWorkState {
    state: Mutex<GbtState>,
    time_source: Arc<dyn TimeSource>,
}

impl GbtWorkState {
    pub fn new(time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            state: Mutex::new(GbtState::default()),
            time_source,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, GbtState> {
        self.state.lock()
    }

    /// Releases long pollers made stale by a newly connected block.
    pub fn notify_block_connected(&self, hash: &Hash) {
        let mut state = self.state.lock();
        let last_tx_update = state.last_tx_update;
        state.notify_long_pollers(hash, last_tx_update);
    }

    /// Serves a regular (non long-poll) template request.
    pub fn current_template(&self, node: &Node, use_coinbase_value: bool) -> Result<GetBlockTemplateResult, RpcError> {
        let mut state = self.state.lock();
        state.update_block_template(node, self.time_source.now(), use_coinbase_value)?;
        state.block_template_result(self.time_source.as_ref(), use_coinbase_value, None)
    }

    /// Answers immediately when the client's template is already stale,
    /// otherwise waits for it to become stale or for the client to leave.
    pub async fn long_poll(
        &self,
        node: &Node,
        long_poll_id: &str,
        use_coinbase_value: bool,
        close: &CancellationToken,
    ) -> Result<GetBlockTemplateResult, HandlerError> {
        let (prev_hash, stale) = {
            let mut state = self.state.lock();
            state.update_block_template(node, self.time_source.now(), use_coinbase_value)?;

            let (prev_hash, last_generated) = match decode_template_id(long_poll_id) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::debug!("{}: {}", e, long_poll_id);
                    return Ok(state.block_template_result(
                        self.time_source.as_ref(),
                        use_coinbase_value,
                        None,
                    )?);
                }
            };

            let template_prev = state
                .template
                .as_ref()
                .map(|t| t.block.header.prev_block)
                .unwrap_or_default();
            if prev_hash != template_prev || last_generated != state.last_generated {
                let submit_old = prev_hash == template_prev;
                return Ok(state.block_template_result(
                    self.time_source.as_ref(),
                    use_coinbase_value,
                    Some(submit_old),
                )?);
            }
            (prev_hash, state.template_update_chan(prev_hash, last_generated))
        };

        tokio::select! {
            _ = close.cancelled() => return Err(HandlerError::ClientQuit),
            _ = stale.cancelled() => {}
        }

        let mut state = self.state.lock();
        state.update_block_template(node, self.time_source.now(), use_coinbase_value)?;
        let submit_old = state
            .template
            .as_ref()
            .is_some_and(|t| t.block.header.prev_block == prev_hash);
        Ok(state.block_template_result(
            self.time_source.as_ref(),
            use_coinbase_value,
            Some(submit_old),
        )?)
    }
}

impl MempoolListener for GbtWorkState {
    fn notify_mempool_tx(&self, last_updated: i64) {
        let mut state = self.state.lock();
        let Some(prev_hash) = state.prev_hash else {
            return;
        };
        if state.last_generated == 0 {
            return;
        }
        if self.time_source.now() > state.last_generated + GBT_REGENERATE_SECONDS {
            state.notify_long_pollers(&prev_hash, last_updated);
        }
    }
}
