//! Read-mostly cache of committed-filter headers at checkpoint intervals.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::chain::{CfIndex, FilterType, Hash};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CfHeaderKv {
    block_hash: Hash,
    filter_header: Hash,
}

#[derive(Default)]
pub struct CfCheckptCache {
    caches: RwLock<HashMap<FilterType, Vec<CfHeaderKv>>>,
}

/// Walks back from the end until the cached block hash matches the
/// requested one. Everything before the returned index can be served from
/// cache.
fn fork_index(cache: &[CfHeaderKv], block_hashes: &[Hash]) -> usize {
    let mut idx = block_hashes.len().min(cache.len());
    while idx > 0 {
        if cache[idx - 1].block_hash == block_hashes[idx - 1] {
            break;
        }
        idx -= 1;
    }
    idx
}

impl CfCheckptCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, ft: FilterType) -> usize {
        self.caches.read().get(&ft).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, ft: FilterType) -> bool {
        self.len(ft) == 0
    }

    /// Filter headers for every checkpoint block in `block_hashes`. Entries
    /// whose block hash is still cached are served directly; the rest are
    /// fetched from `index` and written back. Returns `None` when a header
    /// cannot be obtained.
    pub fn checkpoints(
        &self,
        ft: FilterType,
        block_hashes: &[Hash],
        index: &dyn CfIndex,
    ) -> Option<Vec<Hash>> {
        {
            let caches = self.caches.read();
            let cache = caches.get(&ft).map(Vec::as_slice).unwrap_or(&[]);
            if block_hashes.len() <= cache.len()
                && fork_index(cache, block_hashes) == block_hashes.len()
            {
                tracing::trace!("serving stale cache of size {}", cache.len());
                return Some(
                    cache[..block_hashes.len()]
                        .iter()
                        .map(|kv| kv.filter_header)
                        .collect(),
                );
            }
        }

        let mut caches = self.caches.write();
        let cache = caches.entry(ft).or_default();
        let old_len = cache.len();
        // Another request may have grown the cache while we waited.
        if block_hashes.len() > cache.len() {
            tracing::info!(
                "growing size of checkpoint cache from {} to {} block hashes",
                cache.len(),
                block_hashes.len()
            );
            cache.resize(block_hashes.len(), CfHeaderKv::default());
        }

        let fork_idx = fork_index(cache, block_hashes);
        let mut headers: Vec<Hash> = cache[..fork_idx].iter().map(|kv| kv.filter_header).collect();
        let suffix = &block_hashes[fork_idx..];
        let fetched = match index.filter_headers_by_block_hashes(suffix, ft) {
            Ok(fetched) => fetched,
            Err(e) => {
                tracing::debug!("error retrieving cfilter headers: {}", e);
                cache.truncate(old_len);
                return None;
            }
        };
        for (i, header) in fetched.into_iter().enumerate() {
            let Some(filter_header) = header else {
                tracing::warn!("could not obtain CF header for {}", suffix[i]);
                cache.truncate(old_len);
                return None;
            };
            headers.push(filter_header);
            cache[fork_idx + i] = CfHeaderKv {
                block_hash: suffix[i],
                filter_header,
            };
        }
        Some(headers)
    }
}
