/// Sender Resolver
///
/// Finds the address and amount behind a spent output reference.
/// Resolution order:
/// 1. bounded in-memory LRU (no expiry, capacity evicts)
/// 2. local utxo table (skipped in insight mode), then collateral records
/// 3. the daemon's copy of the referenced transaction
///
/// Successful lookups from 2 or 3 are cached. Never fails: an output that
/// cannot be found anywhere resolves to `SenderInfo::unresolved()` with a
/// warning.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::constants::SENDER_CACHE_CAPACITY;
use crate::daemon::DaemonRpc;
use crate::metrics;
use crate::store::IndexStore;
use crate::telemetry::short_txid;
use crate::types::SenderInfo;

type OutpointRef = (String, u32);

pub struct SenderResolver {
    cache: Mutex<LruCache<OutpointRef, SenderInfo>>,
    store: Arc<IndexStore>,
    daemon: Arc<dyn DaemonRpc>,
    use_utxo_table: bool,
}

impl SenderResolver {
    pub fn new(store: Arc<IndexStore>, daemon: Arc<dyn DaemonRpc>, use_utxo_table: bool) -> Self {
        Self::with_capacity(store, daemon, use_utxo_table, SENDER_CACHE_CAPACITY)
    }

    pub fn with_capacity(
        store: Arc<IndexStore>,
        daemon: Arc<dyn DaemonRpc>,
        use_utxo_table: bool,
        capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            store,
            daemon,
            use_utxo_table,
        }
    }

    pub async fn resolve(&self, txid: &str, vout: u32) -> SenderInfo {
        let key = (txid.to_string(), vout);
        if let Some(hit) = self.cache.lock().await.get(&key) {
            metrics::increment_sender_resolutions("cache");
            return hit.clone();
        }

        let Some((info, source)) = self.lookup(txid, vout).await else {
            warn!(txid = %short_txid(txid), vout, "Transaction was not found anywhere. Incomplete tx!");
            metrics::increment_sender_resolutions("unresolved");
            return SenderInfo::unresolved();
        };

        metrics::increment_sender_resolutions(source);
        self.cache.lock().await.put(key, info.clone());
        info
    }

    async fn lookup(&self, txid: &str, vout: u32) -> Option<(SenderInfo, &'static str)> {
        if self.use_utxo_table {
            match self.store.get_utxo(txid, vout) {
                Ok(Some(utxo)) => {
                    return Some((SenderInfo::resolved(utxo.address, utxo.satoshis), "utxo"))
                }
                Ok(None) => {}
                Err(e) => warn!(txid = %short_txid(txid), vout, error = %e, "Utxo lookup failed"),
            }
        }

        match self.store.collateral_by_outpoint(txid, vout) {
            Ok(Some(tx)) if tx.address.is_some() => {
                let info = SenderInfo {
                    address: tx.address,
                    satoshis: tx.locked_amount,
                };
                return Some((info, "collateral"));
            }
            Ok(_) => {}
            Err(e) => warn!(txid = %short_txid(txid), vout, error = %e, "Collateral lookup failed"),
        }

        debug!(txid = %short_txid(txid), vout, "Falling back to daemon for sender");
        match self.daemon.get_raw_transaction(txid).await {
            Ok(tx) => {
                let output = tx
                    .vout
                    .iter()
                    .find(|o| o.n == vout)
                    .or_else(|| tx.vout.get(vout as usize))?;
                let address = output.address()?;
                Some((SenderInfo::resolved(address, output.value_sat), "daemon"))
            }
            Err(e) => {
                warn!(txid = %short_txid(txid), vout, error = %e, "Daemon transaction lookup failed");
                None
            }
        }
    }

    #[cfg(test)]
    pub async fn cached(&self, txid: &str, vout: u32) -> Option<SenderInfo> {
        self.cache
            .lock()
            .await
            .peek(&(txid.to_string(), vout))
            .cloned()
    }

    #[cfg(test)]
    pub async fn cache_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{create_test_store, MockDaemon, TxBuilder};
    use crate::types::{CollateralTransaction, UtxoRecord};

    fn utxo(txid: &str, vout: u32, address: &str, sats: u64) -> UtxoRecord {
        UtxoRecord {
            txid: txid.into(),
            vout,
            height: 1,
            address: address.into(),
            satoshis: sats,
            script_pub_key: String::new(),
            coinbase: false,
        }
    }

    #[tokio::test]
    async fn test_resolves_from_utxo_table_and_caches() {
        let (store, _temp) = create_test_store(10);
        store.insert_utxo(&utxo("aa", 0, "t1alice", 700)).unwrap();
        let daemon = Arc::new(MockDaemon::new());
        let resolver = SenderResolver::new(store.clone(), daemon.clone(), true);

        let info = resolver.resolve("aa", 0).await;
        assert_eq!(info, SenderInfo::resolved("t1alice", 700));
        assert_eq!(resolver.cache_len().await, 1);
        assert_eq!(daemon.raw_tx_calls(), 0);

        // served from cache even after the utxo is gone
        store.take_utxo("aa", 0, 2).unwrap();
        assert_eq!(resolver.resolve("aa", 0).await, info);
    }

    #[tokio::test]
    async fn test_insight_mode_skips_utxo_table() {
        let (store, _temp) = create_test_store(10);
        store.insert_utxo(&utxo("aa", 0, "t1alice", 700)).unwrap();
        let daemon = Arc::new(MockDaemon::new());
        daemon.add_raw_tx(TxBuilder::new("aa", 1).pay("t1fromdaemon", 900).build());
        let resolver = SenderResolver::new(store, daemon.clone(), false);

        let info = resolver.resolve("aa", 0).await;
        assert_eq!(info, SenderInfo::resolved("t1fromdaemon", 900));
        assert_eq!(daemon.raw_tx_calls(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_collateral_record() {
        let (store, _temp) = create_test_store(10);
        store
            .insert_collateral_tx(&CollateralTransaction {
                txid: "start".into(),
                version: 5,
                tx_type: Some(2),
                update_type: Some(0),
                ip: None,
                bench_tier: None,
                collateral_hash: "coll".into(),
                collateral_index: 0,
                address: Some("t1node".into()),
                locked_amount: Some(1000),
                height: 10,
            })
            .unwrap();
        let daemon = Arc::new(MockDaemon::new());
        let resolver = SenderResolver::new(store, daemon.clone(), true);

        let info = resolver.resolve("coll", 0).await;
        assert_eq!(info, SenderInfo::resolved("t1node", 1000));
        assert_eq!(daemon.raw_tx_calls(), 0);
    }

    #[tokio::test]
    async fn test_unresolved_is_not_cached() {
        let (store, _temp) = create_test_store(10);
        let daemon = Arc::new(MockDaemon::new());
        let resolver = SenderResolver::new(store, daemon, true);

        let info = resolver.resolve("missing", 3).await;
        assert!(!info.is_resolved());
        assert_eq!(info.satoshis, None);
        assert!(resolver.cached("missing", 3).await.is_none());
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let (store, _temp) = create_test_store(10);
        for i in 0..3 {
            store.insert_utxo(&utxo(&format!("t{}", i), 0, "t1a", 1)).unwrap();
        }
        let daemon = Arc::new(MockDaemon::new());
        let resolver = SenderResolver::with_capacity(store, daemon, true, 2);
        for i in 0..3 {
            resolver.resolve(&format!("t{}", i), 0).await;
        }
        assert_eq!(resolver.cache_len().await, 2);
        assert!(resolver.cached("t0", 0).await.is_none());
        assert!(resolver.cached("t2", 0).await.is_some());
    }
}
