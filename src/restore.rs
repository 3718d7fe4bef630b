/// Restore / Rescan Engine
///
/// Rolls every derived collection back to a target height using the
/// `height_index` column family:
///
/// - utxos, fusion records, collateral transactions, app hashes and
///   governance messages created above the target are deleted
/// - address buckets lose their entries above the target (and are deleted
///   once empty)
/// - outputs created at or below the target but spent above it come back
///   from their undo entries
///
/// The watermark is persisted first. Rollback writes go through
/// `AtomicBatchWriter` in bounded chunks, so an interrupted restore leaves
/// the watermark at the target and re-running the same restore converges.
///
/// Bootstrap wipes the derived collections entirely for a fresh sync.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::apps::AppLifecycle;
use crate::atomic_writer::AtomicBatchWriter;
use crate::db_handles::*;
use crate::error::{IndexerError, Result};
use crate::store::{
    address_utxo_key, collateral_address_key, collateral_outpoint_key, height_key, outpoint_key, HeightEntry, IndexStore,
    TAG_ADDRESS, TAG_APP_HASH, TAG_COLLATERAL, TAG_FUSION, TAG_GOVERNANCE, TAG_SPENT, TAG_UTXO,
};
use crate::types::UtxoRecord;

/// Operations per committed chunk
const RESTORE_BATCH_LIMIT: usize = 10_000;

/// What a restore removed and brought back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub height: u32,
    pub utxos_removed: usize,
    pub utxos_restored: usize,
    pub fusion_removed: usize,
    pub collateral_removed: usize,
    pub app_hashes_removed: usize,
    pub governance_removed: usize,
    pub buckets_truncated: usize,
    pub buckets_removed: usize,
}

impl RestoreReport {
    fn new(height: u32) -> Self {
        Self {
            height,
            ..Default::default()
        }
    }
}

pub struct RestoreEngine {
    store: Arc<IndexStore>,
    lifecycle: Arc<dyn AppLifecycle>,
}

impl RestoreEngine {
    pub fn new(store: Arc<IndexStore>, lifecycle: Arc<dyn AppLifecycle>) -> Self {
        Self { store, lifecycle }
    }

    /// Roll derived state back so nothing above `height` remains.
    ///
    /// `None` is rejected with `MissingHeight`; 0 is a valid target.
    /// With `rescan_apps` the app message and information collections are
    /// rolled back too.
    pub async fn restore_to_height(
        &self,
        height: Option<u32>,
        rescan_apps: bool,
    ) -> Result<RestoreReport> {
        let height = height.ok_or(IndexerError::MissingHeight)?;
        info!(height, rescan_apps, "Rescanning database from height");

        self.store.set_scanned_height(height)?;

        let mut report = RestoreReport::new(height);
        let mut writer = AtomicBatchWriter::new(self.store.db().clone(), RESTORE_BATCH_LIMIT);

        for entry in self.store.height_entries_above(TAG_UTXO, height)? {
            if let Some(utxo) = self.store.utxo_by_key(&entry.pk)? {
                writer.delete(CF_UTXO, entry.pk.clone());
                writer.delete(CF_ADDRESS_UTXO, address_utxo_key(&utxo.address, &utxo.txid, utxo.vout));
                report.utxos_removed += 1;
            }
            writer.delete(CF_HEIGHT_INDEX, entry.key);
            flush_if_full(&mut writer).await?;
        }

        report.fusion_removed = self.drop_entries(&mut writer, TAG_FUSION, CF_COINBASE_FUSION, height).await?;
        report.app_hashes_removed = self.drop_entries(&mut writer, TAG_APP_HASH, CF_APP_HASHES, height).await?;
        report.governance_removed =
            self.drop_entries(&mut writer, TAG_GOVERNANCE, CF_CHAIN_MESSAGES, height).await?;

        for entry in self.store.height_entries_above(TAG_COLLATERAL, height)? {
            let txid = String::from_utf8_lossy(&entry.pk).into_owned();
            if let Some(tx) = self.store.get_collateral_tx(&txid)? {
                writer.delete(CF_COLLATERAL_TX, entry.pk.clone());
                writer.delete(
                    CF_COLLATERAL_OUTPOINT,
                    collateral_outpoint_key(&tx.collateral_hash, tx.collateral_index, &tx.txid),
                );
                if let Some(address) = &tx.address {
                    writer.delete(CF_COLLATERAL_ADDRESS, collateral_address_key(address, &tx.txid));
                }
                report.collateral_removed += 1;
            }
            writer.delete(CF_HEIGHT_INDEX, entry.key);
            flush_if_full(&mut writer).await?;
        }

        self.truncate_buckets(&mut writer, height, &mut report).await?;
        self.resurrect_spent(&mut writer, height, &mut report).await?;

        writer.flush().await?;

        if rescan_apps {
            self.lifecycle.remove_app_records_above(height).await?;
        }

        info!(
            height,
            utxos_removed = report.utxos_removed,
            utxos_restored = report.utxos_restored,
            buckets_truncated = report.buckets_truncated,
            app_hashes_removed = report.app_hashes_removed,
            "Rescan finished"
        );
        Ok(report)
    }

    /// Delete the record behind every `tag` entry above `height`
    async fn drop_entries(
        &self,
        writer: &mut AtomicBatchWriter,
        tag: u8,
        cf_name: &'static str,
        height: u32,
    ) -> Result<usize> {
        let entries = self.store.height_entries_above(tag, height)?;
        let removed = entries.len();
        for entry in entries {
            writer.delete(cf_name, entry.pk);
            writer.delete(CF_HEIGHT_INDEX, entry.key);
            flush_if_full(writer).await?;
        }
        Ok(removed)
    }

    async fn truncate_buckets(
        &self,
        writer: &mut AtomicBatchWriter,
        height: u32,
        report: &mut RestoreReport,
    ) -> Result<()> {
        let entries = self.store.height_entries_above(TAG_ADDRESS, height)?;
        let bucket_keys: BTreeSet<Vec<u8>> = entries.iter().map(|e| e.pk.clone()).collect();

        for key in bucket_keys {
            let Some(mut bucket) = self.store.get_bucket(&key)? else {
                continue;
            };
            if !bucket.truncate_above(height) {
                continue;
            }
            if bucket.transactions.is_empty() {
                writer.delete(CF_ADDRESS_TX, key);
                report.buckets_removed += 1;
            } else {
                writer.put(CF_ADDRESS_TX, key, bincode::serialize(&bucket)?);
                report.buckets_truncated += 1;
            }
            flush_if_full(writer).await?;
        }

        for entry in entries {
            writer.delete(CF_HEIGHT_INDEX, entry.key);
            flush_if_full(writer).await?;
        }
        Ok(())
    }

    /// Bring back outputs that existed at `height` but were spent above it
    async fn resurrect_spent(
        &self,
        writer: &mut AtomicBatchWriter,
        height: u32,
        report: &mut RestoreReport,
    ) -> Result<()> {
        for entry in self.store.height_entries_above(TAG_SPENT, height)? {
            match decode_undo(&entry) {
                Some(utxo) if utxo.height <= height => {
                    let key = outpoint_key(&utxo.txid, utxo.vout);
                    writer.put(CF_ADDRESS_UTXO, address_utxo_key(&utxo.address, &utxo.txid, utxo.vout), Vec::new());
                    writer.put(CF_HEIGHT_INDEX, height_key(TAG_UTXO, utxo.height, &key), Vec::new());
                    writer.put(CF_UTXO, key, bincode::serialize(&utxo)?);
                    report.utxos_restored += 1;
                }
                Some(_) => {}
                None => warn!(height = entry.height, "Undecodable spent output entry dropped"),
            }
            writer.delete(CF_HEIGHT_INDEX, entry.key);
            flush_if_full(writer).await?;
        }
        Ok(())
    }

    /// Wipe every derived collection. The watermark is left for the caller.
    pub async fn bootstrap(&self, reindex_apps: bool) -> Result<usize> {
        info!(reindex_apps, "Preparing database for a fresh sync");
        let mut removed = 0;
        for &cf_name in DERIVED_CFS {
            loop {
                let keys = self.store.first_keys(cf_name, RESTORE_BATCH_LIMIT)?;
                if keys.is_empty() {
                    break;
                }
                let mut writer = AtomicBatchWriter::new(self.store.db().clone(), RESTORE_BATCH_LIMIT);
                for key in keys {
                    writer.delete(cf_name, key);
                }
                removed += writer.flush().await?;
            }
        }

        if let Err(e) = self.store.ensure_unique_hash_index() {
            warn!(error = %e, "App hash uniqueness check failed");
        }

        if reindex_apps {
            self.lifecycle.drop_app_collections().await?;
        }
        info!(removed, "Preparation done");
        Ok(removed)
    }
}

async fn flush_if_full(writer: &mut AtomicBatchWriter) -> Result<()> {
    if writer.should_flush() {
        writer.flush().await?;
    }
    Ok(())
}

fn decode_undo(entry: &HeightEntry) -> Option<UtxoRecord> {
    bincode::deserialize(&entry.value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CollateralFilter;
    use crate::test_support::*;
    use crate::types::{AppPaymentCandidate, CollateralTransaction, GovernanceMessage};

    fn utxo(txid: &str, vout: u32, height: u32, address: &str, sats: u64) -> UtxoRecord {
        UtxoRecord {
            txid: txid.to_string(),
            vout,
            height,
            address: address.to_string(),
            satoshis: sats,
            script_pub_key: String::new(),
            coinbase: false,
        }
    }

    fn engine(store: Arc<IndexStore>) -> (RestoreEngine, Arc<RecordingLifecycle>) {
        let lifecycle = Arc::new(RecordingLifecycle::new());
        (RestoreEngine::new(store, lifecycle.clone()), lifecycle)
    }

    #[tokio::test]
    async fn test_missing_height_rejected() {
        let (store, _temp) = create_test_store(10);
        let (engine, _) = engine(store);
        let err = engine.restore_to_height(None, false).await.unwrap_err();
        assert!(matches!(err, IndexerError::MissingHeight));
    }

    #[tokio::test]
    async fn test_restore_removes_records_above_height() {
        let (store, _temp) = create_test_store(10);
        store.insert_utxo(&utxo("low", 0, 990, "t1a", 5)).unwrap();
        store.insert_utxo(&utxo("high", 0, 998, "t1a", 7)).unwrap();
        store.insert_fusion(&utxo("cbhigh", 0, 999, "t1a", 7)).unwrap();
        store
            .insert_app_candidate(&AppPaymentCandidate {
                txid: "pay".into(),
                height: 997,
                hash: "h1".into(),
                value: 1,
                message: false,
            })
            .unwrap();
        store
            .upsert_governance_message(&GovernanceMessage::new("gov", 996, "u1_x"))
            .unwrap();
        store.set_scanned_height(1000).unwrap();

        let (engine, lifecycle) = engine(store.clone());
        let report = engine.restore_to_height(Some(995), true).await.unwrap();

        assert_eq!(store.scanned_height().unwrap(), 995);
        assert_eq!(report.utxos_removed, 1);
        assert_eq!(report.fusion_removed, 1);
        assert_eq!(report.app_hashes_removed, 1);
        assert_eq!(report.governance_removed, 1);
        assert!(store.get_utxo("low", 0).unwrap().is_some());
        assert!(store.get_utxo("high", 0).unwrap().is_none());
        assert_eq!(store.utxos_for_address("t1a").unwrap().len(), 1);
        assert!(store.app_candidate("h1").unwrap().is_none());
        assert!(store.governance_messages().unwrap().is_empty());
        assert!(store.max_indexed_height().unwrap().unwrap() <= 995);
        assert_eq!(lifecycle.calls(), vec!["remove_app_records_above:995".to_string()]);
    }

    #[tokio::test]
    async fn test_restore_resurrects_spent_outputs() {
        let (store, _temp) = create_test_store(10);
        store.insert_utxo(&utxo("old", 1, 900, "t1a", 50)).unwrap();
        store.insert_utxo(&utxo("fresh", 0, 999, "t1b", 20)).unwrap();
        store.take_utxo("old", 1, 998).unwrap();
        store.take_utxo("fresh", 0, 1000).unwrap();

        let (engine, _) = engine(store.clone());
        let report = engine.restore_to_height(Some(995), false).await.unwrap();

        assert_eq!(report.utxos_restored, 1);
        let back = store.get_utxo("old", 1).unwrap().unwrap();
        assert_eq!(back.satoshis, 50);
        assert_eq!(store.balance("t1a").unwrap(), 50);
        // created above the target, stays gone
        assert!(store.get_utxo("fresh", 0).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_truncates_address_buckets() {
        let (store, _temp) = create_test_store(2);
        store.push_address_tx("t1a", "tx1", 990).unwrap();
        store.push_address_tx("t1a", "tx2", 996).unwrap();
        store.push_address_tx("t1a", "tx3", 997).unwrap();
        store.push_address_tx("t1b", "tx4", 999).unwrap();

        let (engine, _) = engine(store.clone());
        let report = engine.restore_to_height(Some(995), false).await.unwrap();

        assert_eq!(report.buckets_truncated, 1);
        assert_eq!(report.buckets_removed, 2);
        let history = store.address_transactions("t1a").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].txid, "tx1");
        assert!(store.address_buckets("t1b").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_is_idempotent() {
        let (store, _temp) = create_test_store(10);
        store.insert_utxo(&utxo("a", 0, 900, "t1a", 5)).unwrap();
        store.insert_utxo(&utxo("b", 0, 1000, "t1a", 5)).unwrap();
        store.take_utxo("a", 0, 1000).unwrap();
        store.push_address_tx("t1a", "b", 1000).unwrap();

        let (engine, _) = engine(store.clone());
        engine.restore_to_height(Some(950), false).await.unwrap();
        let utxos_first = store.all_utxos().unwrap();
        let history_first = store.address_transactions("t1a").unwrap();

        let second = engine.restore_to_height(Some(950), false).await.unwrap();
        assert_eq!(second.utxos_removed, 0);
        assert_eq!(second.utxos_restored, 0);
        assert_eq!(store.all_utxos().unwrap(), utxos_first);
        assert_eq!(store.address_transactions("t1a").unwrap(), history_first);
    }

    #[tokio::test]
    async fn test_restore_removes_collateral_and_lookup() {
        let (store, _temp) = create_test_store(10);
        let tx = CollateralTransaction {
            txid: "node".into(),
            version: 5,
            tx_type: Some(2),
            update_type: None,
            ip: Some("1.2.3.4".into()),
            bench_tier: None,
            collateral_hash: "coll".into(),
            collateral_index: 0,
            address: Some("t1node".into()),
            locked_amount: Some(1000),
            height: 999,
        };
        store.insert_collateral_tx(&tx).unwrap();

        let (engine, _) = engine(store.clone());
        let report = engine.restore_to_height(Some(995), false).await.unwrap();
        assert_eq!(report.collateral_removed, 1);
        assert!(store.get_collateral_tx("node").unwrap().is_none());
        assert!(store.collateral_by_outpoint("coll", 0).unwrap().is_none());
        let by_address = CollateralFilter {
            address: Some("t1node".into()),
            ..Default::default()
        };
        assert!(store.collateral_transactions(&by_address).unwrap().is_empty());
        assert!(store.first_keys(CF_COLLATERAL_ADDRESS, 1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_moves_active_bucket_back() {
        let (store, _temp) = create_test_store(2);
        for height in 1..=7 {
            store.push_address_tx("t1a", &format!("tx{}", height), height).unwrap();
        }
        // [1,2] [3,4] [5,6] [7]
        assert_eq!(store.active_bucket_no("t1a").unwrap(), Some(3));

        let (engine, _) = engine(store.clone());
        let report = engine.restore_to_height(Some(3), false).await.unwrap();
        assert_eq!(report.buckets_truncated, 1);
        assert_eq!(report.buckets_removed, 2);
        assert_eq!(store.active_bucket_no("t1a").unwrap(), Some(1));

        // the truncated bucket takes the next entry, then a new one opens
        store.push_address_tx("t1a", "tx4b", 4).unwrap();
        assert_eq!(store.active_bucket_no("t1a").unwrap(), Some(1));
        store.push_address_tx("t1a", "tx5b", 5).unwrap();
        assert_eq!(store.active_bucket_no("t1a").unwrap(), Some(2));

        let buckets = store.address_buckets("t1a").unwrap();
        let layout: Vec<(u32, Vec<String>)> = buckets
            .into_iter()
            .map(|(no, b)| (no, b.transactions.into_iter().map(|e| e.txid).collect()))
            .collect();
        assert_eq!(
            layout,
            vec![
                (0, vec!["tx1".to_string(), "tx2".to_string()]),
                (1, vec!["tx3".to_string(), "tx4b".to_string()]),
                (2, vec!["tx5b".to_string()]),
            ]
        );

        // rolling back past every bucket leaves no active bucket
        engine.restore_to_height(Some(0), false).await.unwrap();
        assert_eq!(store.active_bucket_no("t1a").unwrap(), None);
        store.push_address_tx("t1a", "tx1c", 1).unwrap();
        assert_eq!(store.active_bucket_no("t1a").unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_deep_rescan_resurrects_old_spends() {
        let (store, _temp) = create_test_store(10);
        store.insert_utxo(&utxo("genesis", 0, 10, "t1a", 50)).unwrap();
        store.take_utxo("genesis", 0, 100_000).unwrap();
        store.set_scanned_height(200_000).unwrap();

        let (engine, _) = engine(store.clone());
        let report = engine.restore_to_height(Some(50), false).await.unwrap();
        assert_eq!(report.utxos_restored, 1);
        assert_eq!(store.balance("t1a").unwrap(), 50);
    }

    #[tokio::test]
    async fn test_restore_to_zero() {
        let (store, _temp) = create_test_store(10);
        store.insert_utxo(&utxo("a", 0, 1, "t1a", 5)).unwrap();
        let (engine, _) = engine(store.clone());
        engine.restore_to_height(Some(0), false).await.unwrap();
        assert!(store.all_utxos().unwrap().is_empty());
        assert_eq!(store.scanned_height().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_wipes_derived_state() {
        let (store, _temp) = create_test_store(10);
        store.insert_utxo(&utxo("a", 0, 1, "t1a", 5)).unwrap();
        store.push_address_tx("t1a", "a", 1).unwrap();
        store.set_scanned_height(1).unwrap();

        let (engine, lifecycle) = engine(store.clone());
        let removed = engine.bootstrap(true).await.unwrap();

        assert!(removed >= 4);
        assert!(store.all_utxos().unwrap().is_empty());
        assert!(store.address_buckets("t1a").unwrap().is_empty());
        assert_eq!(store.max_indexed_height().unwrap(), None);
        // the watermark is not a derived collection
        assert_eq!(store.scanned_height().unwrap(), 1);
        assert_eq!(lifecycle.calls(), vec!["drop_app_collections".to_string()]);
    }
}
