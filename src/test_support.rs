//! Shared fixtures for unit tests: a temp RocksDB store, a scripted daemon,
//! a lifecycle that records its calls, and builders for verbose blocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::apps::{AppLifecycle, StaticPriceSchedule};
use crate::config::{AppSettings, PriceInterval};
use crate::daemon::{ChainTip, DaemonRpc, ScriptPubKey, SyncStatus, TxInput, TxOutput, VerboseBlock, VerboseTx};
use crate::db_handles::DbHandles;
use crate::error::{IndexerError, Result};
use crate::guard::ProcessorGuard;
use crate::processor::TransactionProcessor;
use crate::script_utils::op_return_asm;
use crate::sender::SenderResolver;
use crate::store::IndexStore;
use crate::types::UtxoRecord;

pub const COIN_SATS: u64 = 100_000_000;
pub const REGISTRATION: &str = "t1register";
pub const FOUNDATION: &str = "t3foundation";
pub const EPOCH_START: u32 = 400_000;
pub const MULTISIG_ACTIVATION: u32 = 1_000_000;

pub fn create_test_store(capacity: u32) -> (Arc<IndexStore>, TempDir) {
    let temp = TempDir::new().unwrap();
    let handles = DbHandles::open(temp.path()).unwrap();
    (Arc::new(IndexStore::new(handles, capacity)), temp)
}

/// App settings scaled down for tests: price 40 coins from height 0
pub fn test_app_settings() -> AppSettings {
    AppSettings {
        registration_address: REGISTRATION.to_string(),
        foundation_multisig: FOUNDATION.to_string(),
        epoch_start: EPOCH_START,
        multisig_activation_height: MULTISIG_ACTIVATION,
        deterministic_nodes_start: 300,
        price_intervals: vec![PriceInterval { height: 0, min_price: 40.0 }],
        ..AppSettings::default()
    }
}

// ----------------------------------------------------------------------------
// Daemon
// ----------------------------------------------------------------------------

#[derive(Default)]
struct MockDaemonState {
    blocks: HashMap<u32, VerboseBlock>,
    raw_txs: HashMap<String, VerboseTx>,
    tips: Vec<ChainTip>,
    header_height: Option<u64>,
    confirmed_tip: Option<u64>,
    daemon_height: Option<u64>,
    fail_blocks: HashMap<u32, String>,
    fail_sync: bool,
    fail_daemon_height: bool,
}

/// Scripted daemon. The chain height is the highest block added unless
/// overridden; confirmations are derived from it.
#[derive(Default)]
pub struct MockDaemon {
    state: Mutex<MockDaemonState>,
    raw_tx_calls: AtomicUsize,
    block_calls: AtomicUsize,
}

impl MockDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&self, block: VerboseBlock) {
        self.state.lock().unwrap().blocks.insert(block.height, block);
    }

    /// Add one empty-ish block (a coinbase paying `t1miner`) per height
    pub fn add_chain(&self, from: u32, to: u32) {
        for height in from..=to {
            self.add_block(
                BlockBuilder::new(height)
                    .tx(TxBuilder::coinbase(&format!("cb{}", height)).pay("t1miner", 10).build())
                    .build(),
            );
        }
    }

    pub fn add_raw_tx(&self, tx: VerboseTx) {
        self.state.lock().unwrap().raw_txs.insert(tx.txid.clone(), tx);
    }

    pub fn set_tips(&self, tips: Vec<ChainTip>) {
        self.state.lock().unwrap().tips = tips;
    }

    /// Report headers far ahead so the daemon looks unsynced
    pub fn set_header_height(&self, headers: u64) {
        self.state.lock().unwrap().header_height = Some(headers);
    }

    pub fn fail_block(&self, height: u32, message: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_blocks
            .insert(height, message.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().fail_blocks.clear();
    }

    pub fn fail_sync_status(&self, fail: bool) {
        self.state.lock().unwrap().fail_sync = fail;
    }

    /// Height that sync status and confirmations are computed from, so
    /// blocks above it look like they arrived after the pass started
    pub fn set_confirmed_tip(&self, height: u64) {
        self.state.lock().unwrap().confirmed_tip = Some(height);
    }

    /// Height reported by `getblockcount`
    pub fn set_daemon_height(&self, height: u64) {
        self.state.lock().unwrap().daemon_height = Some(height);
    }

    pub fn fail_daemon_height(&self, fail: bool) {
        self.state.lock().unwrap().fail_daemon_height = fail;
    }

    pub fn raw_tx_calls(&self) -> usize {
        self.raw_tx_calls.load(Ordering::SeqCst)
    }

    pub fn block_calls(&self) -> usize {
        self.block_calls.load(Ordering::SeqCst)
    }

    fn highest_block(state: &MockDaemonState) -> u64 {
        state.blocks.keys().max().copied().unwrap_or(0) as u64
    }

    fn tip(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.confirmed_tip.unwrap_or_else(|| Self::highest_block(&state))
    }
}

#[async_trait]
impl DaemonRpc for MockDaemon {
    async fn get_sync_status(&self) -> Result<SyncStatus> {
        let tip = self.tip();
        let state = self.state.lock().unwrap();
        if state.fail_sync {
            return Err(IndexerError::Daemon("getblockchaininfo: connection refused".into()));
        }
        Ok(SyncStatus::from_heights(tip, state.header_height.unwrap_or(tip)))
    }

    async fn get_verbose_block(&self, height: u32) -> Result<VerboseBlock> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        let tip = self.tip();
        let state = self.state.lock().unwrap();
        if let Some(message) = state.fail_blocks.get(&height) {
            return Err(IndexerError::Daemon(message.clone()));
        }
        let mut block = state
            .blocks
            .get(&height)
            .cloned()
            .ok_or_else(|| IndexerError::Daemon(format!("getblock: block {} not found", height)))?;
        block.confirmations = tip as i64 - height as i64 + 1;
        Ok(block)
    }

    async fn get_chain_tips(&self) -> Result<Vec<ChainTip>> {
        Ok(self.state.lock().unwrap().tips.clone())
    }

    async fn get_daemon_height(&self) -> Result<u64> {
        let state = self.state.lock().unwrap();
        if state.fail_daemon_height {
            return Err(IndexerError::Daemon("getblockcount: connection refused".into()));
        }
        Ok(state.daemon_height.unwrap_or_else(|| Self::highest_block(&state)))
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<VerboseTx> {
        self.raw_tx_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .unwrap()
            .raw_txs
            .get(txid)
            .cloned()
            .ok_or_else(|| IndexerError::Daemon(format!("getrawtransaction: {} not found", txid)))
    }
}

// ----------------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------------

/// Records every lifecycle call by name
#[derive(Default)]
pub struct RecordingLifecycle {
    calls: Mutex<Vec<String>>,
    candidates: Mutex<Vec<String>>,
    app_heights: Mutex<Vec<u32>>,
}

impl RecordingLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app_heights(heights: Vec<u32>) -> Self {
        let lifecycle = Self::default();
        *lifecycle.app_heights.lock().unwrap() = heights;
        lifecycle
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == name).count()
    }

    pub fn candidate_calls(&self) -> Vec<String> {
        self.candidates.lock().unwrap().clone()
    }

    fn record(&self, name: impl Into<String>) -> Result<()> {
        self.calls.lock().unwrap().push(name.into());
        Ok(())
    }
}

#[async_trait]
impl AppLifecycle for RecordingLifecycle {
    async fn on_candidate_payment(&self, hash: &str, _txid: &str, _height: u32, _amount: u64) -> Result<()> {
        self.candidates.lock().unwrap().push(hash.to_string());
        self.record("candidate_payment")
    }

    async fn expire_applications(&self) -> Result<()> {
        self.record("expire_applications")
    }

    async fn remove_stale_instances(&self) -> Result<()> {
        self.record("remove_stale_instances")
    }

    async fn reinstall_old_applications(&self) -> Result<()> {
        self.record("reinstall_old_applications")
    }

    async fn reconcile_message_hashes(&self) -> Result<()> {
        self.record("reconcile_message_hashes")
    }

    async fn run_network_bench(&self) -> Result<()> {
        self.record("network_bench")
    }

    async fn global_app_heights(&self) -> Result<Vec<u32>> {
        Ok(self.app_heights.lock().unwrap().clone())
    }

    async fn reindex_global_apps_information(&self) -> Result<()> {
        self.record("reindex_global_apps_information")
    }

    async fn remove_app_records_above(&self, height: u32) -> Result<()> {
        self.record(format!("remove_app_records_above:{}", height))
    }

    async fn drop_app_collections(&self) -> Result<()> {
        self.record("drop_app_collections")
    }
}

// ----------------------------------------------------------------------------
// Builders
// ----------------------------------------------------------------------------

pub struct TxBuilder {
    tx: VerboseTx,
}

impl TxBuilder {
    pub fn new(txid: &str, version: i32) -> Self {
        Self {
            tx: VerboseTx {
                txid: txid.to_string(),
                version,
                ..Default::default()
            },
        }
    }

    pub fn coinbase(txid: &str) -> Self {
        let mut builder = Self::new(txid, 4);
        builder.tx.vin.push(TxInput {
            coinbase: Some("03a1b2".to_string()),
            ..Default::default()
        });
        builder
    }

    pub fn spend(mut self, txid: &str, vout: u32) -> Self {
        self.tx.vin.push(TxInput {
            txid: Some(txid.to_string()),
            vout: Some(vout),
            ..Default::default()
        });
        self
    }

    /// Input carrying the sender address, as insight daemons report it
    pub fn spend_from(mut self, txid: &str, vout: u32, address: &str) -> Self {
        self.tx.vin.push(TxInput {
            txid: Some(txid.to_string()),
            vout: Some(vout),
            address: Some(address.to_string()),
            ..Default::default()
        });
        self
    }

    pub fn pay(mut self, address: &str, sats: u64) -> Self {
        let n = self.tx.vout.len() as u32;
        self.tx.vout.push(TxOutput {
            value_sat: sats,
            n,
            script_pub_key: ScriptPubKey {
                addresses: Some(vec![address.to_string()]),
                hex: "76a914".to_string(),
                asm: "OP_DUP OP_HASH160".to_string(),
            },
        });
        self
    }

    pub fn op_return(mut self, message: &str) -> Self {
        let n = self.tx.vout.len() as u32;
        self.tx.vout.push(TxOutput {
            value_sat: 0,
            n,
            script_pub_key: ScriptPubKey {
                addresses: None,
                hex: "6a".to_string(),
                asm: op_return_asm(message),
            },
        });
        self
    }

    /// Collateral reference in `COutPoint(hash, n)` form
    pub fn collateral(mut self, outpoint: &str) -> Self {
        self.tx.collateral_output = Some(outpoint.to_string());
        self
    }

    /// Collateral reference as insight daemons report it
    pub fn collateral_ref(mut self, hash: &str, index: u32) -> Self {
        self.tx.txhash = Some(hash.to_string());
        self.tx.outidx = Some(index);
        self
    }

    pub fn build(self) -> VerboseTx {
        self.tx
    }
}

pub struct BlockBuilder {
    block: VerboseBlock,
}

impl BlockBuilder {
    pub fn new(height: u32) -> Self {
        Self {
            block: VerboseBlock {
                height,
                confirmations: 1,
                tx: Vec::new(),
            },
        }
    }

    pub fn tx(mut self, tx: VerboseTx) -> Self {
        self.block.tx.push(tx);
        self
    }

    pub fn build(self) -> VerboseBlock {
        self.block
    }
}

// ----------------------------------------------------------------------------
// Processor harness
// ----------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<IndexStore>,
    pub daemon: Arc<MockDaemon>,
    pub lifecycle: Arc<RecordingLifecycle>,
    pub guard: Arc<ProcessorGuard>,
    pub processor: TransactionProcessor,
    _temp: TempDir,
}

impl Harness {
    pub fn new(insight: bool) -> Self {
        let (store, temp) = create_test_store(10);
        let daemon = Arc::new(MockDaemon::new());
        let lifecycle = Arc::new(RecordingLifecycle::new());
        let guard = Arc::new(ProcessorGuard::new());
        let resolver = Arc::new(SenderResolver::new(store.clone(), daemon.clone(), !insight));
        let apps = test_app_settings();
        let processor = TransactionProcessor::new(
            store.clone(),
            resolver,
            Arc::new(StaticPriceSchedule::new(apps.price_intervals.clone())),
            lifecycle.clone(),
            guard.clone(),
            apps,
            Duration::ZERO,
        );
        Self {
            store,
            daemon,
            lifecycle,
            guard,
            processor,
            _temp: temp,
        }
    }

    pub fn seed_utxo(&self, txid: &str, vout: u32, address: &str, sats: u64, height: u32) {
        self.store
            .insert_utxo(&UtxoRecord {
                txid: txid.to_string(),
                vout,
                height,
                address: address.to_string(),
                satoshis: sats,
                script_pub_key: "76a914".to_string(),
                coinbase: false,
            })
            .unwrap();
    }
}
