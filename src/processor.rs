/// Transaction Processor
///
/// Turns one verbose block into index records. Two strategies:
///
/// - **standard**: maintains the local utxo table, the coinbase fusion
///   archive and per-address transaction buckets, then detects app
///   payments, governance messages and collateral transactions.
/// - **insight**: the daemon keeps the address index, so only app payments,
///   governance messages and collateral transactions are recorded, in bulk
///   at the end of the block. Transactions are throttled to bound store load.
///
/// App payment hash collisions are expected under replay; they are logged
/// and dropped. Everything else that fails while writing surfaces to the
/// sync controller.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::apps::{dispatch, price_at, AppLifecycle, LifecycleTrigger, PriceSchedule};
use crate::config::AppSettings;
use crate::constants::{coins_to_sats, is_standard_tx_version, APP_HASH_LENGTH, COLLATERAL_TX_VERSION};
use crate::daemon::{VerboseBlock, VerboseTx};
use crate::error::Result;
use crate::guard::ProcessorGuard;
use crate::metrics;
use crate::script_utils::{decode_message, is_op_return, parse_collateral_outpoint};
use crate::sender::SenderResolver;
use crate::store::IndexStore;
use crate::telemetry::short_txid;
use crate::types::{AppPaymentCandidate, CollateralTransaction, GovernanceMessage, SenderInfo, UtxoRecord};

/// What one block produced
#[derive(Debug, Default)]
pub struct BlockReport {
    pub height: u32,
    pub utxos_created: usize,
    pub inputs_spent: usize,
    pub unresolved_inputs: usize,
    /// Hashes of candidates stored for this block
    pub app_candidates: Vec<String>,
    pub governance_messages: usize,
    pub collateral_transactions: usize,
    /// Lifecycle triggers spawned while processing
    pub triggers: Vec<JoinHandle<()>>,
}

/// Outputs of one transaction, as far as app/governance detection cares
#[derive(Debug, Default, PartialEq)]
struct OutputScan {
    app_value: u64,
    pays_foundation: bool,
    message: String,
}

pub struct TransactionProcessor {
    store: Arc<IndexStore>,
    resolver: Arc<SenderResolver>,
    prices: Arc<dyn PriceSchedule>,
    lifecycle: Arc<dyn AppLifecycle>,
    guard: Arc<ProcessorGuard>,
    apps: AppSettings,
    insight_throttle: Duration,
}

impl TransactionProcessor {
    pub fn new(
        store: Arc<IndexStore>,
        resolver: Arc<SenderResolver>,
        prices: Arc<dyn PriceSchedule>,
        lifecycle: Arc<dyn AppLifecycle>,
        guard: Arc<ProcessorGuard>,
        apps: AppSettings,
        insight_throttle: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            prices,
            lifecycle,
            guard,
            apps,
            insight_throttle,
        }
    }

    pub async fn process_block(&self, block: &VerboseBlock, index_only: bool) -> Result<BlockReport> {
        let report = if index_only {
            self.process_insight(block).await?
        } else {
            self.process_standard(block).await?
        };
        metrics::increment_blocks_indexed(if index_only { "insight" } else { "standard" });
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Standard strategy
    // ------------------------------------------------------------------------

    async fn process_standard(&self, block: &VerboseBlock) -> Result<BlockReport> {
        let height = block.height;
        let mut report = BlockReport {
            height,
            ..Default::default()
        };

        // outputs and senders for the whole block first, so spends of
        // outputs created earlier in the same block find them
        let mut senders: Vec<Vec<SenderInfo>> = Vec::with_capacity(block.tx.len());
        for tx in &block.tx {
            if is_standard_tx_version(tx.version) {
                report.utxos_created += self.index_outputs(tx, height)?;
                senders.push(self.resolve_inputs(tx, height, &mut report).await?);
            } else {
                senders.push(Vec::new());
            }
        }

        for (tx, tx_senders) in block.tx.iter().zip(senders) {
            if is_standard_tx_version(tx.version) {
                self.index_addresses(tx, &tx_senders, height)?;

                let scan = self.scan_outputs(tx, height);
                if let Some(candidate) = self.app_candidate(tx, height, &scan).await? {
                    self.store_candidate(candidate, &mut report)?;
                }

                let from_foundation = tx_senders
                    .iter()
                    .any(|s| s.address.as_deref() == Some(self.apps.foundation_multisig.as_str()));
                if from_foundation && scan.pays_foundation {
                    self.store_governance_message(tx, height, &scan.message)?;
                    report.governance_messages += 1;
                }
            } else if tx.version == COLLATERAL_TX_VERSION {
                let Some((hash, index)) = tx
                    .collateral_output
                    .as_deref()
                    .and_then(parse_collateral_outpoint)
                else {
                    warn!(txid = %short_txid(&tx.txid), height, "Collateral transaction without parsable collateral output");
                    continue;
                };
                let record = self.collateral_record(tx, height, hash, index).await;
                self.store.insert_collateral_tx(&record)?;
                report.collateral_transactions += 1;
            }
        }

        debug!(
            height,
            utxos = report.utxos_created,
            spent = report.inputs_spent,
            unresolved = report.unresolved_inputs,
            "Block indexed"
        );
        Ok(report)
    }

    /// Write a utxo for every output paying an address. Returns how many.
    fn index_outputs(&self, tx: &VerboseTx, height: u32) -> Result<usize> {
        let coinbase = tx.is_coinbase();
        let mut created = 0;
        for (index, output) in tx.vout.iter().enumerate() {
            let Some(address) = output.address() else {
                continue;
            };
            let utxo = UtxoRecord {
                txid: tx.txid.clone(),
                vout: index as u32,
                height,
                address: address.to_string(),
                satoshis: output.value_sat,
                script_pub_key: output.script_pub_key.hex.clone(),
                coinbase,
            };
            self.store.insert_utxo(&utxo)?;
            if coinbase && height > self.apps.fusion_activation_height {
                self.store.insert_fusion(&utxo)?;
            }
            created += 1;
        }
        Ok(created)
    }

    /// Consume every non-coinbase input, one at a time
    async fn resolve_inputs(
        &self,
        tx: &VerboseTx,
        height: u32,
        report: &mut BlockReport,
    ) -> Result<Vec<SenderInfo>> {
        let mut senders = Vec::new();
        for vin in tx.vin.iter().filter(|vin| vin.coinbase.is_none()) {
            let (Some(prev_txid), Some(prev_vout)) = (vin.txid.as_deref(), vin.vout) else {
                warn!(txid = %short_txid(&tx.txid), height, "Input without previous outpoint");
                report.unresolved_inputs += 1;
                senders.push(SenderInfo::unresolved());
                continue;
            };
            let sender = match self.store.take_utxo(prev_txid, prev_vout, height)? {
                Some(spent) => {
                    report.inputs_spent += 1;
                    SenderInfo::resolved(spent.address, spent.satoshis)
                }
                None => {
                    // spending it anyway, so balances are unaffected
                    debug!(txid = %short_txid(prev_txid), vout = prev_vout, "Input not in utxo table");
                    self.resolver.resolve(prev_txid, prev_vout).await
                }
            };
            if !sender.is_resolved() {
                report.unresolved_inputs += 1;
            }
            senders.push(sender);
        }
        Ok(senders)
    }

    /// Append the transaction to the history of every address it touches
    fn index_addresses(&self, tx: &VerboseTx, senders: &[SenderInfo], height: u32) -> Result<()> {
        let mut addresses: Vec<&str> = Vec::new();
        let candidates = senders
            .iter()
            .filter_map(|s| s.address.as_deref())
            .chain(tx.vout.iter().filter_map(|o| o.address()));
        for address in candidates {
            if !addresses.contains(&address) {
                addresses.push(address);
            }
        }
        for address in addresses {
            self.store.push_address_tx(address, &tx.txid, height)?;
        }
        Ok(())
    }

    fn store_candidate(&self, candidate: AppPaymentCandidate, report: &mut BlockReport) -> Result<()> {
        if let Some(existing) = self.store.app_candidate(&candidate.hash)? {
            log_duplicate_hash(&candidate, Some(&existing));
            return Ok(());
        }
        match self.store.insert_app_candidate(&candidate) {
            Ok(()) => {
                report.triggers.push(self.trigger_candidate(&candidate));
                report.app_candidates.push(candidate.hash);
                metrics::increment_app_candidates("inserted");
                Ok(())
            }
            Err(e) if e.is_duplicate_key() => {
                log_duplicate_hash(&candidate, None);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------------
    // Insight strategy
    // ------------------------------------------------------------------------

    async fn process_insight(&self, block: &VerboseBlock) -> Result<BlockReport> {
        let height = block.height;
        let mut report = BlockReport {
            height,
            ..Default::default()
        };
        let mut candidates: Vec<AppPaymentCandidate> = Vec::new();
        let mut collateral: Vec<CollateralTransaction> = Vec::new();

        for tx in &block.tx {
            if is_standard_tx_version(tx.version) {
                let scan = self.scan_outputs(tx, height);
                if let Some(candidate) = self.app_candidate(tx, height, &scan).await? {
                    let existing = match self.store.app_candidate(&candidate.hash)? {
                        Some(existing) => Some(existing),
                        None => candidates.iter().find(|c| c.hash == candidate.hash).cloned(),
                    };
                    match existing {
                        Some(existing) => log_duplicate_hash(&candidate, Some(&existing)),
                        None => candidates.push(candidate),
                    }
                }

                let from_foundation = tx
                    .vin
                    .iter()
                    .any(|vin| vin.address.as_deref() == Some(self.apps.foundation_multisig.as_str()));
                if from_foundation && scan.pays_foundation {
                    self.store_governance_message(tx, height, &scan.message)?;
                    report.governance_messages += 1;
                }
            } else if tx.version == COLLATERAL_TX_VERSION {
                let parsed = tx.collateral_output.as_deref().and_then(parse_collateral_outpoint);
                let hash = tx.txhash.clone().or_else(|| parsed.as_ref().map(|p| p.0.clone()));
                let index = tx.outidx.or_else(|| parsed.as_ref().map(|p| p.1));
                match (hash, index) {
                    (Some(hash), Some(index)) => {
                        collateral.push(self.collateral_record(tx, height, hash, index).await);
                    }
                    _ => warn!(txid = %short_txid(&tx.txid), height, "Collateral transaction without collateral reference"),
                }
            }

            self.guard.sleep(self.insight_throttle).await?;
        }

        for stored in self.store.insert_many_app_candidates(candidates) {
            report.triggers.push(self.trigger_candidate(&stored));
            report.app_candidates.push(stored.hash);
            metrics::increment_app_candidates("inserted");
        }
        report.collateral_transactions = self.store.insert_many_collateral_txs(&collateral);

        debug!(
            height,
            candidates = report.app_candidates.len(),
            collateral = report.collateral_transactions,
            "Block indexed"
        );
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Shared detection
    // ------------------------------------------------------------------------

    /// Sum app payments, note foundation receipts and decode the OP_RETURN payload.
    /// Only OP_RETURN outputs set the message; the asm of ordinary outputs never does.
    fn scan_outputs(&self, tx: &VerboseTx, height: u32) -> OutputScan {
        let multisig_counts = height >= self.apps.multisig_activation_height;
        let mut scan = OutputScan::default();
        for output in &tx.vout {
            if let Some(address) = output.address() {
                let is_foundation = address == self.apps.foundation_multisig;
                if address == self.apps.registration_address || (is_foundation && multisig_counts) {
                    scan.app_value += output.value_sat;
                }
                scan.pays_foundation |= is_foundation;
            }
            if is_op_return(&output.script_pub_key.asm) {
                scan.message = decode_message(&output.script_pub_key.asm);
            }
        }
        scan
    }

    /// Build a candidate if the payment covers the price in force at `height`
    /// and carries a 64 hex character hash
    async fn app_candidate(
        &self,
        tx: &VerboseTx,
        height: u32,
        scan: &OutputScan,
    ) -> Result<Option<AppPaymentCandidate>> {
        if scan.app_value == 0 || height < self.apps.epoch_start || !is_app_hash(&scan.message) {
            return Ok(None);
        }
        let intervals = self.prices.price_intervals().await?;
        let Some(price) = price_at(&intervals, height) else {
            warn!(height, "No app price scheduled below height");
            return Ok(None);
        };
        if scan.app_value < coins_to_sats(price.min_price) {
            metrics::increment_app_candidates("underpaid");
            debug!(txid = %short_txid(&tx.txid), value = scan.app_value, min_price = price.min_price, "App payment below price");
            return Ok(None);
        }
        Ok(Some(AppPaymentCandidate {
            txid: tx.txid.clone(),
            height,
            hash: scan.message.clone(),
            value: scan.app_value,
            message: false,
        }))
    }

    fn store_governance_message(&self, tx: &VerboseTx, height: u32, message: &str) -> Result<()> {
        let record = GovernanceMessage::new(&tx.txid, height, message);
        info!(txid = %short_txid(&tx.txid), height, msg = message, "New governance message received");
        self.store.upsert_governance_message(&record)
    }

    async fn collateral_record(
        &self,
        tx: &VerboseTx,
        height: u32,
        collateral_hash: String,
        collateral_index: u32,
    ) -> CollateralTransaction {
        let sender = self.resolver.resolve(&collateral_hash, collateral_index).await;
        CollateralTransaction {
            txid: tx.txid.clone(),
            version: tx.version,
            tx_type: tx.tx_type,
            update_type: tx.update_type,
            ip: tx.ip.clone(),
            bench_tier: tx.benchmark_tier.clone(),
            collateral_hash,
            collateral_index,
            address: sender.address,
            locked_amount: sender.satoshis,
            height,
        }
    }

    fn trigger_candidate(&self, candidate: &AppPaymentCandidate) -> JoinHandle<()> {
        dispatch(
            &self.lifecycle,
            LifecycleTrigger::CandidatePayment {
                hash: candidate.hash.clone(),
                txid: candidate.txid.clone(),
                height: candidate.height,
                amount: candidate.value,
            },
        )
    }
}

fn is_app_hash(message: &str) -> bool {
    message.len() == APP_HASH_LENGTH && message.bytes().all(|b| b.is_ascii_hexdigit())
}

fn log_duplicate_hash(candidate: &AppPaymentCandidate, existing: Option<&AppPaymentCandidate>) {
    metrics::increment_app_candidates("duplicate");
    error!(
        hash = %candidate.hash,
        height = candidate.height,
        existing_txid = existing.map(|e| e.txid.as_str()).unwrap_or("unknown"),
        "Hash already exists. Not adding"
    );
}
