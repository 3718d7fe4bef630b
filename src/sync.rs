/// Sync Controller
///
/// Drives the indexer. One pass looks like:
///
/// 1. **setup** (under the guard): wait for the daemon to be synced, check
///    the global apps information, then bootstrap, restore or check for a
///    reorg depending on the watermark and the requested options
/// 2. **catch-up** (under the guard): process blocks from the watermark
///    until the chain tip, advancing the watermark after every block
/// 3. **reschedule**: sleep on the guard's cancellable timer and go again
///
/// A failed catch-up is retried through setup with a restore: a deep one
/// (100 blocks, apps rescanned) for store uniqueness violations, a shallow
/// one at the watermark otherwise.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::apps::{dispatch, AppLifecycle, LifecycleTrigger, PriceSchedule};
use crate::config::{AppSettings, Settings, SyncSettings};
use crate::constants::*;
use crate::daemon::DaemonRpc;
use crate::db_handles::CF_COLLATERAL_TX;
use crate::error::{IndexerError, Result};
use crate::guard::ProcessorGuard;
use crate::metrics;
use crate::processor::TransactionProcessor;
use crate::restore::RestoreEngine;
use crate::sender::SenderResolver;
use crate::store::IndexStore;

/// What setup should do before catching up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOptions {
    /// Restore derived state at (or below) the watermark first
    pub restore: bool,
    /// Roll back `DEEP_RESTORE_DEPTH` blocks instead of restoring at the watermark
    pub deep_restore: bool,
    /// Also roll back (or on bootstrap, drop) the app collections
    pub reindex_apps: bool,
}

impl PassOptions {
    pub fn startup(deep_restore: bool) -> Self {
        Self {
            restore: true,
            deep_restore,
            reindex_apps: false,
        }
    }

    /// Setup options for the retry after a failed catch-up
    pub fn after_error(err: &IndexerError) -> Self {
        let deep = err.is_duplicate_key();
        Self {
            restore: true,
            deep_restore: deep,
            reindex_apps: deep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Try setup again after the delay
    Delay(Duration),
    Ready { from_height: u32, index_only: bool },
}

/// Next thing the loop will do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Setup(PassOptions),
    Pass { from_height: u32, index_only: bool },
}

/// Everything a block processor is built from. Cloned by the admin
/// service to build a fresh processor on restart.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<IndexStore>,
    pub daemon: Arc<dyn DaemonRpc>,
    pub prices: Arc<dyn PriceSchedule>,
    pub lifecycle: Arc<dyn AppLifecycle>,
    pub settings: Settings,
}

pub struct BlockProcessor {
    store: Arc<IndexStore>,
    daemon: Arc<dyn DaemonRpc>,
    lifecycle: Arc<dyn AppLifecycle>,
    guard: Arc<ProcessorGuard>,
    processor: TransactionProcessor,
    restore: RestoreEngine,
    sync: SyncSettings,
    apps: AppSettings,
    reinstall_period: u32,
}

impl BlockProcessor {
    pub fn new(ctx: &SyncContext) -> Self {
        let guard = Arc::new(ProcessorGuard::new());
        let sync = ctx.settings.sync.clone();
        let apps = ctx.settings.apps.clone();
        let resolver = Arc::new(SenderResolver::new(
            ctx.store.clone(),
            ctx.daemon.clone(),
            !sync.insight,
        ));
        let processor = TransactionProcessor::new(
            ctx.store.clone(),
            resolver,
            ctx.prices.clone(),
            ctx.lifecycle.clone(),
            guard.clone(),
            apps.clone(),
            Duration::from_millis(sync.insight_throttle_ms),
        );
        let reinstall_period = rand::thread_rng().gen_range(REINSTALL_PERIOD_MIN..=REINSTALL_PERIOD_MAX);
        debug!(reinstall_period, "Reinstall sweep period picked");

        Self {
            store: ctx.store.clone(),
            daemon: ctx.daemon.clone(),
            lifecycle: ctx.lifecycle.clone(),
            guard,
            processor,
            restore: RestoreEngine::new(ctx.store.clone(), ctx.lifecycle.clone()),
            sync,
            apps,
            reinstall_period,
        }
    }

    pub fn with_reinstall_period(mut self, period: u32) -> Self {
        self.reinstall_period = period.max(1);
        self
    }

    pub fn guard(&self) -> &Arc<ProcessorGuard> {
        &self.guard
    }

    /// Loop until aborted
    pub async fn run(&self, initial: PassOptions) {
        let mut step = Step::Setup(initial);
        loop {
            let next = match self.tick(step).await {
                Ok(next) => next,
                Err(e) if e.is_aborted() => break,
                Err(e) => {
                    error!(error = %e, "Block processor step failed");
                    (SETUP_ERROR_DELAY, Step::Setup(PassOptions::startup(false)))
                }
            };
            if self.guard.sleep(next.0).await.is_err() {
                break;
            }
            step = next.1;
        }
        info!("Block processor stopped");
    }

    /// Run one step and decide the next one and how long to wait for it
    pub async fn tick(&self, step: Step) -> Result<(Duration, Step)> {
        match step {
            Step::Setup(options) => match self
                .setup_pass(options)
                .instrument(info_span!("setup", restore = options.restore, deep = options.deep_restore))
                .await?
            {
                SetupOutcome::Delay(delay) => Ok((delay, Step::Setup(options))),
                SetupOutcome::Ready {
                    from_height,
                    index_only,
                } => Ok((
                    Duration::ZERO,
                    Step::Pass {
                        from_height,
                        index_only,
                    },
                )),
            },
            Step::Pass {
                from_height,
                index_only,
            } => match self
                .run_pass(from_height, index_only)
                .instrument(info_span!("pass", from_height, index_only))
                .await
            {
                Ok((delay, last_height)) => Ok((
                    delay,
                    Step::Pass {
                        from_height: last_height + 1,
                        index_only,
                    },
                )),
                Err(e) if e.is_aborted() => Err(e),
                Err(e) => {
                    let options = PassOptions::after_error(&e);
                    error!(error = %e, deep_restore = options.deep_restore, "Block processing failed, restoring");
                    Ok((Duration::ZERO, Step::Setup(options)))
                }
            },
        }
    }

    /// Cancel the reschedule timer and wait for the running pass to finish
    pub async fn abort(&self) {
        self.guard.abort().await;
    }

    // ------------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------------

    /// Decide where the next catch-up starts. RPC and store failures turn
    /// into a long delay; only `Aborted` is returned as an error.
    pub async fn setup_pass(&self, options: PassOptions) -> Result<SetupOutcome> {
        let _permit = self.guard.enter().await?;
        match self.setup(options).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_aborted() => Err(e),
            Err(e) => {
                error!(error = %e, "Block processor setup failed");
                Ok(SetupOutcome::Delay(SETUP_ERROR_DELAY))
            }
        }
    }

    async fn setup(&self, options: PassOptions) -> Result<SetupOutcome> {
        let status = self.daemon.get_sync_status().await?;
        if !status.synced {
            info!(height = status.height, headers = status.header_height, "Daemon not yet synced");
            return Ok(SetupOutcome::Delay(NOT_SYNCED_DELAY));
        }

        let mut height = self.store.scanned_height()?;

        if height >= self.apps.epoch_start {
            self.check_global_apps().await?;
        }

        if height == 0 {
            self.restore.bootstrap(options.reindex_apps).await?;
        } else if options.restore {
            let target = if options.deep_restore {
                info!(height, "Deep restoring of database...");
                height.saturating_sub(DEEP_RESTORE_DEPTH)
            } else {
                info!(height, "Restoring database...");
                height
            };
            self.restore
                .restore_to_height(Some(target), options.reindex_apps)
                .await?;
            metrics::increment_restores(if options.deep_restore { "deep" } else { "shallow" });
            info!(height = target, "Database restored OK");
            height = target;
        } else if height > self.sync.chain_valid_height {
            if let Some(target) = self.reorg_target(height).await? {
                self.restore
                    .restore_to_height(Some(target), options.reindex_apps)
                    .await?;
                metrics::increment_restores("reorg");
                info!(height = target, "Database restored OK");
                height = target;
            }
        }

        let index_only = self.sync.insight;
        let insight_start = self.apps.deterministic_nodes_start.saturating_sub(1);
        if index_only && height < insight_start {
            debug!(from = height, to = insight_start, "Insight mode skips pre-deterministic history");
            height = insight_start;
        }

        Ok(SetupOutcome::Ready {
            from_height: height + 1,
            index_only,
        })
    }

    /// Reindex global app information when the registrations on record do
    /// not span most of an app lifetime, a sign of a corrupted app list
    async fn check_global_apps(&self) -> Result<()> {
        let heights = self.lifecycle.global_app_heights().await?;
        let min_span = f64::from(self.apps.blocks_lasting) * GLOBAL_APPS_SPAN_RATIO;
        let complete = match (heights.first(), heights.last()) {
            (Some(oldest), Some(newest)) if heights.len() >= 2 => {
                f64::from(newest.saturating_sub(*oldest)) >= min_span
            }
            _ => false,
        };
        if !complete {
            warn!(apps = heights.len(), "Global apps information incomplete, reindexing");
            self.lifecycle.reindex_global_apps_information().await?;
        }
        Ok(())
    }

    /// Rollback target if the daemon reports a valid fork two blocks below
    /// the watermark. The store may trail the daemon by up to two blocks.
    async fn reorg_target(&self, height: u32) -> Result<Option<u32>> {
        let fork_height = height.saturating_sub(REORG_SAFETY_MARGIN);
        let tips = self.daemon.get_chain_tips().await?;
        let branch_len = tips
            .iter()
            .filter(|tip| tip.status == "valid-fork" && tip.height == fork_height)
            .map(|tip| tip.branchlen)
            .max()
            .unwrap_or(0);
        if branch_len == 0 {
            return Ok(None);
        }
        let depth = branch_len + REORG_SAFETY_MARGIN;
        warn!(fork_height, depth, "Potential chain reorganisation spotted, rescanning");
        Ok(Some(height.saturating_sub(depth)))
    }

    // ------------------------------------------------------------------------
    // Catch-up
    // ------------------------------------------------------------------------

    /// Process blocks from `from_height` up to the tip, plus one block
    /// beyond it if the daemon already has it. Returns the delay before the
    /// next pass and the last height processed.
    pub async fn run_pass(&self, from_height: u32, index_only: bool) -> Result<(Duration, u32)> {
        let _permit = self.guard.enter().await?;
        let last_done = from_height.saturating_sub(1);

        let status = self.daemon.get_sync_status().await?;
        if !status.synced {
            return Ok((NOT_SYNCED_DELAY, last_done));
        }
        if u64::from(from_height) > status.height {
            return Ok((CAUGHT_UP_DELAY, last_done));
        }

        let mut height = from_height;
        let mut confirmations = self.process_height(height, index_only).await?;
        while confirmations > 1 {
            if self.guard.is_aborted() {
                return Err(IndexerError::Aborted);
            }
            height += 1;
            confirmations = self.process_height(height, index_only).await?;
        }

        let daemon_height = match self.daemon.get_daemon_height().await {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "Daemon height unavailable");
                0
            }
        };
        if daemon_height > u64::from(height) {
            height += 1;
            self.process_height(height, index_only).await?;
        }

        Ok((CAUGHT_UP_DELAY, height))
    }

    /// Index one block and advance the watermark. Returns its confirmations.
    async fn process_height(&self, height: u32, index_only: bool) -> Result<i64> {
        let block = self.daemon.get_verbose_block(height).await?;
        if block.height % PROGRESS_LOG_INTERVAL == 0 {
            info!(height = block.height, "Processing explorer block height");
        }

        self.processor.process_block(&block, index_only).await?;

        if every(height, self.apps.expire_period) {
            self.log_collection_stats(index_only);
        }
        if is_new_block(block.confirmations) {
            for trigger in self.sweeps_due(block.height) {
                dispatch(&self.lifecycle, trigger);
            }
        }

        self.store.set_scanned_height(height)?;
        Ok(block.confirmations)
    }

    /// Lifecycle sweeps scheduled at `height`
    pub fn sweeps_due(&self, height: u32) -> Vec<LifecycleTrigger> {
        let mut due = Vec::new();
        let past_epoch = height >= self.apps.epoch_start;
        if past_epoch && every(height, self.apps.expire_period) {
            due.push(LifecycleTrigger::ExpireApplications);
        }
        if past_epoch && every(height, self.apps.remove_period) {
            due.push(LifecycleTrigger::RemoveStaleInstances);
        }
        if past_epoch && every(height, self.reinstall_period) {
            due.push(LifecycleTrigger::ReinstallOldApplications);
        }
        if every(height, self.apps.reconcile_period) {
            due.push(LifecycleTrigger::ReconcileMessageHashes);
        }
        if every(height, self.apps.bench_period) {
            due.push(LifecycleTrigger::NetworkBench);
        }
        due
    }

    fn log_collection_stats(&self, index_only: bool) {
        for (collection, count) in self.store.collection_stats() {
            if index_only && collection != CF_COLLATERAL_TX {
                continue;
            }
            info!(collection, count, "Collection documents");
        }
    }
}

fn every(height: u32, period: u32) -> bool {
    period != 0 && height % period == 0
}
