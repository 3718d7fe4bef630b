/// Application collaborators
///
/// The indexer detects application payments and drives periodic sweeps, but
/// application lifecycle and price governance live elsewhere. These traits
/// are the calls it makes into them.
///
/// Lifecycle triggers are fire-and-forget: `dispatch` spawns them on the
/// runtime so block indexing never waits on an app sweep. Failures are
/// logged and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::PriceInterval;
use crate::error::Result;
use crate::telemetry::short_txid;

#[async_trait]
pub trait PriceSchedule: Send + Sync {
    /// Price intervals ascending by activation height
    async fn price_intervals(&self) -> Result<Vec<PriceInterval>>;
}

/// Most recent interval activated strictly below `height`
pub fn price_at(intervals: &[PriceInterval], height: u32) -> Option<&PriceInterval> {
    intervals.iter().filter(|i| i.height < height).last()
}

/// Price schedule fixed at startup from settings
pub struct StaticPriceSchedule {
    intervals: Vec<PriceInterval>,
}

impl StaticPriceSchedule {
    pub fn new(mut intervals: Vec<PriceInterval>) -> Self {
        intervals.sort_by_key(|i| i.height);
        Self { intervals }
    }
}

#[async_trait]
impl PriceSchedule for StaticPriceSchedule {
    async fn price_intervals(&self) -> Result<Vec<PriceInterval>> {
        Ok(self.intervals.clone())
    }
}

#[async_trait]
pub trait AppLifecycle: Send + Sync {
    /// A payment that may reference an application specification was stored
    async fn on_candidate_payment(&self, hash: &str, txid: &str, height: u32, amount: u64) -> Result<()>;

    async fn expire_applications(&self) -> Result<()>;

    async fn remove_stale_instances(&self) -> Result<()>;

    async fn reinstall_old_applications(&self) -> Result<()>;

    async fn reconcile_message_hashes(&self) -> Result<()>;

    /// External network reachability benchmark
    async fn run_network_bench(&self) -> Result<()>;

    /// Registration heights of all global apps, oldest first
    async fn global_app_heights(&self) -> Result<Vec<u32>>;

    async fn reindex_global_apps_information(&self) -> Result<()>;

    /// Drop app messages and app information above `height`
    async fn remove_app_records_above(&self, height: u32) -> Result<()>;

    /// Drop app messages, information and locations entirely
    async fn drop_app_collections(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleTrigger {
    CandidatePayment {
        hash: String,
        txid: String,
        height: u32,
        amount: u64,
    },
    ExpireApplications,
    RemoveStaleInstances,
    ReinstallOldApplications,
    ReconcileMessageHashes,
    NetworkBench,
}

impl LifecycleTrigger {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleTrigger::CandidatePayment { .. } => "candidate_payment",
            LifecycleTrigger::ExpireApplications => "expire_applications",
            LifecycleTrigger::RemoveStaleInstances => "remove_stale_instances",
            LifecycleTrigger::ReinstallOldApplications => "reinstall_old_applications",
            LifecycleTrigger::ReconcileMessageHashes => "reconcile_message_hashes",
            LifecycleTrigger::NetworkBench => "network_bench",
        }
    }
}

/// Spawn a lifecycle trigger without waiting for it
pub fn dispatch(lifecycle: &Arc<dyn AppLifecycle>, trigger: LifecycleTrigger) -> JoinHandle<()> {
    let lifecycle = lifecycle.clone();
    tokio::spawn(async move {
        let name = trigger.name();
        let result = match trigger {
            LifecycleTrigger::CandidatePayment {
                hash,
                txid,
                height,
                amount,
            } => lifecycle.on_candidate_payment(&hash, &txid, height, amount).await,
            LifecycleTrigger::ExpireApplications => lifecycle.expire_applications().await,
            LifecycleTrigger::RemoveStaleInstances => lifecycle.remove_stale_instances().await,
            LifecycleTrigger::ReinstallOldApplications => {
                lifecycle.reinstall_old_applications().await
            }
            LifecycleTrigger::ReconcileMessageHashes => lifecycle.reconcile_message_hashes().await,
            LifecycleTrigger::NetworkBench => lifecycle.run_network_bench().await,
        };
        if let Err(e) = result {
            error!(trigger = name, error = %e, "App lifecycle trigger failed");
        }
    })
}

/// Lifecycle used when no application manager is attached; logs every call
#[derive(Debug, Default)]
pub struct LoggingLifecycle;

#[async_trait]
impl AppLifecycle for LoggingLifecycle {
    async fn on_candidate_payment(&self, hash: &str, txid: &str, height: u32, amount: u64) -> Result<()> {
        info!(hash, txid = %short_txid(txid), height, amount, "App payment candidate");
        Ok(())
    }

    async fn expire_applications(&self) -> Result<()> {
        info!("Expire applications sweep");
        Ok(())
    }

    async fn remove_stale_instances(&self) -> Result<()> {
        info!("Stale instance sweep");
        Ok(())
    }

    async fn reinstall_old_applications(&self) -> Result<()> {
        info!("Reinstall sweep");
        Ok(())
    }

    async fn reconcile_message_hashes(&self) -> Result<()> {
        info!("Validation of app messages hash collection");
        Ok(())
    }

    async fn run_network_bench(&self) -> Result<()> {
        info!("Network benchmark");
        Ok(())
    }

    async fn global_app_heights(&self) -> Result<Vec<u32>> {
        Ok(Vec::new())
    }

    async fn reindex_global_apps_information(&self) -> Result<()> {
        info!("Reindex global apps information");
        Ok(())
    }

    async fn remove_app_records_above(&self, height: u32) -> Result<()> {
        info!(height, "Remove app records above height");
        Ok(())
    }

    async fn drop_app_collections(&self) -> Result<()> {
        info!("Drop app collections");
        Ok(())
    }
}
