/// Administrative control of the block processor
///
/// Stop, restart, reindex and rescan. Every operation that mutates derived
/// state first aborts the running processor (waiting for its pass to end),
/// then starts a freshly built one. Callers are expected to have passed a
/// `PrivilegeVerifier` check.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{IndexerError, Result};
use crate::metrics;
use crate::restore::RestoreEngine;
use crate::sync::{BlockProcessor, PassOptions, SyncContext};

/// Decides whether a caller may use the admin operations
pub trait PrivilegeVerifier: Send + Sync {
    fn verify(&self, token: Option<&str>) -> bool;
}

/// Shared-secret check. An empty configured token rejects everyone.
pub struct TokenVerifier {
    token: String,
}

impl TokenVerifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl PrivilegeVerifier for TokenVerifier {
    fn verify(&self, token: Option<&str>) -> bool {
        !self.token.is_empty() && token == Some(self.token.as_str())
    }
}

/// Result handed back to admin callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminOutcome {
    pub action: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl AdminOutcome {
    fn new(action: &'static str, message: impl Into<String>) -> Self {
        Self {
            action,
            message: message.into(),
            height: None,
        }
    }

    fn at(mut self, height: u32) -> Self {
        self.height = Some(height);
        self
    }
}

struct Running {
    processor: Arc<BlockProcessor>,
    task: JoinHandle<()>,
}

pub struct AdminService {
    ctx: SyncContext,
    running: Mutex<Option<Running>>,
}

impl AdminService {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            running: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .map_or(false, |r| !r.task.is_finished())
    }

    /// Start a fresh processor unless one is already running
    pub async fn start(&self, options: PassOptions) -> AdminOutcome {
        let mut running = self.running.lock().await;
        if running.as_ref().map_or(false, |r| !r.task.is_finished()) {
            return AdminOutcome::new("start", "Block processor already running");
        }
        let processor = Arc::new(BlockProcessor::new(&self.ctx));
        let task = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.run(options).await })
        };
        info!(?options, "Block processor started");
        *running = Some(Running { processor, task });
        AdminOutcome::new("start", "Block processor started")
    }

    /// Abort the running processor and wait until it has fully stopped
    pub async fn stop(&self) -> AdminOutcome {
        let Some(Running { processor, task }) = self.running.lock().await.take() else {
            return AdminOutcome::new("stop", "Block processor is not running");
        };
        processor.abort().await;
        if let Err(e) = task.await {
            warn!(error = %e, "Block processor task ended abnormally");
        }
        info!("Block processor stopped");
        AdminOutcome::new("stop", "Block processor stopped")
    }

    pub async fn restart(&self) -> AdminOutcome {
        self.stop().await;
        self.start(PassOptions::startup(false)).await;
        AdminOutcome::new("restart", "Block processor restarted")
    }

    /// Drop every derived record and sync again from genesis
    pub async fn reindex(&self, reindex_apps: bool) -> Result<AdminOutcome> {
        self.stop().await;
        self.ctx.store.clear_scanned_height()?;
        info!(reindex_apps, "Explorer database reindex requested");
        self.start(PassOptions {
            restore: false,
            deep_restore: false,
            reindex_apps,
        })
        .await;
        Ok(AdminOutcome::new("reindex", "Explorer database reindex initiated"))
    }

    /// Roll derived state back to `target` and sync forward from there.
    /// The target must be non-negative and below the current watermark.
    pub async fn rescan(&self, target: i64, rescan_apps: bool) -> Result<AdminOutcome> {
        let height = u32::try_from(target)
            .map_err(|_| IndexerError::InvalidRescan(format!("height {} out of range", target)))?;
        let scanned = self.ctx.store.scanned_height()?;
        if height >= scanned {
            return Err(IndexerError::InvalidRescan(format!(
                "height {} is not below scanned height {}",
                height, scanned
            )));
        }

        self.stop().await;
        let engine = RestoreEngine::new(self.ctx.store.clone(), self.ctx.lifecycle.clone());
        let restored = engine.restore_to_height(Some(height), rescan_apps).await;
        metrics::increment_restores("rescan");
        // restart even if the restore failed; setup repairs at the watermark
        self.start(PassOptions {
            restore: restored.is_err(),
            deep_restore: false,
            reindex_apps: rescan_apps,
        })
        .await;
        restored?;
        Ok(AdminOutcome::new("rescan", "Explorer database rescan initiated").at(height))
    }
}
