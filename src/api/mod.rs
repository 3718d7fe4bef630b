// API Module
//
// HTTP surface of the indexer. Read queries live in `explorer`, privileged
// processor control in `admin`. Shared state is passed as an `Extension`.

pub mod admin;
pub mod explorer;
pub mod helpers;
pub mod types;

pub use helpers::*;
pub use types::*;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::admin::{AdminService, PrivilegeVerifier};
use crate::store::IndexStore;

pub struct ApiState {
    pub store: Arc<IndexStore>,
    pub admin: Arc<AdminService>,
    pub verifier: Arc<dyn PrivilegeVerifier>,
    /// utxo and fusion collections are not maintained in insight mode
    pub insight: bool,
}

pub async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/scannedheight", get(explorer::scanned_height_v1))
        .route("/api/v1/utxos/{address}", get(explorer::utxos_v1))
        .route("/api/v1/balance/{address}", get(explorer::balance_v1))
        .route("/api/v1/transactions/{address}", get(explorer::transactions_v1))
        .route("/api/v1/collateral", get(explorer::collateral_v1))
        .route("/api/v1/fusion/{address}", get(explorer::fusion_v1))
        .route("/api/v1/messages", get(explorer::messages_v1))
        .route("/api/v1/apphashes", get(explorer::app_hashes_v1))
        .route("/api/v1/admin/stop", post(admin::stop_v1))
        .route("/api/v1/admin/restart", post(admin::restart_v1))
        .route("/api/v1/admin/reindex", post(admin::reindex_v1))
        .route("/api/v1/admin/rescan/{height}", post(admin::rescan_v1))
        .route("/metrics", get(metrics_handler))
        .layer(Extension(state))
        .layer(cors)
}
