// Explorer API
//
// Read-only queries over the derived collections.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query},
    Extension, Json,
};

use super::helpers::{bad_request, db_read_blocking, ApiResult};
use super::types::{AddressBalance, ScannedHeight};
use super::ApiState;
use crate::store::CollateralFilter;
use crate::types::{
    AddressTxEntry, AppPaymentCandidate, CollateralTransaction, GovernanceMessage, UtxoRecord,
};

const DEPRECATED: &str = "Data unavailable. Deprecated";

pub async fn scanned_height_v1(Extension(state): Extension<Arc<ApiState>>) -> ApiResult<ScannedHeight> {
    db_read_blocking(&state.store, |store| {
        Ok(ScannedHeight {
            general_scanned_height: store.scanned_height()?,
        })
    })
    .await
}

/// Unspent outputs of an address. Not tracked in insight mode.
pub async fn utxos_v1(
    Extension(state): Extension<Arc<ApiState>>,
    AxumPath(address): AxumPath<String>,
) -> ApiResult<Vec<UtxoRecord>> {
    if state.insight {
        return Err(bad_request(DEPRECATED));
    }
    db_read_blocking(&state.store, move |store| store.utxos_for_address(&address)).await
}

pub async fn balance_v1(
    Extension(state): Extension<Arc<ApiState>>,
    AxumPath(address): AxumPath<String>,
) -> ApiResult<AddressBalance> {
    if state.insight {
        return Err(bad_request(DEPRECATED));
    }
    db_read_blocking(&state.store, move |store| {
        let balance = store.balance(&address)?;
        Ok(AddressBalance { address, balance })
    })
    .await
}

/// Address history, newest first
pub async fn transactions_v1(
    Extension(state): Extension<Arc<ApiState>>,
    AxumPath(address): AxumPath<String>,
) -> ApiResult<Vec<AddressTxEntry>> {
    db_read_blocking(&state.store, move |store| store.address_transactions(&address)).await
}

pub async fn collateral_v1(
    Extension(state): Extension<Arc<ApiState>>,
    Query(filter): Query<CollateralFilter>,
) -> ApiResult<Vec<CollateralTransaction>> {
    db_read_blocking(&state.store, move |store| store.collateral_transactions(&filter)).await
}

pub async fn fusion_v1(
    Extension(state): Extension<Arc<ApiState>>,
    AxumPath(address): AxumPath<String>,
) -> ApiResult<Vec<UtxoRecord>> {
    if state.insight {
        return Err(bad_request(DEPRECATED));
    }
    db_read_blocking(&state.store, move |store| store.fusion_for_address(&address)).await
}

pub async fn messages_v1(Extension(state): Extension<Arc<ApiState>>) -> ApiResult<Vec<GovernanceMessage>> {
    db_read_blocking(&state.store, |store| store.governance_messages()).await
}

pub async fn app_hashes_v1(
    Extension(state): Extension<Arc<ApiState>>,
) -> ApiResult<Vec<AppPaymentCandidate>> {
    db_read_blocking(&state.store, |store| store.app_candidates()).await
}
