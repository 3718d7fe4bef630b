use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use tracing::info;

use crate::error::{IndexerError, Result};

pub const CF_UTXO: &str = "utxo";
/// address ‖ 0x00 ‖ outpoint → ()
pub const CF_ADDRESS_UTXO: &str = "address_utxo";
/// address ‖ 0x00 ‖ outpoint → record
pub const CF_COINBASE_FUSION: &str = "coinbase_fusion";
pub const CF_ADDRESS_TX: &str = "address_tx";
pub const CF_COLLATERAL_TX: &str = "collateral_tx";
/// collateral hash ‖ 0x00 ‖ index ‖ collateral txid → ()
pub const CF_COLLATERAL_OUTPOINT: &str = "collateral_outpoint";
/// address ‖ 0x00 ‖ collateral txid → ()
pub const CF_COLLATERAL_ADDRESS: &str = "collateral_address";
pub const CF_APP_HASHES: &str = "app_hashes";
pub const CF_CHAIN_MESSAGES: &str = "chain_messages";
/// tag ‖ height ‖ primary key, for range deletes above a height
pub const CF_HEIGHT_INDEX: &str = "height_index";
pub const CF_CHAIN_STATE: &str = "chain_state";

/// Every column family the indexer needs
pub const REQUIRED_CFS: &[&str] = &[
    CF_UTXO,
    CF_ADDRESS_UTXO,
    CF_COINBASE_FUSION,
    CF_ADDRESS_TX,
    CF_COLLATERAL_TX,
    CF_COLLATERAL_OUTPOINT,
    CF_COLLATERAL_ADDRESS,
    CF_APP_HASHES,
    CF_CHAIN_MESSAGES,
    CF_HEIGHT_INDEX,
    CF_CHAIN_STATE,
];

/// Derived column families, wiped by bootstrap. `chain_state` is not one of
/// them: the watermark survives and is reset explicitly.
pub const DERIVED_CFS: &[&str] = &[
    CF_UTXO,
    CF_ADDRESS_UTXO,
    CF_COINBASE_FUSION,
    CF_ADDRESS_TX,
    CF_COLLATERAL_TX,
    CF_COLLATERAL_OUTPOINT,
    CF_COLLATERAL_ADDRESS,
    CF_APP_HASHES,
    CF_CHAIN_MESSAGES,
    CF_HEIGHT_INDEX,
];

/// Validated database handle
///
/// Opening through `DbHandles` guarantees every required column family
/// exists, so later `cf_handle` lookups only fail on programmer error.
#[derive(Clone)]
pub struct DbHandles {
    db: Arc<DB>,
}

impl DbHandles {
    /// Open (or create) the index database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors: Vec<ColumnFamilyDescriptor> = REQUIRED_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, path.as_ref(), descriptors)?;
        info!(path = %path.as_ref().display(), cfs = REQUIRED_CFS.len(), "Index database opened");
        Self::new(Arc::new(db))
    }

    /// Wrap an already opened database, validating its column families
    pub fn new(db: Arc<DB>) -> Result<Self> {
        for cf_name in REQUIRED_CFS {
            if db.cf_handle(cf_name).is_none() {
                return Err(IndexerError::Config(format!(
                    "{} column family not found",
                    cf_name
                )));
            }
        }
        Ok(Self { db })
    }

    /// Get database reference
    pub fn db(&self) -> &Arc<DB> {
        &self.db
    }
}
