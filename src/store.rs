/// Index Store
///
/// Typed collections over RocksDB column families. Every derived record also
/// gets an entry in `height_index` (`tag ‖ height BE ‖ primary key`) so the
/// restore engine can find everything above a height with a range scan
/// instead of a full collection scan.
///
/// Multi-CF mutations of a single record (record + lookup entries + height
/// entry) are committed as one WriteBatch. Bulk rollbacks go through
/// `AtomicBatchWriter` in the restore module.

use std::sync::Arc;

use rocksdb::{ColumnFamily, Direction, IteratorMode, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, warn};

use crate::db_handles::*;
use crate::error::{IndexerError, Result};
use crate::metrics;
use crate::types::{
    AddressTxBucket, AddressTxEntry, AppPaymentCandidate, CollateralTransaction,
    GovernanceMessage, UtxoRecord,
};

const SCANNED_HEIGHT_KEY: &[u8] = b"scanned_height";

/// Height index tags
pub const TAG_UTXO: u8 = b'u';
pub const TAG_FUSION: u8 = b'f';
pub const TAG_COLLATERAL: u8 = b'c';
pub const TAG_APP_HASH: u8 = b'p';
pub const TAG_GOVERNANCE: u8 = b'g';
/// Address bucket touched at height
pub const TAG_ADDRESS: u8 = b'a';
/// Spent output undo entry, value holds the consumed record
pub const TAG_SPENT: u8 = b's';

pub const HEIGHT_TAGS: &[u8] = &[
    TAG_UTXO,
    TAG_FUSION,
    TAG_COLLATERAL,
    TAG_APP_HASH,
    TAG_GOVERNANCE,
    TAG_ADDRESS,
    TAG_SPENT,
];

// ----------------------------------------------------------------------------
// Key layout
// ----------------------------------------------------------------------------

pub fn outpoint_key(txid: &str, vout: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(txid.len() + 5);
    key.extend_from_slice(txid.as_bytes());
    key.push(0);
    key.extend_from_slice(&vout.to_be_bytes());
    key
}

pub fn address_utxo_key(address: &str, txid: &str, vout: u32) -> Vec<u8> {
    let mut key = address_prefix(address);
    key.extend_from_slice(&outpoint_key(txid, vout));
    key
}

/// `address ‖ 0x00`, shared prefix of an address's buckets and utxo entries
pub fn address_prefix(address: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(address.len() + 1);
    key.extend_from_slice(address.as_bytes());
    key.push(0);
    key
}

pub fn bucket_key(address: &str, bucket_no: u32) -> Vec<u8> {
    let mut key = address_prefix(address);
    key.extend_from_slice(&bucket_no.to_be_bytes());
    key
}

fn bucket_no_from_key(key: &[u8]) -> Option<u32> {
    let tail: [u8; 4] = key.get(key.len().checked_sub(4)?..)?.try_into().ok()?;
    Some(u32::from_be_bytes(tail))
}

/// Fusion records live under their owner so address queries are a prefix scan
pub fn fusion_key(address: &str, txid: &str, vout: u32) -> Vec<u8> {
    address_utxo_key(address, txid, vout)
}

pub fn collateral_outpoint_key(hash: &str, index: u32, txid: &str) -> Vec<u8> {
    let mut key = outpoint_key(hash, index);
    key.extend_from_slice(txid.as_bytes());
    key
}

/// `hash ‖ 0x00`, shared prefix of every outpoint entry for a collateral hash
fn collateral_hash_prefix(hash: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(hash.len() + 1);
    key.extend_from_slice(hash.as_bytes());
    key.push(0);
    key
}

pub fn collateral_address_key(address: &str, txid: &str) -> Vec<u8> {
    let mut key = address_prefix(address);
    key.extend_from_slice(txid.as_bytes());
    key
}

pub fn height_key(tag: u8, height: u32, pk: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(5 + pk.len());
    key.push(tag);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(pk);
    key
}

/// Decoded `height_index` entry
#[derive(Debug, Clone)]
pub struct HeightEntry {
    pub key: Vec<u8>,
    pub height: u32,
    pub pk: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeightEntry {
    fn decode(key: &[u8], value: &[u8]) -> Option<Self> {
        let height = u32::from_be_bytes(key.get(1..5)?.try_into().ok()?);
        Some(Self {
            key: key.to_vec(),
            height,
            pk: key.get(5..)?.to_vec(),
            value: value.to_vec(),
        })
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Filter for collateral transaction queries; `None` fields match anything
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CollateralFilter {
    pub ip: Option<String>,
    pub address: Option<String>,
    pub collateral_hash: Option<String>,
}

impl CollateralFilter {
    fn matches(&self, tx: &CollateralTransaction) -> bool {
        self.ip.as_ref().map_or(true, |ip| tx.ip.as_ref() == Some(ip))
            && self
                .address
                .as_ref()
                .map_or(true, |a| tx.address.as_ref() == Some(a))
            && self
                .collateral_hash
                .as_ref()
                .map_or(true, |h| &tx.collateral_hash == h)
    }
}

pub struct IndexStore {
    db: Arc<DB>,
    bucket_capacity: u32,
}

impl IndexStore {
    pub fn new(handles: DbHandles, bucket_capacity: u32) -> Self {
        Self {
            db: handles.db().clone(),
            bucket_capacity: bucket_capacity.max(1),
        }
    }

    pub fn db(&self) -> &Arc<DB> {
        &self.db
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| IndexerError::Config(format!("{} column family not found", name)))
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf_name)?, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, cf_name: &str, key: &[u8]) -> Result<bool> {
        Ok(self.db.get_pinned_cf(self.cf(cf_name)?, key)?.is_some())
    }

    /// All `(key, value)` pairs whose key starts with `prefix`
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(cf_name)?;
        let mut out = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn scan_all<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /// Up to `limit` keys from the start of a column family
    pub fn first_keys(&self, cf_name: &str, limit: usize) -> Result<Vec<Vec<u8>>> {
        let cf = self.cf(cf_name)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start).take(limit) {
            let (key, _) = item?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    // ------------------------------------------------------------------------
    // Watermark
    // ------------------------------------------------------------------------

    /// Height up to which every derived record is consistent; 0 before the first block
    pub fn scanned_height(&self) -> Result<u32> {
        let cf = self.cf(CF_CHAIN_STATE)?;
        match self.db.get_cf(cf, SCANNED_HEIGHT_KEY)? {
            Some(bytes) if bytes.len() == 4 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&bytes);
                Ok(u32::from_le_bytes(buf))
            }
            Some(bytes) => {
                warn!(len = bytes.len(), "Malformed scanned height, treating as 0");
                Ok(0)
            }
            None => Ok(0),
        }
    }

    pub fn set_scanned_height(&self, height: u32) -> Result<()> {
        let cf = self.cf(CF_CHAIN_STATE)?;
        self.db.put_cf(cf, SCANNED_HEIGHT_KEY, height.to_le_bytes())?;
        metrics::set_scanned_height(height);
        Ok(())
    }

    pub fn clear_scanned_height(&self) -> Result<()> {
        let cf = self.cf(CF_CHAIN_STATE)?;
        self.db.delete_cf(cf, SCANNED_HEIGHT_KEY)?;
        metrics::set_scanned_height(0);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Unspent outputs
    // ------------------------------------------------------------------------

    /// Insert a live output. An existing output with the same
    /// (txid, vout) is a `DuplicateKey` error.
    pub fn insert_utxo(&self, utxo: &UtxoRecord) -> Result<()> {
        let key = outpoint_key(&utxo.txid, utxo.vout);
        if self.exists(CF_UTXO, &key)? {
            return Err(IndexerError::DuplicateKey {
                collection: CF_UTXO,
                key: format!("{}:{}", utxo.txid, utxo.vout),
            });
        }
        let mut batch = WriteBatch::default();
        self.stage_utxo(&mut batch, utxo, &key)?;
        self.db.write(batch)?;
        Ok(())
    }

    pub(crate) fn stage_utxo(
        &self,
        batch: &mut WriteBatch,
        utxo: &UtxoRecord,
        key: &[u8],
    ) -> Result<()> {
        batch.put_cf(self.cf(CF_UTXO)?, key, encode(utxo)?);
        batch.put_cf(
            self.cf(CF_ADDRESS_UTXO)?,
            address_utxo_key(&utxo.address, &utxo.txid, utxo.vout),
            b"",
        );
        batch.put_cf(
            self.cf(CF_HEIGHT_INDEX)?,
            height_key(TAG_UTXO, utxo.height, key),
            b"",
        );
        Ok(())
    }

    pub(crate) fn unstage_utxo(
        &self,
        batch: &mut WriteBatch,
        utxo: &UtxoRecord,
        key: &[u8],
    ) -> Result<()> {
        batch.delete_cf(self.cf(CF_UTXO)?, key);
        batch.delete_cf(
            self.cf(CF_ADDRESS_UTXO)?,
            address_utxo_key(&utxo.address, &utxo.txid, utxo.vout),
        );
        batch.delete_cf(self.cf(CF_HEIGHT_INDEX)?, height_key(TAG_UTXO, utxo.height, key));
        Ok(())
    }

    pub fn get_utxo(&self, txid: &str, vout: u32) -> Result<Option<UtxoRecord>> {
        self.get(CF_UTXO, &outpoint_key(txid, vout))
    }

    pub(crate) fn utxo_by_key(&self, key: &[u8]) -> Result<Option<UtxoRecord>> {
        self.get(CF_UTXO, key)
    }

    /// Atomically read and remove a live output spent at `spent_height`.
    ///
    /// Leaves an undo entry so a restore below `spent_height` brings the
    /// output back. Undo entries are kept for the whole spend history, not
    /// just a reorg horizon: admin rescans may target any height below the
    /// watermark, and pruning would leave such a rescan short of outputs.
    /// The cost is one encoded record per spend in `height_index`.
    pub fn take_utxo(&self, txid: &str, vout: u32, spent_height: u32) -> Result<Option<UtxoRecord>> {
        let key = outpoint_key(txid, vout);
        let Some(utxo) = self.get::<UtxoRecord>(CF_UTXO, &key)? else {
            return Ok(None);
        };
        let mut batch = WriteBatch::default();
        self.unstage_utxo(&mut batch, &utxo, &key)?;
        batch.put_cf(
            self.cf(CF_HEIGHT_INDEX)?,
            height_key(TAG_SPENT, spent_height, &key),
            encode(&utxo)?,
        );
        self.db.write(batch)?;
        Ok(Some(utxo))
    }

    pub fn utxos_for_address(&self, address: &str) -> Result<Vec<UtxoRecord>> {
        let prefix = address_prefix(address);
        let mut out = Vec::new();
        for (key, _) in self.scan_prefix(CF_ADDRESS_UTXO, &prefix)? {
            let outpoint = &key[prefix.len()..];
            match self.get::<UtxoRecord>(CF_UTXO, outpoint)? {
                Some(utxo) => out.push(utxo),
                None => warn!(address, "Dangling address utxo entry"),
            }
        }
        Ok(out)
    }

    pub fn balance(&self, address: &str) -> Result<u64> {
        Ok(self
            .utxos_for_address(address)?
            .iter()
            .map(|u| u.satoshis)
            .sum())
    }

    pub fn all_utxos(&self) -> Result<Vec<UtxoRecord>> {
        self.scan_all(CF_UTXO)
    }

    // ------------------------------------------------------------------------
    // Coinbase fusion (archival, never removed by spends)
    // ------------------------------------------------------------------------

    pub fn insert_fusion(&self, record: &UtxoRecord) -> Result<()> {
        let key = fusion_key(&record.address, &record.txid, record.vout);
        if self.exists(CF_COINBASE_FUSION, &key)? {
            return Err(IndexerError::DuplicateKey {
                collection: CF_COINBASE_FUSION,
                key: format!("{}:{}", record.txid, record.vout),
            });
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_COINBASE_FUSION)?, &key, encode(record)?);
        batch.put_cf(
            self.cf(CF_HEIGHT_INDEX)?,
            height_key(TAG_FUSION, record.height, &key),
            b"",
        );
        self.db.write(batch)?;
        Ok(())
    }

    pub fn fusion_for_address(&self, address: &str) -> Result<Vec<UtxoRecord>> {
        self.scan_prefix(CF_COINBASE_FUSION, &address_prefix(address))?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Address transaction buckets
    // ------------------------------------------------------------------------

    /// All buckets of an address, ordered by bucket number
    pub fn address_buckets(&self, address: &str) -> Result<Vec<(u32, AddressTxBucket)>> {
        let prefix = address_prefix(address);
        let mut out = Vec::new();
        for (key, value) in self.scan_prefix(CF_ADDRESS_TX, &prefix)? {
            // bucket keys are exactly prefix + bucket number
            if key.len() != prefix.len() + 4 {
                continue;
            }
            if let Some(no) = bucket_no_from_key(&key) {
                out.push((no, decode(&value)?));
            }
        }
        Ok(out)
    }

    /// Number of the highest bucket of an address, found with one reverse
    /// seek. Buckets fill in order, so every lower bucket is full.
    pub fn active_bucket_no(&self, address: &str) -> Result<Option<u32>> {
        let prefix = address_prefix(address);
        let last = bucket_key(address, u32::MAX);
        let cf = self.cf(CF_ADDRESS_TX)?;
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&last, Direction::Reverse))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            if key.len() == prefix.len() + 4 {
                return Ok(bucket_no_from_key(&key));
            }
        }
        Ok(None)
    }

    /// Append `(txid, height)` to the active bucket, opening the next one
    /// when it is full. Only the active bucket is read.
    pub fn push_address_tx(&self, address: &str, txid: &str, height: u32) -> Result<()> {
        let (bucket_no, mut bucket) = match self.active_bucket_no(address)? {
            Some(no) => match self.get_bucket(&bucket_key(address, no))? {
                Some(bucket) if bucket.count < self.bucket_capacity => (no, bucket),
                _ => (no + 1, AddressTxBucket::new(address)),
            },
            None => (0, AddressTxBucket::new(address)),
        };
        bucket.push(txid, height);

        let key = bucket_key(address, bucket_no);
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_ADDRESS_TX)?, &key, encode(&bucket)?);
        batch.put_cf(
            self.cf(CF_HEIGHT_INDEX)?,
            height_key(TAG_ADDRESS, height, &key),
            b"",
        );
        self.db.write(batch)?;
        Ok(())
    }

    /// Address history, newest first
    pub fn address_transactions(&self, address: &str) -> Result<Vec<AddressTxEntry>> {
        let mut entries: Vec<AddressTxEntry> = self
            .address_buckets(address)?
            .into_iter()
            .flat_map(|(_, b)| b.transactions)
            .collect();
        entries.sort_by(|a, b| b.height.cmp(&a.height));
        Ok(entries)
    }

    pub(crate) fn get_bucket(&self, key: &[u8]) -> Result<Option<AddressTxBucket>> {
        self.get(CF_ADDRESS_TX, key)
    }

    // ------------------------------------------------------------------------
    // Collateral transactions
    // ------------------------------------------------------------------------

    pub fn insert_collateral_tx(&self, tx: &CollateralTransaction) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_COLLATERAL_TX)?, tx.txid.as_bytes(), encode(tx)?);
        batch.put_cf(
            self.cf(CF_COLLATERAL_OUTPOINT)?,
            collateral_outpoint_key(&tx.collateral_hash, tx.collateral_index, &tx.txid),
            b"",
        );
        if let Some(address) = &tx.address {
            batch.put_cf(
                self.cf(CF_COLLATERAL_ADDRESS)?,
                collateral_address_key(address, &tx.txid),
                b"",
            );
        }
        batch.put_cf(
            self.cf(CF_HEIGHT_INDEX)?,
            height_key(TAG_COLLATERAL, tx.height, tx.txid.as_bytes()),
            b"",
        );
        self.db.write(batch)?;
        Ok(())
    }

    /// Best-effort bulk insert; failures are logged and skipped.
    /// Returns the number of records written.
    pub fn insert_many_collateral_txs(&self, txs: &[CollateralTransaction]) -> usize {
        let mut written = 0;
        for tx in txs {
            match self.insert_collateral_tx(tx) {
                Ok(()) => written += 1,
                Err(e) => {
                    error!(txid = %tx.txid, error = %e, "Collateral transaction insert failed");
                    metrics::increment_insert_failures(CF_COLLATERAL_TX);
                }
            }
        }
        written
    }

    pub fn get_collateral_tx(&self, txid: &str) -> Result<Option<CollateralTransaction>> {
        self.get(CF_COLLATERAL_TX, txid.as_bytes())
    }

    /// Any collateral transaction referencing the outpoint `(hash, index)`
    pub fn collateral_by_outpoint(
        &self,
        hash: &str,
        index: u32,
    ) -> Result<Option<CollateralTransaction>> {
        let prefix = outpoint_key(hash, index);
        for (key, _) in self.scan_prefix(CF_COLLATERAL_OUTPOINT, &prefix)? {
            let txid = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            if let Some(tx) = self.get_collateral_tx(&txid)? {
                return Ok(Some(tx));
            }
        }
        Ok(None)
    }

    /// Collateral transactions matching `filter`. An address or collateral
    /// hash narrows the read to that prefix of its lookup column family;
    /// only ip-only and unfiltered queries walk the whole collection.
    pub fn collateral_transactions(
        &self,
        filter: &CollateralFilter,
    ) -> Result<Vec<CollateralTransaction>> {
        let candidates = if let Some(address) = &filter.address {
            let prefix = address_prefix(address);
            self.collateral_by_lookup(CF_COLLATERAL_ADDRESS, &prefix, prefix.len())?
        } else if let Some(hash) = &filter.collateral_hash {
            let prefix = collateral_hash_prefix(hash);
            // hash ‖ 0x00 ‖ index (4) ‖ txid
            self.collateral_by_lookup(CF_COLLATERAL_OUTPOINT, &prefix, prefix.len() + 4)?
        } else {
            self.scan_all::<CollateralTransaction>(CF_COLLATERAL_TX)?
        };
        Ok(candidates
            .into_iter()
            .filter(|tx| filter.matches(tx))
            .collect())
    }

    /// Resolve lookup entries under `prefix` whose key ends with a txid
    /// starting at `txid_offset`
    fn collateral_by_lookup(
        &self,
        cf_name: &str,
        prefix: &[u8],
        txid_offset: usize,
    ) -> Result<Vec<CollateralTransaction>> {
        let mut out = Vec::new();
        for (key, _) in self.scan_prefix(cf_name, prefix)? {
            let Some(txid) = key.get(txid_offset..) else {
                continue;
            };
            let txid = String::from_utf8_lossy(txid).into_owned();
            match self.get_collateral_tx(&txid)? {
                Some(tx) => out.push(tx),
                None => warn!(txid = %txid, "Dangling collateral lookup entry"),
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------------
    // Application payment candidates
    // ------------------------------------------------------------------------

    pub fn app_candidate(&self, hash: &str) -> Result<Option<AppPaymentCandidate>> {
        self.get(CF_APP_HASHES, hash.as_bytes())
    }

    /// Insert a candidate; the hash must not already be known.
    pub fn insert_app_candidate(&self, candidate: &AppPaymentCandidate) -> Result<()> {
        if self.exists(CF_APP_HASHES, candidate.hash.as_bytes())? {
            return Err(IndexerError::DuplicateKey {
                collection: CF_APP_HASHES,
                key: candidate.hash.clone(),
            });
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_APP_HASHES)?,
            candidate.hash.as_bytes(),
            encode(candidate)?,
        );
        batch.put_cf(
            self.cf(CF_HEIGHT_INDEX)?,
            height_key(TAG_APP_HASH, candidate.height, candidate.hash.as_bytes()),
            b"",
        );
        self.db.write(batch)?;
        Ok(())
    }

    /// Best-effort bulk insert. Returns the candidates actually stored;
    /// duplicates and write failures are logged and skipped.
    pub fn insert_many_app_candidates(
        &self,
        candidates: Vec<AppPaymentCandidate>,
    ) -> Vec<AppPaymentCandidate> {
        let mut stored = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self.insert_app_candidate(&candidate) {
                Ok(()) => stored.push(candidate),
                Err(e) => {
                    error!(hash = %candidate.hash, height = candidate.height, error = %e, "App hash not added");
                    metrics::increment_insert_failures(CF_APP_HASHES);
                }
            }
        }
        stored
    }

    pub fn app_candidates(&self) -> Result<Vec<AppPaymentCandidate>> {
        self.scan_all(CF_APP_HASHES)
    }

    /// Verify that every stored candidate sits under its own hash, the
    /// uniqueness guarantee lookups rely on. Records written under another
    /// key by older layouts make this fail.
    pub fn ensure_unique_hash_index(&self) -> Result<()> {
        let cf = self.cf(CF_APP_HASHES)?;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let candidate: AppPaymentCandidate = decode(&value)?;
            if candidate.hash.as_bytes() != &*key {
                return Err(IndexerError::DuplicateKey {
                    collection: CF_APP_HASHES,
                    key: candidate.hash,
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Governance messages
    // ------------------------------------------------------------------------

    /// Upsert keyed by txid
    pub fn upsert_governance_message(&self, message: &GovernanceMessage) -> Result<()> {
        let mut batch = WriteBatch::default();
        if let Some(existing) = self.get::<GovernanceMessage>(CF_CHAIN_MESSAGES, message.txid.as_bytes())? {
            if existing.height != message.height {
                batch.delete_cf(
                    self.cf(CF_HEIGHT_INDEX)?,
                    height_key(TAG_GOVERNANCE, existing.height, existing.txid.as_bytes()),
                );
            }
        }
        batch.put_cf(
            self.cf(CF_CHAIN_MESSAGES)?,
            message.txid.as_bytes(),
            encode(message)?,
        );
        batch.put_cf(
            self.cf(CF_HEIGHT_INDEX)?,
            height_key(TAG_GOVERNANCE, message.height, message.txid.as_bytes()),
            b"",
        );
        self.db.write(batch)?;
        Ok(())
    }

    pub fn governance_messages(&self) -> Result<Vec<GovernanceMessage>> {
        self.scan_all(CF_CHAIN_MESSAGES)
    }

    // ------------------------------------------------------------------------
    // Height index
    // ------------------------------------------------------------------------

    /// Height index entries with `tag` and a height strictly above `height`
    pub fn height_entries_above(&self, tag: u8, height: u32) -> Result<Vec<HeightEntry>> {
        let Some(from) = height.checked_add(1) else {
            return Ok(Vec::new());
        };
        let start = height_key(tag, from, &[]);
        let cf = self.cf(CF_HEIGHT_INDEX)?;
        let mut out = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            if key.first() != Some(&tag) {
                break;
            }
            match HeightEntry::decode(&key, &value) {
                Some(entry) => out.push(entry),
                None => warn!(tag = %(tag as char), "Malformed height index entry"),
            }
        }
        Ok(out)
    }

    /// Highest height referenced by any derived record, if any
    pub fn max_indexed_height(&self) -> Result<Option<u32>> {
        let cf = self.cf(CF_HEIGHT_INDEX)?;
        let mut max = None;
        for tag in HEIGHT_TAGS {
            let upper = height_key(*tag, u32::MAX, &[0xff; 64]);
            let mut iter = self
                .db
                .iterator_cf(cf, IteratorMode::From(&upper, Direction::Reverse));
            if let Some(item) = iter.next() {
                let (key, value) = item?;
                if key.first() == Some(tag) {
                    if let Some(entry) = HeightEntry::decode(&key, &value) {
                        max = max.max(Some(entry.height));
                    }
                }
            }
        }
        Ok(max)
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Estimated record count per derived column family
    pub fn collection_stats(&self) -> Vec<(&'static str, u64)> {
        DERIVED_CFS
            .iter()
            .filter_map(|name| {
                let cf = self.db.cf_handle(name)?;
                let count = self
                    .db
                    .property_int_value_cf(cf, "rocksdb.estimate-num-keys")
                    .ok()
                    .flatten()
                    .unwrap_or(0);
                Some((*name, count))
            })
            .collect()
    }
}
