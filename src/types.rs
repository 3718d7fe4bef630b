/// Derived index records
///
/// Everything here is reconstructible from daemon block data. Records are
/// bincode-encoded into their column family and serialized as camelCase JSON
/// by the query API.

use serde::{Deserialize, Serialize};

/// Live unspent output. Also used for the archival coinbase fusion index,
/// which shares the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoRecord {
    pub txid: String,
    pub vout: u32,
    pub height: u32,
    pub address: String,
    pub satoshis: u64,
    pub script_pub_key: String,
    pub coinbase: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressTxEntry {
    pub txid: String,
    pub height: u32,
}

/// One page of an address's transaction history.
/// `count` always equals `transactions.len()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressTxBucket {
    pub address: String,
    pub transactions: Vec<AddressTxEntry>,
    pub count: u32,
}

impl AddressTxBucket {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            transactions: Vec::new(),
            count: 0,
        }
    }

    pub fn push(&mut self, txid: &str, height: u32) {
        self.transactions.push(AddressTxEntry {
            txid: txid.to_string(),
            height,
        });
        self.count = self.transactions.len() as u32;
    }

    /// Drop entries above `height`. Returns true if anything was removed.
    pub fn truncate_above(&mut self, height: u32) -> bool {
        let before = self.transactions.len();
        self.transactions.retain(|entry| entry.height <= height);
        self.count = self.transactions.len() as u32;
        before != self.transactions.len()
    }
}

/// Node collateral registration/update (protocol version 5)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollateralTransaction {
    pub txid: String,
    pub version: i32,
    #[serde(rename = "type")]
    pub tx_type: Option<i64>,
    pub update_type: Option<i64>,
    pub ip: Option<String>,
    pub bench_tier: Option<String>,
    pub collateral_hash: String,
    pub collateral_index: u32,
    pub address: Option<String>,
    pub locked_amount: Option<u64>,
    pub height: u32,
}

/// Payment that may reference an application specification.
/// `hash` is globally unique across all candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppPaymentCandidate {
    pub txid: String,
    pub height: u32,
    pub hash: String,
    pub value: u64,
    pub message: bool,
}

/// Foundation self-transaction carrying a protocol parameter update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceMessage {
    pub txid: String,
    pub height: u32,
    pub message: String,
    pub version: String,
}

impl GovernanceMessage {
    /// Version is the message prefix before the first underscore
    pub fn new(txid: &str, height: u32, message: &str) -> Self {
        let version = message.split('_').next().unwrap_or_default().to_string();
        Self {
            txid: txid.to_string(),
            height,
            message: message.to_string(),
            version,
        }
    }
}

/// Origin of a spent output. Both fields are `None` when the output could
/// not be found anywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub address: Option<String>,
    pub satoshis: Option<u64>,
}

impl SenderInfo {
    pub fn resolved(address: impl Into<String>, satoshis: u64) -> Self {
        Self {
            address: Some(address.into()),
            satoshis: Some(satoshis),
        }
    }

    pub fn unresolved() -> Self {
        Self::default()
    }

    pub fn is_resolved(&self) -> bool {
        self.address.is_some()
    }
}
