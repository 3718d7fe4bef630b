/// Daemon RPC
///
/// The indexer only needs five calls from the daemon. `DaemonRpc` is the
/// seam; `JsonRpcDaemon` speaks JSON-RPC 1.0 over HTTP with basic auth.
/// Any transport failure or non-null `error` in the response is a
/// transient `IndexerError::Daemon`.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::DaemonSettings;
use crate::constants::DAEMON_SYNC_TOLERANCE;
use crate::error::{IndexerError, Result};
use crate::metrics;

/// Block as returned by `getblock <height> 2`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerboseBlock {
    pub height: u32,
    pub confirmations: i64,
    #[serde(default)]
    pub tx: Vec<VerboseTx>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerboseTx {
    pub txid: String,
    pub version: i32,
    #[serde(default)]
    pub vin: Vec<TxInput>,
    #[serde(default)]
    pub vout: Vec<TxOutput>,
    /// `COutPoint(<hash>, <index>)` on collateral transactions
    #[serde(default)]
    pub collateral_output: Option<String>,
    /// Collateral hash/index as reported by insight-enabled daemons
    #[serde(default)]
    pub txhash: Option<String>,
    #[serde(default)]
    pub outidx: Option<u32>,
    #[serde(default, rename = "type")]
    pub tx_type: Option<i64>,
    #[serde(default)]
    pub update_type: Option<i64>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub benchmark_tier: Option<String>,
}

impl VerboseTx {
    /// Coinbase transactions carry a `coinbase` field on their first input
    pub fn is_coinbase(&self) -> bool {
        self.vin.first().map_or(false, |vin| vin.coinbase.is_some())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxInput {
    #[serde(default)]
    pub coinbase: Option<String>,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
    /// Populated by insight-enabled daemons
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default, rename = "valueSat")]
    pub value_sat: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxOutput {
    #[serde(default, rename = "valueSat")]
    pub value_sat: u64,
    #[serde(default)]
    pub n: u32,
    #[serde(default, rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

impl TxOutput {
    /// First address the output pays, if the script has one
    pub fn address(&self) -> Option<&str> {
        self.script_pub_key
            .addresses
            .as_ref()
            .and_then(|a| a.first())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub addresses: Option<Vec<String>>,
    #[serde(default)]
    pub hex: String,
    #[serde(default)]
    pub asm: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub height: u32,
    #[serde(default)]
    pub branchlen: u32,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    pub height: u64,
    pub header_height: u64,
    pub synced: bool,
}

impl SyncStatus {
    /// Synced once the block height is within tolerance of the header height
    pub fn from_heights(height: u64, header_height: u64) -> Self {
        Self {
            height,
            header_height,
            synced: height + DAEMON_SYNC_TOLERANCE > header_height,
        }
    }
}

#[async_trait]
pub trait DaemonRpc: Send + Sync {
    async fn get_sync_status(&self) -> Result<SyncStatus>;

    async fn get_verbose_block(&self, height: u32) -> Result<VerboseBlock>;

    async fn get_chain_tips(&self) -> Result<Vec<ChainTip>>;

    async fn get_daemon_height(&self) -> Result<u64>;

    /// Verbose transaction, used to resolve spent outputs not indexed locally
    async fn get_raw_transaction(&self, txid: &str) -> Result<VerboseTx>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct BlockchainInfo {
    blocks: u64,
    headers: u64,
}

pub struct JsonRpcDaemon {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
}

impl JsonRpcDaemon {
    pub fn new(settings: &DaemonSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: settings.url.clone(),
            user: settings.user.clone(),
            password: settings.password.clone(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let timer = metrics::Timer::new();
        let outcome = self.send::<T>(method, params).await;
        let elapsed = timer.elapsed_secs();
        metrics::record_rpc_call_duration(method, elapsed);

        if elapsed > 5.0 {
            warn!(method, duration_secs = elapsed, "Slow RPC call");
        }
        if let Err(e) = &outcome {
            metrics::increment_rpc_errors(method);
            debug!(method, error = %e, "RPC call failed");
        }
        outcome
    }

    async fn send<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let response: RpcResponse<T> = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&json!({
                "jsonrpc": "1.0",
                "id": "fluxblox",
                "method": method,
                "params": params,
            }))
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = response.error.filter(|e| !e.is_null()) {
            return Err(IndexerError::Daemon(format!("{}: {}", method, error)));
        }
        response
            .result
            .ok_or_else(|| IndexerError::Daemon(format!("{}: empty result", method)))
    }
}

#[async_trait]
impl DaemonRpc for JsonRpcDaemon {
    async fn get_sync_status(&self) -> Result<SyncStatus> {
        let info: BlockchainInfo = self.call("getblockchaininfo", json!([])).await?;
        Ok(SyncStatus::from_heights(info.blocks, info.headers))
    }

    async fn get_verbose_block(&self, height: u32) -> Result<VerboseBlock> {
        self.call("getblock", json!([height.to_string(), 2])).await
    }

    async fn get_chain_tips(&self) -> Result<Vec<ChainTip>> {
        self.call("getchaintips", json!([])).await
    }

    async fn get_daemon_height(&self) -> Result<u64> {
        self.call("getblockcount", json!([])).await
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<VerboseTx> {
        self.call("getrawtransaction", json!([txid, 1])).await
    }
}
