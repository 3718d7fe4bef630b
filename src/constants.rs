/// Indexing Constants
///
/// Fixed protocol heights, cadences and capacities used by the sync pipeline.
/// Values that differ between networks live in `Settings`; the ones here are
/// part of the indexing rules themselves.

use std::time::Duration;

/// Maximum entries held by one address transaction bucket
pub const ADDRESS_BUCKET_CAPACITY: u32 = 10_000;

/// Coinbase outputs above this height are mirrored into the fusion index.
/// 825000 is the snapshot block, 825001 the first block eligible for
/// rewards on auxiliary chains.
pub const FUSION_ACTIVATION_HEIGHT: u32 = 825_000;

/// Blocks rolled back by a deep restore
pub const DEEP_RESTORE_DEPTH: u32 = 100;

/// Extra blocks rolled back beyond a detected fork's branch length
pub const REORG_SAFETY_MARGIN: u32 = 2;

/// Capacity of the sender resolver cache
pub const SENDER_CACHE_CAPACITY: usize = 20_000;

/// Delay between transactions in insight mode
pub const INSIGHT_TX_THROTTLE: Duration = Duration::from_millis(75);

/// Retry delay when the daemon is still syncing
pub const NOT_SYNCED_DELAY: Duration = Duration::from_secs(2 * 60);

/// Retry delay after a daemon RPC failure during setup
pub const SETUP_ERROR_DELAY: Duration = Duration::from_secs(15 * 60);

/// Reschedule delay once the chain tip has been reached
pub const CAUGHT_UP_DELAY: Duration = Duration::from_secs(5);

/// Daemon counts as synced when its block height is within this many
/// blocks of its header height
pub const DAEMON_SYNC_TOLERANCE: u64 = 5;

/// Progress log interval during catch-up
pub const PROGRESS_LOG_INTERVAL: u32 = 50;

/// Collateral transactions carry this protocol version
pub const COLLATERAL_TX_VERSION: i32 = 5;

/// Application payment messages are exactly this many hex characters
pub const APP_HASH_LENGTH: usize = 64;

/// Satoshis per coin
pub const COIN: u64 = 100_000_000;

/// Reinstall sweep period bounds (inclusive), picked once per process
pub const REINSTALL_PERIOD_MIN: u32 = 4;
pub const REINSTALL_PERIOD_MAX: u32 = 9;

/// Fraction of `blocks_lasting` the global app registrations must span
/// before the app information is considered complete
pub const GLOBAL_APPS_SPAN_RATIO: f64 = 0.9;

/// Standard transactions (UTXO-bearing) have a protocol version in (0, 5)
#[inline]
pub fn is_standard_tx_version(version: i32) -> bool {
    version > 0 && version < COLLATERAL_TX_VERSION
}

/// A block is "new" (at or next to the tip) when it has fewer than
/// two confirmations. Periodic sweeps only run for new blocks.
#[inline]
pub fn is_new_block(confirmations: i64) -> bool {
    confirmations < 2
}

/// Convert whole coins (as scheduled by price intervals) into satoshis
#[inline]
pub fn coins_to_sats(coins: f64) -> u64 {
    (coins * COIN as f64).round() as u64
}
