/// Settings
///
/// Layered configuration: serde defaults, then an optional TOML file, then
/// `FLUXBLOX__SECTION__KEY` environment overrides. Settings are loaded once
/// in `main` and passed down explicitly.

use config::{Config, Environment, File as ConfigFile};
use serde::Deserialize;

use crate::constants::{ADDRESS_BUCKET_CAPACITY, FUSION_ACTIVATION_HEIGHT, INSIGHT_TX_THROTTLE};
use crate::error::Result;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub daemon: DaemonSettings,
    pub db: DbSettings,
    pub sync: SyncSettings,
    pub apps: AppSettings,
    pub api: ApiSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub url: String,
    pub user: String,
    pub password: String,
    pub timeout_secs: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:16124".to_string(),
            user: String::new(),
            password: String::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbSettings {
    pub path: String,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            path: "./data/fluxblox".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Rely on the daemon's address index instead of a local UTXO table
    pub insight: bool,
    /// Below this height the chain is final and fork tips are not checked
    pub chain_valid_height: u32,
    pub deep_restore_on_start: bool,
    pub address_bucket_capacity: u32,
    pub insight_throttle_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            insight: false,
            chain_valid_height: 1_062_000,
            deep_restore_on_start: false,
            address_bucket_capacity: ADDRESS_BUCKET_CAPACITY,
            insight_throttle_ms: INSIGHT_TX_THROTTLE.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriceInterval {
    pub height: u32,
    /// Whole coins
    pub min_price: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub registration_address: String,
    pub foundation_multisig: String,
    pub epoch_start: u32,
    /// Payments to the foundation multisig count as app payments from here
    pub multisig_activation_height: u32,
    pub deterministic_nodes_start: u32,
    pub fusion_activation_height: u32,
    pub expire_period: u32,
    pub remove_period: u32,
    pub reconcile_period: u32,
    pub bench_period: u32,
    pub blocks_lasting: u32,
    pub price_intervals: Vec<PriceInterval>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            registration_address: "t1LUs6quf7TB2zVZmexqPQdnqmrFMGZGjV6".to_string(),
            foundation_multisig: "t3aGJvdtd8NR6GrnqnRuVEzH6MbrXuJFLUX".to_string(),
            epoch_start: 694_000,
            multisig_activation_height: 1_315_000,
            deterministic_nodes_start: 558_000,
            fusion_activation_height: FUSION_ACTIVATION_HEIGHT,
            expire_period: 100,
            remove_period: 11,
            reconcile_period: 720,
            bench_period: 6_480,
            blocks_lasting: 22_000,
            price_intervals: vec![
                PriceInterval { height: 0, min_price: 1.0 },
                PriceInterval { height: 983_000, min_price: 0.15 },
                PriceInterval { height: 1_004_000, min_price: 0.1 },
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub enabled: bool,
    pub bind: String,
    /// Empty token disables the admin routes
    pub admin_token: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:3030".to_string(),
            admin_token: String::new(),
        }
    }
}

impl Settings {
    /// Load settings from `path` (default `config.toml`, may be absent)
    /// and the `FLUXBLOX` environment prefix.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = path.unwrap_or("config.toml");
        let config = Config::builder()
            .add_source(ConfigFile::with_name(file).required(path.is_some()))
            .add_source(Environment::with_prefix("FLUXBLOX").separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.sync.address_bucket_capacity, 10_000);
        assert_eq!(settings.apps.fusion_activation_height, 825_000);
        assert!(!settings.sync.deep_restore_on_start);
        assert!(!settings.apps.price_intervals.is_empty());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fluxblox.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[sync]\ninsight = true\n\n[apps]\nepoch_start = 100\nprice_intervals = [{{ height = 0, min_price = 40.0 }}]"
        )
        .unwrap();

        let settings = Settings::load(path.to_str()).unwrap();
        assert!(settings.sync.insight);
        assert_eq!(settings.apps.epoch_start, 100);
        assert_eq!(settings.apps.price_intervals.len(), 1);
        assert_eq!(settings.apps.price_intervals[0].min_price, 40.0);
        // untouched sections keep their defaults
        assert_eq!(settings.daemon.timeout_secs, 30);
    }
}
