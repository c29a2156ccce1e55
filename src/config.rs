//! Immutable daemon configuration, loaded once at startup from a single
//! JSON file. The core never consults process-wide state; everything it
//! needs is handed in at construction.

use crate::comm::elector::BullyConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file error: {0}")]
    File(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub mpc: MpcConfig,
    #[serde(default)]
    pub bully: BullyConfig,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MpcConfig {
    /// Listen port for peer streams.
    pub port: u16,
    /// Hex-encoded static x25519 secret; generated if absent.
    pub key_path: PathBuf,
    pub keyshare_path: PathBuf,
    pub frost_keyshare_path: PathBuf,
    pub topology_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChainConfig {
    Evm(EvmChainConfig),
    Btc(BtcChainConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvmChainConfig {
    pub id: u8,
    pub name: String,
    /// EVM chain id, bound into the batch fingerprint.
    pub chain_id: u64,
    #[serde(default = "default_transaction_max_gas")]
    pub transaction_max_gas: u64,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_block_interval")]
    pub block_interval: u64,
    #[serde(default = "default_block_confirmations")]
    pub block_confirmations: u64,
    #[serde(default = "default_block_retry_secs")]
    pub block_retry_interval_secs: u64,
    #[serde(default)]
    pub resources: Vec<EvmResourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvmResourceConfig {
    /// 32-byte resource id, hex.
    pub resource_id: String,
    pub handler: HandlerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandlerKind {
    Erc20,
    Erc721,
    PermissionlessGeneric,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BtcChainConfig {
    pub id: u8,
    pub name: String,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_btc_confirmations")]
    pub block_confirmations: u64,
    #[serde(default = "default_block_retry_secs")]
    pub block_retry_interval_secs: u64,
    #[serde(default)]
    pub resources: Vec<BtcResourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BtcResourceConfig {
    pub resource_id: String,
    /// Bridge address whose outputs count as deposits.
    pub address: String,
}

fn default_health_interval_secs() -> u64 {
    300
}

fn default_transaction_max_gas() -> u64 {
    10_000_000
}

fn default_block_interval() -> u64 {
    5
}

fn default_block_confirmations() -> u64 {
    10
}

fn default_btc_confirmations() -> u64 {
    6
}

fn default_block_retry_secs() -> u64 {
    5
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RelayerConfig, ConfigError> {
    let data = std::fs::read(path)?;
    let config: RelayerConfig = serde_json::from_slice(&data)?;
    let mut ids = std::collections::HashSet::new();
    for chain in &config.chains {
        let id = match chain {
            ChainConfig::Evm(c) => c.id,
            ChainConfig::Btc(c) => c.id,
        };
        if !ids.insert(id) {
            return Err(ConfigError::Invalid(format!("duplicate domain id {id}")));
        }
    }
    Ok(config)
}

/// Parse a hex resource id, with or without the `0x` prefix.
pub fn parse_resource_id(raw: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| ConfigError::Invalid(format!("bad resource id {raw:?}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| ConfigError::Invalid(format!("resource id {raw:?} must be 32 bytes")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "mpc": {
            "port": 9000,
            "key_path": "/var/lib/viaduct/key",
            "keyshare_path": "/var/lib/viaduct/keyshare.json",
            "frost_keyshare_path": "/var/lib/viaduct/frost.json",
            "topology_path": "/var/lib/viaduct/topology.json"
        },
        "chains": [
            {
                "type": "evm",
                "id": 2,
                "name": "sepolia",
                "chain_id": 11155111,
                "transaction_max_gas": 250000,
                "resources": [
                    {"resource_id": "0x0000000000000000000000000000000000000000000000000000000000000001", "handler": "erc20"},
                    {"resource_id": "0x0000000000000000000000000000000000000000000000000000000000000002", "handler": "permissionlessGeneric"}
                ]
            },
            {
                "type": "btc",
                "id": 3,
                "name": "testnet3",
                "resources": [
                    {"resource_id": "0x0000000000000000000000000000000000000000000000000000000000000003", "address": "tb1qln69zuhdunc9stwfh6t7adexxrcr04ppy6thgm"}
                ]
            }
        ]
    }"#;

    #[test]
    fn parses_sample_config() {
        let config: RelayerConfig = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(config.mpc.port, 9000);
        assert_eq!(config.health_interval_secs, 300);
        assert_eq!(config.chains.len(), 2);

        let ChainConfig::Evm(evm) = &config.chains[0] else { panic!("expected evm chain") };
        assert_eq!(evm.chain_id, 11_155_111);
        assert_eq!(evm.transaction_max_gas, 250_000);
        assert_eq!(evm.block_interval, 5);
        assert_eq!(evm.resources[1].handler, HandlerKind::PermissionlessGeneric);

        let ChainConfig::Btc(btc) = &config.chains[1] else { panic!("expected btc chain") };
        assert_eq!(btc.block_confirmations, 6);
    }

    #[test]
    fn resource_id_parsing() {
        let id = parse_resource_id(
            "0x0000000000000000000000000000000000000000000000000000000000000001",
        )
        .unwrap();
        assert_eq!(id[31], 1);
        assert!(parse_resource_id("0xdead").is_err());
    }

    #[test]
    fn duplicate_domain_ids_are_rejected() {
        let raw = r#"{
            "mpc": {"port": 1, "key_path": "k", "keyshare_path": "s", "frost_keyshare_path": "f", "topology_path": "t"},
            "chains": [
                {"type": "evm", "id": 2, "name": "a", "chain_id": 1},
                {"type": "evm", "id": 2, "name": "b", "chain_id": 2}
            ]
        }"#;
        let path = std::env::temp_dir().join("viaduct_config_dup.json");
        std::fs::write(&path, raw).unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Invalid(_))));
        std::fs::remove_file(path).ok();
    }
}
