//! Network configuration files and deployment artifacts.
//!
//! `env/<network>.json` is the system of record consumed by downstream
//! tooling. `env/latest/<chainId>-latest.json` is the ephemeral artifact the
//! deployment scripts write on every run.

use std::path::Path;

use alloy_core::primitives::{Address, B256};
use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One deployed contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractRecord {
    pub address: Address,
    #[serde(default)]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub tx_hash: Option<B256>,
}

impl ContractRecord {
    pub fn unresolved(address: Address) -> Self {
        Self {
            address,
            block_number: None,
            tx_hash: None,
        }
    }
}

/// A contract entry as found on disk: older files store a bare address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContractEntry {
    Record(ContractRecord),
    Address(Address),
}

impl ContractEntry {
    pub fn address(&self) -> Address {
        match self {
            Self::Record(record) => record.address,
            Self::Address(address) => *address,
        }
    }

    pub fn into_record(self) -> ContractRecord {
        match self {
            Self::Record(record) => record,
            Self::Address(address) => ContractRecord::unresolved(address),
        }
    }

    pub fn block_number(&self) -> Option<u64> {
        match self {
            Self::Record(record) => record.block_number,
            Self::Address(_) => None,
        }
    }

    pub fn tx_hash(&self) -> Option<B256> {
        match self {
            Self::Record(record) => record.tx_hash,
            Self::Address(_) => None,
        }
    }
}

/// Metadata about the deployment that produced a step's contracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentInfo {
    #[serde(default)]
    pub git_commit: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_block: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `network` section of a network config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSection {
    pub chain_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub centrifuge_id: Option<u64>,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub connects_to: Vec<String>,
    /// Keys this tool does not interpret, kept as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NetworkSection {
    pub fn is_testnet(&self) -> bool {
        self.environment == "testnet"
    }

    /// `network` followed by the networks it connects to, each once.
    pub fn with_peers(&self, network: &str) -> Vec<String> {
        let mut networks = vec![network.to_string()];
        for peer in &self.connects_to {
            if !networks.contains(peer) {
                networks.push(peer.clone());
            }
        }
        networks
    }
}

/// Persisted configuration of one network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub network: NetworkSection,
    #[serde(default)]
    pub contracts: IndexMap<String, ContractEntry>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub deployment_info: IndexMap<String, DeploymentInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NetworkConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Network config file {} not found", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse network config {}", path.display()))
    }

    /// Serialize with the two-space indentation the config files use.
    pub fn to_json(&self) -> Result<String> {
        let mut json =
            serde_json::to_string_pretty(self).context("Failed to serialize network config")?;
        json.push('\n');
        Ok(json)
    }
}

/// Output of one deployment script invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentArtifact {
    #[serde(default)]
    pub contracts: IndexMap<String, ContractEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_start_block: Option<u64>,
}

impl DeploymentArtifact {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Deployment artifact {} not found", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse deployment artifact {}", path.display()))
    }

    /// Contract names and addresses, in artifact order.
    pub fn addresses(&self) -> IndexMap<String, Address> {
        self.contracts
            .iter()
            .map(|(name, entry)| (name.clone(), entry.address()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
  "network": {
    "chainId": 11155111,
    "centrifugeId": 1,
    "environment": "testnet",
    "connectsTo": ["base-sepolia", "arbitrum-sepolia"],
    "safeAdmin": "0x423420Ae467df6e90291fd0252c0A8a637C1e03f"
  },
  "adapters": {
    "wormhole": { "wormholeId": "10002" }
  },
  "contracts": {
    "root": "0x7Ed48C31f2fdC40d37407cBaBf0870B2b688368f",
    "gateway": {
      "address": "0x51eA340B3fe9059B48f935D5A80e127d587B6f89",
      "blockNumber": 1000,
      "txHash": "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060"
    }
  }
}"#;

    #[test]
    fn test_parse_mixed_contract_entries() {
        let config: NetworkConfig = serde_json::from_str(CONFIG).unwrap();

        assert_eq!(config.network.chain_id, 11155111);
        assert!(config.network.is_testnet());
        assert_eq!(config.network.connects_to.len(), 2);
        assert!(matches!(config.contracts["root"], ContractEntry::Address(_)));

        let gateway = config.contracts["gateway"].clone().into_record();
        assert_eq!(gateway.block_number, Some(1000));
        assert!(gateway.tx_hash.is_some());
    }

    #[test]
    fn test_network_with_peers() {
        let mut config: NetworkConfig = serde_json::from_str(CONFIG).unwrap();
        assert_eq!(
            config.network.with_peers("sepolia"),
            vec!["sepolia", "base-sepolia", "arbitrum-sepolia"]
        );

        config.network.connects_to = vec![
            "base-sepolia".to_string(),
            "sepolia".to_string(),
            "base-sepolia".to_string(),
        ];
        assert_eq!(config.network.with_peers("sepolia"), vec!["sepolia", "base-sepolia"]);
    }

    #[test]
    fn test_unknown_keys_survive_round_trip() {
        let config: NetworkConfig = serde_json::from_str(CONFIG).unwrap();
        let json: Value = serde_json::from_str(&config.to_json().unwrap()).unwrap();

        assert_eq!(json["adapters"]["wormhole"]["wormholeId"], "10002");
        assert_eq!(
            json["network"]["safeAdmin"],
            "0x423420Ae467df6e90291fd0252c0A8a637C1e03f"
        );
        assert!(json.get("deploymentInfo").is_none());
    }

    #[test]
    fn test_artifact_addresses() {
        let artifact: DeploymentArtifact = serde_json::from_str(
            r#"{"contracts":{"hub":"0x51eA340B3fe9059B48f935D5A80e127d587B6f89","spoke":{"address":"0x7Ed48C31f2fdC40d37407cBaBf0870B2b688368f","blockNumber":7}},"deploymentStartBlock":5}"#,
        )
        .unwrap();

        let addresses = artifact.addresses();
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses.get_index(0).unwrap().0, "hub");
        assert_eq!(artifact.contracts["spoke"].block_number(), Some(7));
        assert_eq!(artifact.deployment_start_block, Some(5));
    }
}
