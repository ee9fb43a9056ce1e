//! Broadcast logs written by `forge script`.
//!
//! Forge records every submitted transaction under
//! `broadcast/<Script>.s.sol/<chainId>/run-*.json`. These logs are the only
//! place that correlates a deployed address with the transaction and block
//! that created it. They enrich contract records but are never authoritative
//! on their own.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::SystemTime,
};

use alloy_core::primitives::{Address, B256};
use anyhow::{Context, Result};
use derive_more::Deref;
use serde::{Deserialize, Deserializer};

use crate::rpc;

/// Name of the log forge rewrites on every run.
pub const LATEST_RUN_FILE: &str = "run-latest.json";

/// Directory holding the broadcast logs of `script` on `chain_id`.
pub fn broadcast_dir(root: &Path, script: &str, chain_id: u64) -> PathBuf {
    root.join(format!("{}.s.sol", script))
        .join(chain_id.to_string())
}

/// Path of the most recent broadcast log of `script` on `chain_id`.
pub fn latest_run(root: &Path, script: &str, chain_id: u64) -> PathBuf {
    broadcast_dir(root, script, chain_id).join(LATEST_RUN_FILE)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunFile {
    #[serde(default)]
    transactions: Vec<TransactionEntry>,
    #[serde(default)]
    receipts: Vec<ReceiptEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionEntry {
    #[serde(default)]
    hash: Option<B256>,
    #[serde(default)]
    transaction_type: Option<String>,
    #[serde(default)]
    contract_address: Option<Address>,
    #[serde(default)]
    additional_contracts: Vec<AdditionalContract>,
}

/// A contract created inside a transaction, e.g. through a CREATE3 factory.
#[derive(Debug, Deserialize)]
struct AdditionalContract {
    #[serde(default)]
    address: Option<Address>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptEntry {
    transaction_hash: B256,
    #[serde(default, deserialize_with = "deserialize_quantity")]
    block_number: Option<u64>,
}

/// Forge writes quantities as hex strings, older versions as plain integers.
fn deserialize_quantity<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Quantity {
        Number(u64),
        Hex(String),
    }

    match Option::<Quantity>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Quantity::Number(n)) => Ok(Some(n)),
        Some(Quantity::Hex(s)) => rpc::parse_quantity(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Where and when a contract was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastDeployment {
    pub tx_hash: B256,
    pub block_number: Option<u64>,
}

/// Deployments recovered from one or more broadcast logs, by address.
#[derive(Debug, Clone, Default, Deref)]
pub struct BroadcastLog {
    #[deref]
    deployments: HashMap<Address, BroadcastDeployment>,
}

impl BroadcastLog {
    /// Parse a single `run-*.json` file.
    pub fn parse(content: &str) -> Result<Self> {
        let run: RunFile =
            serde_json::from_str(content).context("Failed to parse broadcast log")?;

        let blocks: HashMap<B256, u64> = run
            .receipts
            .iter()
            .filter_map(|r| r.block_number.map(|n| (r.transaction_hash, n)))
            .collect();

        let mut deployments = HashMap::new();
        for tx in &run.transactions {
            let Some(tx_hash) = tx.hash else {
                continue;
            };
            let block_number = blocks.get(&tx_hash).copied();

            let is_create = matches!(
                tx.transaction_type.as_deref(),
                Some("CREATE") | Some("CREATE2")
            );
            let direct = tx.contract_address.filter(|_| is_create);
            let created = tx.additional_contracts.iter().filter_map(|c| c.address);

            for address in direct.into_iter().chain(created) {
                deployments.insert(
                    address,
                    BroadcastDeployment {
                        tx_hash,
                        block_number,
                    },
                );
            }
        }

        Ok(Self { deployments })
    }

    /// Load every `run-*.json` in `dir`, oldest first, so later runs override
    /// earlier ones. Returns `None` if the directory holds no readable log.
    pub fn load_dir(dir: &Path) -> Result<Option<Self>> {
        if !dir.is_dir() {
            tracing::debug!(dir = %dir.display(), "No broadcast directory");
            return Ok(None);
        }

        let mut runs: Vec<(SystemTime, PathBuf)> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read broadcast directory {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("run-") && n.ends_with(".json"))
            })
            .filter_map(|path| {
                let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((modified, path))
            })
            .collect();
        runs.sort();

        let mut merged: Option<Self> = None;
        for (_, path) in runs {
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable broadcast log");
                    continue;
                }
            };
            match Self::parse(&content) {
                Ok(log) => merged.get_or_insert_with(Self::default).extend(log),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping malformed broadcast log");
                }
            }
        }

        if let Some(log) = &merged {
            tracing::debug!(dir = %dir.display(), deployments = log.len(), "Broadcast logs loaded");
        }
        Ok(merged)
    }

    /// Merge `other` into `self`; entries of `other` win, except that a known
    /// block number is not replaced by an unknown one for the same transaction.
    pub fn extend(&mut self, other: Self) {
        for (address, deployment) in other.deployments {
            let block_number = match self.deployments.get(&address) {
                Some(previous) if previous.tx_hash == deployment.tx_hash => {
                    deployment.block_number.or(previous.block_number)
                }
                _ => deployment.block_number,
            };
            self.deployments.insert(
                address,
                BroadcastDeployment {
                    block_number,
                    ..deployment
                },
            );
        }
    }

    pub fn lookup(&self, address: &Address) -> Option<&BroadcastDeployment> {
        self.deployments.get(address)
    }

    /// Fetch receipts for deployments whose block number is unknown.
    ///
    /// Failed lookups leave the entry unresolved.
    pub async fn resolve_missing_blocks(&mut self, client: &reqwest::Client, rpc_url: &str) {
        for (address, deployment) in self.deployments.iter_mut() {
            if deployment.block_number.is_some() {
                continue;
            }
            match rpc::transaction_block(client, rpc_url, deployment.tx_hash).await {
                Ok(Some(block)) => {
                    tracing::debug!(%address, tx_hash = %deployment.tx_hash, block, "Recovered block number from receipt");
                    deployment.block_number = Some(block);
                }
                Ok(None) => {
                    tracing::debug!(%address, tx_hash = %deployment.tx_hash, "Transaction has no receipt yet");
                }
                Err(e) => {
                    tracing::debug!(%address, tx_hash = %deployment.tx_hash, error = %e, "Failed to fetch receipt");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempdir::TempDir;

    const HUB: &str = "0x51eA340B3fe9059B48f935D5A80e127d587B6f89";
    const SPOKE: &str = "0x7Ed48C31f2fdC40d37407cBaBf0870B2b688368f";
    const CALLED: &str = "0x423420Ae467df6e90291fd0252c0A8a637C1e03f";
    const TX_A: &str = "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060";
    const TX_B: &str = "0x8e6f3a1b2c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e7";

    fn run_json(tx_b_block: &str) -> String {
        format!(
            r#"{{
  "transactions": [
    {{ "hash": "{TX_A}", "transactionType": "CREATE", "contractName": "Hub", "contractAddress": "{HUB}", "additionalContracts": [] }},
    {{ "hash": "{TX_B}", "transactionType": "CALL", "contractName": null, "contractAddress": "{CALLED}",
       "additionalContracts": [ {{ "transactionType": "CREATE2", "address": "{SPOKE}", "initCode": "0x60" }} ] }}
  ],
  "receipts": [
    {{ "transactionHash": "{TX_A}", "blockNumber": "0x186a2", "contractAddress": "{HUB}" }},
    {{ "transactionHash": "{TX_B}", "blockNumber": {tx_b_block} }}
  ],
  "chain": 11155111
}}"#
        )
    }

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_direct_and_factory_deployments() {
        let log = BroadcastLog::parse(&run_json("100003")).unwrap();

        assert_eq!(log.len(), 2);
        let hub = log.lookup(&addr(HUB)).unwrap();
        assert_eq!(hub.tx_hash, TX_A.parse::<B256>().unwrap());
        assert_eq!(hub.block_number, Some(100002));

        let spoke = log.lookup(&addr(SPOKE)).unwrap();
        assert_eq!(spoke.block_number, Some(100003));

        // The target of a plain call is not a deployment.
        assert!(log.lookup(&addr(CALLED)).is_none());
    }

    #[test]
    fn test_missing_receipt_leaves_block_unknown() {
        let log = BroadcastLog::parse(&run_json("null")).unwrap();
        assert_eq!(log.lookup(&addr(SPOKE)).unwrap().block_number, None);
    }

    #[test]
    fn test_later_run_does_not_forget_known_block() {
        let mut log = BroadcastLog::parse(&run_json("100003")).unwrap();
        log.extend(BroadcastLog::parse(&run_json("null")).unwrap());
        assert_eq!(log.lookup(&addr(SPOKE)).unwrap().block_number, Some(100003));
    }

    #[test]
    fn test_load_dir() {
        let temp_dir = TempDir::new("forgeship-broadcast").expect("Failed to create temp dir");
        let dir = broadcast_dir(temp_dir.path(), "LaunchDeployer", 11155111);
        assert!(BroadcastLog::load_dir(&dir).unwrap().is_none());

        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("run-1700000000.json"), run_json("null")).unwrap();
        let older = SystemTime::now() - Duration::from_secs(600);
        std::fs::File::options()
            .write(true)
            .open(dir.join("run-1700000000.json"))
            .unwrap()
            .set_modified(older)
            .unwrap();
        std::fs::write(dir.join(LATEST_RUN_FILE), run_json("100003")).unwrap();
        std::fs::write(dir.join("run-broken.json"), "not json").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let log = BroadcastLog::load_dir(&dir).unwrap().expect("logs should load");
        assert_eq!(log.len(), 2);
        assert_eq!(log.lookup(&addr(SPOKE)).unwrap().block_number, Some(100003));
    }

    #[test]
    fn test_latest_run_path() {
        assert_eq!(
            latest_run(Path::new("broadcast"), "WireAdapters", 84532),
            PathBuf::from("broadcast/WireAdapters.s.sol/84532/run-latest.json")
        );
    }
}
