//! Deployment verification: code presence on-chain and source verification
//! on the block explorer.

use std::{fmt, time::Duration};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde_json::Value;

use crate::rpc;

/// Placeholder the explorer returns as source for unverified contracts.
const UNVERIFIED_SOURCE: &str = "Contract source code not verified";

/// Etherscan-compatible explorer API for one chain.
#[derive(Debug, Clone)]
pub struct ExplorerClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    chain_id: u64,
}

impl ExplorerClient {
    pub fn new(
        client: reqwest::Client,
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        chain_id: u64,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
            chain_id,
        }
    }

    /// Query the `getsourcecode` endpoint for `address`.
    pub async fn source_code(&self, address: Address) -> Result<Value> {
        let response = self
            .client
            .get(&self.api_url)
            .query(&[
                ("chainid", self.chain_id.to_string()),
                ("module", "contract".to_string()),
                ("action", "getsourcecode".to_string()),
                ("address", address.to_string()),
                ("apikey", self.api_key.clone()),
            ])
            .send()
            .await
            .context("Failed to query block explorer")?;

        response
            .json()
            .await
            .context("Failed to parse block explorer response")
    }

    /// Whether the explorer has verified source for `address`. Any request
    /// failure counts as not verified.
    pub async fn is_verified(&self, address: Address) -> bool {
        match self.source_code(address).await {
            Ok(body) => is_verified_response(&body),
            Err(e) => {
                tracing::debug!(%address, error = %e, "Explorer query failed");
                false
            }
        }
    }
}

/// Interpret a `getsourcecode` response.
pub fn is_verified_response(body: &Value) -> bool {
    if body.get("status").and_then(|s| s.as_str()) != Some("1") {
        return false;
    }

    let Some(entry) = body
        .get("result")
        .and_then(|r| r.as_array())
        .and_then(|r| r.first())
    else {
        return false;
    };

    let field = |key: &str| entry.get(key).and_then(|v| v.as_str()).unwrap_or_default();
    let source = field("SourceCode");
    !source.is_empty() && source != UNVERIFIED_SOURCE && !field("ContractName").is_empty()
}

/// Verification status of one contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractStatus {
    pub name: String,
    pub address: Address,
    pub deployed: bool,
    /// `None` when the network has no explorer to check against.
    pub verified: Option<bool>,
}

impl ContractStatus {
    pub fn is_verified(&self) -> bool {
        self.verified.unwrap_or(true)
    }

    pub fn passed(&self) -> bool {
        self.deployed && self.is_verified()
    }
}

/// Verification status of a network's contracts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub network: String,
    pub contracts: Vec<ContractStatus>,
}

impl VerificationReport {
    pub fn total(&self) -> usize {
        self.contracts.len()
    }

    pub fn deployed_count(&self) -> usize {
        self.contracts.iter().filter(|c| c.deployed).count()
    }

    pub fn verified_count(&self) -> usize {
        self.contracts.iter().filter(|c| c.is_verified()).count()
    }

    pub fn all_passed(&self) -> bool {
        self.contracts.iter().all(ContractStatus::passed)
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Verification: {} ===", self.network)?;
        for contract in &self.contracts {
            writeln!(f, "{}", contract)?;
        }
        write!(
            f,
            "Deployed: {}/{}  Verified: {}/{}",
            self.deployed_count(),
            self.total(),
            self.verified_count(),
            self.total()
        )
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  {} {} {} ",
            status_icon(self.deployed),
            self.name,
            self.address
        )?;
        match self.verified {
            Some(verified) => write!(f, "source={}", status_icon(verified)),
            None => write!(f, "source=[skipped]"),
        }
    }
}

fn status_icon(ok: bool) -> &'static str {
    if ok { "[ok]" } else { "[MISSING]" }
}

/// Checks a set of contracts against an RPC endpoint and an explorer.
#[derive(Debug, Clone)]
pub struct VerificationChecker {
    client: reqwest::Client,
    rate_limit: Duration,
}

impl VerificationChecker {
    pub fn new(client: reqwest::Client, rate_limit: Duration) -> Self {
        Self { client, rate_limit }
    }

    /// Check every contract. Failed RPC calls count as not deployed, failed
    /// explorer calls as not verified. Without an explorer only code presence
    /// is checked.
    pub async fn check(
        &self,
        network: &str,
        contracts: &IndexMap<String, Address>,
        rpc_url: &str,
        explorer: Option<&ExplorerClient>,
    ) -> VerificationReport {
        tracing::info!(network, contracts = contracts.len(), "Checking deployed contracts");

        let mut statuses = Vec::with_capacity(contracts.len());
        for (i, (name, address)) in contracts.iter().enumerate() {
            let deployed = match rpc::get_code(&self.client, rpc_url, *address).await {
                Ok(code) => rpc::has_code(&code),
                Err(e) => {
                    tracing::debug!(contract = %name, %address, error = %e, "eth_getCode failed");
                    false
                }
            };

            let verified = match explorer {
                Some(explorer) => {
                    if i > 0 && !self.rate_limit.is_zero() {
                        tokio::time::sleep(self.rate_limit).await;
                    }
                    Some(explorer.is_verified(*address).await)
                }
                None => None,
            };

            let status = ContractStatus {
                name: name.clone(),
                address: *address,
                deployed,
                verified,
            };
            if status.passed() {
                tracing::debug!(contract = %name, %address, "Contract deployed and verified");
            } else {
                tracing::warn!(contract = %name, %address, deployed, verified = ?verified, "Contract not fully verified");
            }
            statuses.push(status);
        }

        let report = VerificationReport {
            network: network.to_string(),
            contracts: statuses,
        };
        tracing::info!(
            network,
            deployed = report.deployed_count(),
            verified = report.verified_count(),
            total = report.total(),
            "Verification check finished"
        );
        report
    }
}
