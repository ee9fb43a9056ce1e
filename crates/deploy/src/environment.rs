//! Per-network deployment environments.
//!
//! An environment bundles what a step needs to talk to one network: chain id,
//! RPC endpoint, signing material, admin address and the location of the
//! network config. Endpoints and secrets are resolved on first use and cached
//! for the rest of the run.

use std::{
    future::Future,
    path::{Path, PathBuf},
};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use tokio::sync::OnceCell;

use crate::{
    config::ReleaseConfig,
    network_config::{NetworkConfig, NetworkSection},
    rpc,
    secrets::{ALCHEMY_API_SECRET, ETHERSCAN_API_SECRET, SecretManager, TESTNET_PRIVATE_KEY_SECRET},
};

/// Name of the local development network.
pub const LOCAL_NETWORK: &str = "anvil";

/// Safe administering every testnet deployment.
const TESTNET_ADMIN: &str = "0x423420Ae467df6e90291fd0252c0A8a637C1e03f";

/// Admin Safe of each mainnet.
const MAINNET_ADMINS: &[(&str, &str)] = &[
    ("ethereum", "0xD9D30ab47c0f096b0AA67e9B8B1624504a63e7FD"),
    ("base", "0x8b83962fB9dB346a20c95D98d4E312f17f4C0d9b"),
    ("celo", "0x2464f95F6901233bF4a0130A3611d5B4CBd83195"),
    ("arbitrum", "0xa36caE0ACd40C6BbA61014282f6AE51c7807A433"),
];

/// Network name prefixes used in Alchemy hostnames.
const ALCHEMY_NETWORKS: &[(&str, &str)] = &[
    ("ethereum", "eth"),
    ("arbitrum", "arb"),
    ("base", "base"),
    ("celo", "celo"),
];

/// What a release step needs to know about its target network.
pub trait NetworkEnvironment: Send + Sync {
    fn name(&self) -> &str;

    fn chain_id(&self) -> u64;

    fn is_testnet(&self) -> bool;

    /// Local networks have no explorer and never get source verification.
    fn is_local(&self) -> bool;

    /// Path of the network's persisted configuration.
    fn config_path(&self) -> &Path;

    /// Account that receives admin rights over the deployed contracts.
    fn admin_address(&self) -> Result<Address>;

    fn rpc_url(&self) -> impl Future<Output = Result<String>> + Send;

    /// Hot signing key. Only available where no hardware wallet is required.
    fn private_key(&self) -> impl Future<Output = Result<String>> + Send;

    /// Explorer API key, `None` if the network has no explorer.
    fn explorer_api_key(&self) -> impl Future<Output = Result<Option<String>>> + Send;
}

/// A public testnet or mainnet described by `env/<network>.json`.
#[derive(Debug)]
pub struct LiveEnvironment {
    name: String,
    network: NetworkSection,
    config_path: PathBuf,
    rpc_override: Option<String>,
    secrets: SecretManager,
    client: reqwest::Client,
    rpc_url: OnceCell<String>,
    private_key: OnceCell<String>,
    explorer_api_key: OnceCell<String>,
}

impl LiveEnvironment {
    pub fn load(
        name: &str,
        config: &ReleaseConfig,
        secrets: SecretManager,
        client: reqwest::Client,
    ) -> Result<Self> {
        let config_path = config.network_config_path(name);
        let network = NetworkConfig::load(&config_path)?.network;

        tracing::debug!(
            network = name,
            chain_id = network.chain_id,
            environment = %network.environment,
            "Network configuration loaded"
        );

        Ok(Self {
            name: name.to_string(),
            network,
            config_path,
            rpc_override: config.rpc_urls.get(name).cloned(),
            secrets,
            client,
            rpc_url: OnceCell::new(),
            private_key: OnceCell::new(),
            explorer_api_key: OnceCell::new(),
        })
    }

    pub fn section(&self) -> &NetworkSection {
        &self.network
    }

    async fn resolve_rpc_url(&self) -> Result<String> {
        if let Some(url) = &self.rpc_override {
            tracing::debug!(network = %self.name, rpc = %redact(url), "Using configured RPC endpoint");
            return Ok(url.clone());
        }

        let url = match plume_rpc_url(&self.name, self.is_testnet()) {
            Some(url) => url.to_string(),
            None => {
                let api_key = self.secrets.get(ALCHEMY_API_SECRET).await?;
                alchemy_rpc_url(&self.name, self.is_testnet(), &api_key)?
            }
        };

        let block = rpc::block_number(&self.client, &url)
            .await
            .with_context(|| format!("RPC connection failed: {}", redact(&url)))?;
        tracing::info!(network = %self.name, rpc = %redact(&url), block, "RPC connection verified");
        Ok(url)
    }
}

impl NetworkEnvironment for LiveEnvironment {
    fn name(&self) -> &str {
        &self.name
    }

    fn chain_id(&self) -> u64 {
        self.network.chain_id
    }

    fn is_testnet(&self) -> bool {
        self.network.is_testnet()
    }

    fn is_local(&self) -> bool {
        false
    }

    fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn admin_address(&self) -> Result<Address> {
        admin_address(&self.name, self.is_testnet())
    }

    async fn rpc_url(&self) -> Result<String> {
        self.rpc_url
            .get_or_try_init(|| self.resolve_rpc_url())
            .await
            .cloned()
    }

    async fn private_key(&self) -> Result<String> {
        if !self.is_testnet() {
            anyhow::bail!(
                "{} is a mainnet: private keys are not used there, sign with a ledger",
                self.name
            );
        }
        self.private_key
            .get_or_try_init(|| self.secrets.get(TESTNET_PRIVATE_KEY_SECRET))
            .await
            .cloned()
    }

    async fn explorer_api_key(&self) -> Result<Option<String>> {
        self.explorer_api_key
            .get_or_try_init(|| self.secrets.get(ETHERSCAN_API_SECRET))
            .await
            .cloned()
            .map(Some)
    }
}

/// The `anvil` development network with its well-known accounts.
#[derive(Debug, Clone)]
pub struct LocalEnvironment {
    config_path: PathBuf,
}

impl LocalEnvironment {
    pub const CHAIN_ID: u64 = 31337;
    pub const RPC_URL: &'static str = "http://localhost:8545";
    /// First anvil account, funds the deployment.
    pub const PRIVATE_KEY: &'static str =
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    /// Second anvil account.
    pub const ADMIN: &'static str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

    pub fn new(config: &ReleaseConfig) -> Self {
        Self {
            config_path: config.network_config_path(LOCAL_NETWORK),
        }
    }
}

impl NetworkEnvironment for LocalEnvironment {
    fn name(&self) -> &str {
        LOCAL_NETWORK
    }

    fn chain_id(&self) -> u64 {
        Self::CHAIN_ID
    }

    fn is_testnet(&self) -> bool {
        true
    }

    fn is_local(&self) -> bool {
        true
    }

    fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn admin_address(&self) -> Result<Address> {
        Self::ADMIN.parse().context("Invalid anvil admin address")
    }

    async fn rpc_url(&self) -> Result<String> {
        Ok(Self::RPC_URL.to_string())
    }

    async fn private_key(&self) -> Result<String> {
        Ok(Self::PRIVATE_KEY.to_string())
    }

    async fn explorer_api_key(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Either kind of environment, picked by network name.
#[derive(Debug)]
pub enum Environment {
    Live(LiveEnvironment),
    Local(LocalEnvironment),
}

impl Environment {
    pub fn load(
        name: &str,
        config: &ReleaseConfig,
        secrets: SecretManager,
        client: reqwest::Client,
    ) -> Result<Self> {
        if name == LOCAL_NETWORK {
            Ok(Self::Local(LocalEnvironment::new(config)))
        } else {
            LiveEnvironment::load(name, config, secrets, client).map(Self::Live)
        }
    }
}

impl NetworkEnvironment for Environment {
    fn name(&self) -> &str {
        match self {
            Self::Live(env) => env.name(),
            Self::Local(env) => env.name(),
        }
    }

    fn chain_id(&self) -> u64 {
        match self {
            Self::Live(env) => env.chain_id(),
            Self::Local(env) => env.chain_id(),
        }
    }

    fn is_testnet(&self) -> bool {
        match self {
            Self::Live(env) => env.is_testnet(),
            Self::Local(env) => env.is_testnet(),
        }
    }

    fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    fn config_path(&self) -> &Path {
        match self {
            Self::Live(env) => env.config_path(),
            Self::Local(env) => env.config_path(),
        }
    }

    fn admin_address(&self) -> Result<Address> {
        match self {
            Self::Live(env) => env.admin_address(),
            Self::Local(env) => env.admin_address(),
        }
    }

    async fn rpc_url(&self) -> Result<String> {
        match self {
            Self::Live(env) => env.rpc_url().await,
            Self::Local(env) => env.rpc_url().await,
        }
    }

    async fn private_key(&self) -> Result<String> {
        match self {
            Self::Live(env) => env.private_key().await,
            Self::Local(env) => env.private_key().await,
        }
    }

    async fn explorer_api_key(&self) -> Result<Option<String>> {
        match self {
            Self::Live(env) => env.explorer_api_key().await,
            Self::Local(env) => env.explorer_api_key().await,
        }
    }
}

/// Admin account of `network`.
pub fn admin_address(network: &str, is_testnet: bool) -> Result<Address> {
    let address = if is_testnet {
        TESTNET_ADMIN
    } else {
        MAINNET_ADMINS
            .iter()
            .find(|(name, _)| *name == network)
            .map(|(_, address)| *address)
            .with_context(|| format!("Unknown mainnet network: {}", network))?
    };
    address
        .parse()
        .with_context(|| format!("Invalid admin address for {}", network))
}

/// Plume runs its own public endpoints.
fn plume_rpc_url(network: &str, is_testnet: bool) -> Option<&'static str> {
    match (network, is_testnet) {
        ("plume", true) => Some("https://testnet-rpc.plume.org"),
        ("plume", false) => Some("https://mainnet-rpc.plume.org"),
        _ => None,
    }
}

/// Alchemy endpoint of `network`.
pub fn alchemy_rpc_url(network: &str, is_testnet: bool, api_key: &str) -> Result<String> {
    let alchemy_network = |name: &str| {
        ALCHEMY_NETWORKS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, prefix)| *prefix)
            .with_context(|| format!("No Alchemy endpoint known for {}", network))
    };

    if !is_testnet {
        let prefix = alchemy_network(network)?;
        return Ok(format!("https://{}-mainnet.g.alchemy.com/v2/{}", prefix, api_key));
    }

    if network == "celo" {
        return Ok(format!("https://celo-alfajores.g.alchemy.com/v2/{}", api_key));
    }

    let base = match network {
        "sepolia" => "ethereum",
        other => other.strip_suffix("-sepolia").unwrap_or(other),
    };
    let prefix = alchemy_network(base)?;
    Ok(format!("https://{}-sepolia.g.alchemy.com/v2/{}", prefix, api_key))
}

/// Scheme and host of an endpoint, without API keys in path or query.
pub fn redact(endpoint: &str) -> String {
    match url::Url::parse(endpoint) {
        Ok(url) => match url.host_str() {
            Some(host) => format!("{}://{}", url.scheme(), host),
            None => url.scheme().to_string(),
        },
        Err(_) => "<invalid url>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_alchemy_urls() {
        assert_eq!(
            alchemy_rpc_url("sepolia", true, "KEY").unwrap(),
            "https://eth-sepolia.g.alchemy.com/v2/KEY"
        );
        assert_eq!(
            alchemy_rpc_url("base-sepolia", true, "KEY").unwrap(),
            "https://base-sepolia.g.alchemy.com/v2/KEY"
        );
        assert_eq!(
            alchemy_rpc_url("arbitrum-sepolia", true, "KEY").unwrap(),
            "https://arb-sepolia.g.alchemy.com/v2/KEY"
        );
        assert_eq!(
            alchemy_rpc_url("ethereum", false, "KEY").unwrap(),
            "https://eth-mainnet.g.alchemy.com/v2/KEY"
        );
        assert!(alchemy_rpc_url("unknown-chain", false, "KEY").is_err());
    }

    #[test]
    fn test_plume_has_fixed_endpoints() {
        assert_eq!(plume_rpc_url("plume", true), Some("https://testnet-rpc.plume.org"));
        assert_eq!(plume_rpc_url("plume", false), Some("https://mainnet-rpc.plume.org"));
        assert_eq!(plume_rpc_url("base", false), None);
    }

    #[test]
    fn test_admin_addresses() {
        let testnet = admin_address("base-sepolia", true).unwrap();
        assert_eq!(testnet, TESTNET_ADMIN.parse::<Address>().unwrap());

        let base = admin_address("base", false).unwrap();
        assert_eq!(base, MAINNET_ADMINS[1].1.parse::<Address>().unwrap());

        assert!(admin_address("plume", false).is_err());
    }

    #[test]
    fn test_redact_hides_api_key() {
        assert_eq!(
            redact("https://eth-sepolia.g.alchemy.com/v2/SECRET"),
            "https://eth-sepolia.g.alchemy.com"
        );
    }

    #[tokio::test]
    async fn test_local_environment() {
        let env = Environment::load(
            LOCAL_NETWORK,
            &ReleaseConfig::default(),
            SecretManager::new(&Default::default()),
            rpc::create_client().unwrap(),
        )
        .unwrap();

        assert!(env.is_local());
        assert_eq!(env.chain_id(), 31337);
        assert_eq!(env.rpc_url().await.unwrap(), "http://localhost:8545");
        assert_eq!(env.explorer_api_key().await.unwrap(), None);
        assert!(env.config_path().ends_with("env/anvil.json"));
    }

    #[tokio::test]
    async fn test_live_environment_from_config() {
        let temp_dir = TempDir::new("forgeship-env").expect("Failed to create temp dir");
        std::fs::create_dir_all(temp_dir.path().join("env")).unwrap();
        std::fs::write(
            temp_dir.path().join("env/ethereum.json"),
            r#"{"network":{"chainId":1,"environment":"mainnet","connectsTo":[]},"contracts":{}}"#,
        )
        .unwrap();

        let mut config = ReleaseConfig {
            root_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        config
            .rpc_urls
            .insert("ethereum".to_string(), "http://127.0.0.1:8545".to_string());

        let env = Environment::load(
            "ethereum",
            &config,
            SecretManager::new(&config.secrets),
            rpc::create_client().unwrap(),
        )
        .unwrap();

        assert!(!env.is_local());
        assert!(!env.is_testnet());
        assert_eq!(env.chain_id(), 1);
        assert_eq!(env.rpc_url().await.unwrap(), "http://127.0.0.1:8545");
        // Mainnets are signed with a ledger only.
        assert!(env.private_key().await.is_err());
    }

    #[test]
    fn test_missing_network_config_fails() {
        let temp_dir = TempDir::new("forgeship-env").expect("Failed to create temp dir");
        let config = ReleaseConfig {
            root_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(
            Environment::load(
                "sepolia",
                &config,
                SecretManager::new(&config.secrets),
                rpc::create_client().unwrap(),
            )
            .is_err()
        );
    }
}
