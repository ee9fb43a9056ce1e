//! Release configuration.
//!
//! Built once at start-up from layered sources (defaults, `Release.toml`,
//! `FORGESHIP_*` environment variables, command line) and passed by reference
//! to everything that needs it.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{merge::StartBlockPolicy, retry::RetryPolicy, state::Step};

/// Name of the configuration file looked up in the root directory.
pub const CONFIG_FILE_NAME: &str = "Release.toml";

/// Prefix of environment variables overriding configuration keys.
pub const ENV_PREFIX: &str = "FORGESHIP_";

/// Ledger signing for networks that must not use a hot key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Mnemonic index of the account on the device.
    pub index: u32,
    /// Address of that account.
    pub sender: Address,
}

/// Retry budget of each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub protocol: RetryPolicy,
    /// Explorers index new sources with a delay of minutes.
    pub verification: RetryPolicy,
    pub wiring: RetryPolicy,
    pub test_data: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            protocol: RetryPolicy::new(3, 5),
            verification: RetryPolicy::new(3, 30),
            wiring: RetryPolicy::new(3, 5),
            test_data: RetryPolicy::new(3, 5),
        }
    }
}

impl RetryConfig {
    pub fn for_step(&self, step: Step) -> RetryPolicy {
        match step {
            Step::Protocol => self.protocol,
            Step::Verification => self.verification,
            Step::Wiring => self.wiring,
            Step::TestData => self.test_data,
        }
    }

    /// The same budget for every step.
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            protocol: policy,
            verification: policy,
            wiring: policy,
            test_data: policy,
        }
    }
}

/// Where secrets come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Project of the secret manager.
    pub project: String,
    /// Values used instead of querying the secret manager.
    #[serde(skip_serializing)]
    pub overrides: BTreeMap<String, String>,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            project: "centrifuge-production-x".to_string(),
            overrides: BTreeMap::new(),
        }
    }
}

/// Configuration of a release run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    /// Repository root. Relative paths below are resolved against it.
    pub root_dir: PathBuf,
    /// Network configuration files, `<env_dir>/<network>.json`.
    pub env_dir: PathBuf,
    /// Deployment artifacts, `<latest_dir>/<chainId>-latest.json`.
    pub latest_dir: PathBuf,
    pub broadcast_dir: PathBuf,
    pub script_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub state_path: PathBuf,
    /// Networks to release, in order.
    pub networks: Vec<String>,
    /// Simulate scripts without broadcasting.
    pub dry_run: bool,
    /// Extra arguments passed to every `forge script` invocation.
    pub forge_args: Vec<String>,
    pub ledger: Option<LedgerConfig>,
    /// Commit recorded in `deploymentInfo`. Read from `git` when unset.
    pub git_commit: Option<String>,
    pub explorer_api_url: String,
    /// Pause between two explorer requests.
    pub explorer_rate_limit_ms: u64,
    /// Artifacts older than this require confirmation before they are merged.
    pub artifact_max_age_hours: u64,
    /// A broadcast log younger than this is resumed instead of restarted.
    pub resume_window_minutes: u64,
    /// Pause before wiring during which the release can be cancelled. 0 disables it.
    pub wiring_grace_secs: u64,
    /// RPC endpoint per network, taking precedence over the derived ones.
    pub rpc_urls: BTreeMap<String, String>,
    pub retry: RetryConfig,
    pub start_block: StartBlockPolicy,
    pub secrets: SecretsConfig,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            env_dir: PathBuf::from("env"),
            latest_dir: PathBuf::from("env/latest"),
            broadcast_dir: PathBuf::from("broadcast"),
            script_dir: PathBuf::from("script"),
            logs_dir: PathBuf::from("script/deploy/logs"),
            state_path: PathBuf::from("script/deploy/.release-state.json"),
            networks: vec![
                "sepolia".to_string(),
                "base-sepolia".to_string(),
                "arbitrum-sepolia".to_string(),
            ],
            dry_run: false,
            forge_args: Vec::new(),
            ledger: None,
            git_commit: None,
            explorer_api_url: "https://api.etherscan.io/v2/api".to_string(),
            explorer_rate_limit_ms: 200,
            artifact_max_age_hours: 24,
            resume_window_minutes: 120,
            wiring_grace_secs: 0,
            rpc_urls: BTreeMap::new(),
            retry: RetryConfig::default(),
            start_block: StartBlockPolicy::default(),
            secrets: SecretsConfig::default(),
        }
    }
}

/// Values given on the command line. Unset fields leave the lower layers alone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networks: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
}

impl ReleaseConfig {
    /// Layer the configuration sources. `file` defaults to `Release.toml` in
    /// `root`; a missing file is skipped.
    pub fn figment(root: &Path, file: Option<&Path>) -> Figment {
        let file = file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.join(CONFIG_FILE_NAME));

        Figment::from(Serialized::defaults(ReleaseConfig {
            root_dir: root.to_path_buf(),
            ..Default::default()
        }))
        .merge(Toml::file(file))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load the configuration, applying `overrides` last.
    pub fn load(root: &Path, file: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let config: Self = Self::figment(root, file)
            .merge(Serialized::defaults(overrides))
            .extract()
            .context("Failed to load release configuration")?;

        tracing::debug!(
            root = %config.root_dir.display(),
            networks = ?config.networks,
            dry_run = config.dry_run,
            "Release configuration loaded"
        );
        Ok(config)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize release configuration")
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root_dir.join(path)
        }
    }

    /// `env/<network>.json`
    pub fn network_config_path(&self, network: &str) -> PathBuf {
        self.resolve(&self.env_dir).join(format!("{}.json", network))
    }

    /// `env/latest/<chainId>-latest.json`
    pub fn artifact_path(&self, chain_id: u64) -> PathBuf {
        self.resolve(&self.latest_dir)
            .join(format!("{}-latest.json", chain_id))
    }

    pub fn broadcast_root(&self) -> PathBuf {
        self.resolve(&self.broadcast_dir)
    }

    /// `script/<Name>.s.sol`
    pub fn script_path(&self, script: &str) -> PathBuf {
        self.resolve(&self.script_dir)
            .join(format!("{}.s.sol", script))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.resolve(&self.logs_dir)
    }

    pub fn state_path(&self) -> PathBuf {
        self.resolve(&self.state_path)
    }

    pub fn artifact_max_age(&self) -> Duration {
        Duration::from_secs(self.artifact_max_age_hours * 3600)
    }

    pub fn resume_window(&self) -> Duration {
        Duration::from_secs(self.resume_window_minutes * 60)
    }

    pub fn explorer_rate_limit(&self) -> Duration {
        Duration::from_millis(self.explorer_rate_limit_ms)
    }

    pub fn wiring_grace(&self) -> Duration {
        Duration::from_secs(self.wiring_grace_secs)
    }
}
