//! Execution of release steps.
//!
//! [`StepExecutor`] is the seam between the orchestration engine and the
//! outside world. [`ForgeStepExecutor`] implements it with `forge`, the
//! network RPC and the block explorer.

mod cmd;
pub use cmd::{
    ForgeAuth, ForgeScriptCmdBuilder, STALLED_NETWORK_GAS_PRICE, build_args, display_redacted,
    is_stalled_network,
};

use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
};

use alloy_core::primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use anyhow::{Context, Result};
use chrono::Utc;
use tokio::{process::Command, sync::OnceCell};

use crate::{
    broadcast::{self, BroadcastLog},
    config::ReleaseConfig,
    environment::{Environment, LOCAL_NETWORK, NetworkEnvironment},
    error::StepError,
    fs::FsHandler,
    merge::{Confirm, ConfigMerger, DeploymentStamp, FreshnessGuard, MergeOutcome},
    network_config::{DeploymentArtifact, NetworkConfig},
    rpc,
    secrets::SecretManager,
    state::Step,
    verify::{ExplorerClient, VerificationChecker, VerificationReport},
};

/// Runs individual release steps against a network.
pub trait StepExecutor: Send + Sync {
    /// One-time preparation shared by every network of a release.
    fn prepare(&self) -> impl Future<Output = Result<(), StepError>> + Send;

    /// Run `step` on `network`. With `resume` set, a partially broadcast
    /// script is continued instead of started over.
    fn execute(
        &self,
        network: &str,
        step: Step,
        resume: bool,
    ) -> impl Future<Output = Result<(), StepError>> + Send;

    /// Broadcast log a previous attempt of `step` may have left behind.
    fn resume_evidence(&self, network: &str, step: Step) -> Option<PathBuf>;
}

/// `deploymentInfo` key under which a step's deployment is recorded.
pub fn deployment_key(step: Step) -> String {
    format!("deploy:{}", step)
}

/// [`StepExecutor`] running forge scripts.
pub struct ForgeStepExecutor {
    config: ReleaseConfig,
    version: Option<String>,
    secrets: SecretManager,
    client: reqwest::Client,
    checker: VerificationChecker,
    merger: ConfigMerger,
    confirm: Box<dyn Confirm>,
    environments: Mutex<HashMap<String, Arc<Environment>>>,
    git_commit: OnceCell<String>,
}

impl ForgeStepExecutor {
    pub fn new(
        config: ReleaseConfig,
        version: Option<String>,
        confirm: Box<dyn Confirm>,
    ) -> Result<Self> {
        let client = rpc::create_client()?;
        let git_commit = match &config.git_commit {
            Some(commit) => OnceCell::from(commit.clone()),
            None => OnceCell::new(),
        };
        Ok(Self {
            secrets: SecretManager::new(&config.secrets),
            checker: VerificationChecker::new(client.clone(), config.explorer_rate_limit()),
            merger: ConfigMerger::new(config.start_block),
            client,
            config,
            version,
            confirm,
            environments: Mutex::new(HashMap::new()),
            git_commit,
        })
    }

    pub fn config(&self) -> &ReleaseConfig {
        &self.config
    }

    /// The environment of `network`, loaded once per run.
    pub fn environment(&self, network: &str) -> Result<Arc<Environment>> {
        let mut environments = self
            .environments
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(env) = environments.get(network) {
            return Ok(env.clone());
        }

        let env = Arc::new(Environment::load(
            network,
            &self.config,
            self.secrets.clone(),
            self.client.clone(),
        )?);
        environments.insert(network.to_string(), env.clone());
        Ok(env)
    }

    /// `network` and the networks its config connects it to, in wiring order.
    pub fn wiring_targets(&self, network: &str) -> Result<Vec<String>> {
        let path = self.config.network_config_path(network);
        if network == LOCAL_NETWORK && !path.is_file() {
            return Ok(vec![network.to_string()]);
        }
        Ok(NetworkConfig::load(&path)?.network.with_peers(network))
    }

    /// Check the contracts of the latest deployment artifact of `network`.
    pub async fn check(&self, network: &str) -> Result<VerificationReport, StepError> {
        let env = self.environment(network).map_err(StepError::fatal)?;
        let artifact_path = self.config.artifact_path(env.chain_id());

        let artifact = DeploymentArtifact::load(&artifact_path).map_err(StepError::transient)?;
        let contracts = artifact.addresses();
        if contracts.is_empty() {
            return Err(StepError::transient(anyhow::anyhow!(
                "No contracts found in {}",
                artifact_path.display()
            )));
        }

        let rpc_url = env.rpc_url().await.map_err(StepError::transient)?;
        let explorer = env
            .explorer_api_key()
            .await
            .map_err(StepError::fatal)?
            .map(|key| {
                ExplorerClient::new(
                    self.client.clone(),
                    &self.config.explorer_api_url,
                    key,
                    env.chain_id(),
                )
            });

        Ok(self
            .checker
            .check(network, &contracts, &rpc_url, explorer.as_ref())
            .await)
    }

    /// Merge the latest artifact of `step` into the network config.
    ///
    /// With `check_age`, stale artifacts need operator confirmation.
    pub async fn merge(
        &self,
        network: &str,
        step: Step,
        check_age: bool,
    ) -> Result<MergeOutcome, StepError> {
        let env = self.environment(network).map_err(StepError::fatal)?;
        let artifact_path = self.config.artifact_path(env.chain_id());

        let broadcast = match step.script() {
            Some(script) => self.broadcast_log(&env, script).await,
            None => None,
        };

        let git_commit = self
            .git_commit
            .get_or_try_init(|| git_commit(&self.config.root_dir))
            .await
            .map_err(StepError::fatal)?;
        let stamp = DeploymentStamp::new(git_commit.as_str(), self.version.clone())
            .at_artifact(&artifact_path);

        let max_age = if check_age {
            self.config.artifact_max_age()
        } else {
            std::time::Duration::MAX
        };
        let guard = FreshnessGuard {
            max_age,
            confirm: self.confirm.as_ref(),
        };

        let outcome = self.merger.merge_gated(
            &guard,
            env.config_path(),
            &artifact_path,
            broadcast.as_ref(),
            &deployment_key(step),
            &stamp,
        )?;
        Ok(outcome)
    }

    async fn broadcast_log(&self, env: &Environment, script: &str) -> Option<BroadcastLog> {
        let dir = broadcast::broadcast_dir(&self.config.broadcast_root(), script, env.chain_id());
        let mut log = match BroadcastLog::load_dir(&dir) {
            Ok(Some(log)) => log,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to read broadcast logs");
                return None;
            }
        };

        match env.rpc_url().await {
            Ok(rpc_url) => log.resolve_missing_blocks(&self.client, &rpc_url).await,
            Err(e) => {
                tracing::warn!(network = env.name(), error = %e, "No RPC to fetch missing receipts")
            }
        }
        Some(log)
    }

    async fn verify(&self, env: &Environment) -> Result<(), StepError> {
        if self.config.dry_run {
            tracing::info!(network = env.name(), "Dry run mode, skipping contract checks");
            return Ok(());
        }

        let report = self.check(env.name()).await?;
        self.settle(env, &report).await
    }

    /// Merge the protocol deployment of `env` once every contract of
    /// `report` is deployed and verified.
    async fn settle(&self, env: &Environment, report: &VerificationReport) -> Result<(), StepError> {
        tracing::info!("\n{}", report);

        if !report.all_passed() {
            return Err(StepError::VerificationIncomplete {
                deployed: report.deployed_count(),
                verified: report.verified_count(),
                total: report.total(),
            });
        }

        if env.is_local() && !env.config_path().is_file() {
            tracing::info!(network = env.name(), "No network config for the local network, skipping merge");
            return Ok(());
        }

        match self.merge(env.name(), Step::Protocol, true).await? {
            MergeOutcome::Merged(report) => {
                tracing::info!(network = env.name(), config = %env.config_path().display(), "{}", report);
            }
            MergeOutcome::SkippedStale { .. } => {
                tracing::warn!(network = env.name(), "Network config left unchanged");
            }
        }
        Ok(())
    }

    async fn auth(&self, env: &Environment) -> Result<ForgeAuth> {
        if let Some(ledger) = &self.config.ledger {
            tracing::info!(network = env.name(), sender = %ledger.sender, index = ledger.index, "Signing with ledger");
            return Ok(ForgeAuth::Ledger {
                index: ledger.index,
                sender: ledger.sender,
            });
        }

        if !env.is_testnet() {
            anyhow::bail!(
                "No authentication method for mainnet {}, configure a ledger",
                env.name()
            );
        }

        let key = env.private_key().await?;
        let sender = sender_address(&key)?;
        tracing::info!(network = env.name(), %sender, "Signing with the shared testnet account");
        Ok(ForgeAuth::PrivateKey(key))
    }

    async fn run_script(
        &self,
        env: &Environment,
        step: Step,
        script: &str,
        resume: bool,
    ) -> Result<(), StepError> {
        let auth = self.auth(env).await.map_err(StepError::fatal)?;
        let admin = env.admin_address().map_err(StepError::fatal)?;
        let explorer_key = env
            .explorer_api_key()
            .await
            .map_err(StepError::fatal)?
            .unwrap_or_default();
        let rpc_url = env.rpc_url().await.map_err(StepError::transient)?;

        let stalled = is_stalled_network(env.name());
        let cmd = ForgeScriptCmdBuilder::new(
            self.config.script_path(script),
            script,
            &rpc_url,
            env.chain_id(),
        )
        .auth(auth)
        .extra_args(self.config.forge_args.iter().cloned())
        .broadcast(!self.config.dry_run)
        .slow(!env.is_testnet() || stalled)
        .gas_price(stalled.then_some(STALLED_NETWORK_GAS_PRICE))
        .resume(resume);
        let args = cmd.clone().build();

        let envs = [
            ("NETWORK", env.name().to_string()),
            ("VERSION", self.version.clone().unwrap_or_default()),
            ("ETHERSCAN_API_KEY", explorer_key),
            ("ADMIN", admin.to_string()),
        ];

        tracing::info!(
            network = env.name(),
            chain_id = env.chain_id(),
            script,
            %admin,
            resume,
            "Running {}",
            display_redacted("forge", &args)
        );

        let status = Command::new("forge")
            .args(&args)
            .envs(envs.iter().map(|(k, v)| (*k, v.as_str())))
            .current_dir(&self.config.root_dir)
            .status()
            .await
            .context("Failed to run forge. Is foundry installed?")
            .map_err(StepError::fatal)?;

        if !status.success() {
            return Err(StepError::transient(anyhow::anyhow!(
                "forge script {} failed with {}",
                script,
                status
            )));
        }
        tracing::info!(network = env.name(), script, "Forge script finished");

        if step == Step::Protocol && !env.is_local() && !self.config.dry_run {
            let verify_args = cmd.source_submission();
            self.submit_sources(env, step, &verify_args, &envs).await?;
        }

        Ok(())
    }

    /// Re-run a broadcast script with `--verify`, capturing its output to the
    /// step's log file.
    async fn submit_sources(
        &self,
        env: &Environment,
        step: Step,
        args: &[String],
        envs: &[(&str, String)],
    ) -> Result<(), StepError> {
        let log_path = self
            .config
            .logs_dir()
            .join(format!("forge-{}-{}.log", step, env.name()));
        tracing::info!(network = env.name(), log = %log_path.display(), "Submitting sources to the explorer, this may take a while");

        let output = Command::new("forge")
            .args(args)
            .envs(envs.iter().map(|(k, v)| (*k, v.as_str())))
            .current_dir(&self.config.root_dir)
            .stdin(Stdio::null())
            .output()
            .await
            .context("Failed to run forge")
            .map_err(StepError::fatal)?;

        let mut log = format!(
            "Command: {}\nExit code: {}\nTimestamp: {}\n\n{}\n",
            display_redacted("forge", args),
            output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            Utc::now().to_rfc3339(),
            "=".repeat(50)
        );
        if !output.stdout.is_empty() {
            log.push_str("=== FORGE STDOUT ===\n");
            log.push_str(&String::from_utf8_lossy(&output.stdout));
            log.push('\n');
        }
        if !output.stderr.is_empty() {
            log.push_str("=== FORGE STDERR ===\n");
            log.push_str(&String::from_utf8_lossy(&output.stderr));
            log.push('\n');
        }
        if let Err(e) = FsHandler::write_atomic(&log_path, log) {
            tracing::warn!(log = %log_path.display(), error = %e, "Failed to write forge log");
        }

        if !output.status.success() {
            return Err(StepError::transient(anyhow::anyhow!(
                "source verification failed with {}, see {}",
                output.status,
                log_path.display()
            )));
        }
        tracing::info!(network = env.name(), "Sources submitted");
        Ok(())
    }

    async fn run_forge(&self, args: &[String]) -> Result<()> {
        tracing::info!("Running {}", display_redacted("forge", args));
        let status = Command::new("forge")
            .args(args)
            .current_dir(&self.config.root_dir)
            .status()
            .await
            .context("Failed to run forge. Is foundry installed?")?;
        if !status.success() {
            anyhow::bail!("forge {} failed with {}", args.join(" "), status);
        }
        Ok(())
    }
}

impl StepExecutor for ForgeStepExecutor {
    async fn prepare(&self) -> Result<(), StepError> {
        if self.config.dry_run {
            tracing::info!("Dry run mode, skipping build");
            return Ok(());
        }

        tracing::info!("Building contracts");
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        self.run_forge(&["clean".to_string()])
            .await
            .map_err(StepError::fatal)?;
        self.run_forge(&build_args(threads))
            .await
            .map_err(StepError::fatal)?;

        tracing::info!("Contracts built");
        Ok(())
    }

    async fn execute(&self, network: &str, step: Step, resume: bool) -> Result<(), StepError> {
        let env = self.environment(network).map_err(StepError::fatal)?;
        match step.script() {
            Some(script) => self.run_script(&env, step, script, resume).await,
            None => self.verify(&env).await,
        }
    }

    fn resume_evidence(&self, network: &str, step: Step) -> Option<PathBuf> {
        let script = step.script()?;
        let env = self.environment(network).ok()?;
        Some(broadcast::latest_run(
            &self.config.broadcast_root(),
            script,
            env.chain_id(),
        ))
    }
}

/// Address of the account controlled by `private_key`.
pub fn sender_address(private_key: &str) -> Result<Address> {
    let signer: PrivateKeySigner = private_key
        .trim()
        .parse()
        .context("Invalid deployer private key")?;
    Ok(Address::from_slice(signer.address().as_slice()))
}

/// Short hash of the checked out commit.
pub async fn git_commit(root: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .current_dir(root)
        .output()
        .await
        .context("Failed to run git")?;

    if !output.status.success() {
        anyhow::bail!(
            "Failed to get git commit hash: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
