//! Merge of deployment artifacts into the persisted network configuration.
//!
//! The network config is the system of record read by downstream tooling, so
//! it is only ever replaced as a whole: the file is backed up, the merged
//! document is written through a temp file, and any failure restores the
//! backup.

use std::{fmt, path::Path, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    broadcast::BroadcastLog,
    error::MergeError,
    fs::FsHandler,
    network_config::{ContractEntry, ContractRecord, DeploymentArtifact, DeploymentInfo, NetworkConfig},
};

/// Timestamp format used in `deploymentInfo`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Tunable policy for detecting the first block of the current deployment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StartBlockPolicy {
    /// Smallest gap between two consecutive blocks that separates deployments.
    pub min_gap: u64,
    /// Gap threshold as a fraction of the median block.
    pub median_fraction: f64,
}

impl Default for StartBlockPolicy {
    fn default() -> Self {
        Self {
            min_gap: 10_000,
            median_fraction: 0.10,
        }
    }
}

impl StartBlockPolicy {
    /// The first block of the current deployment among `blocks`.
    ///
    /// Contracts carried over from earlier deployments keep their old block
    /// numbers and show up as a low cluster separated from the current
    /// deployment by a large gap. The blocks after the last such gap belong to
    /// the current deployment.
    pub fn detect(&self, blocks: &[u64]) -> Option<u64> {
        if blocks.len() <= 2 {
            return blocks.iter().min().copied();
        }

        let mut sorted = blocks.to_vec();
        sorted.sort_unstable();

        let median = sorted[(sorted.len() - 1) / 2];
        let threshold = (self.min_gap as f64).max(median as f64 * self.median_fraction);

        let last_gap = sorted
            .windows(2)
            .enumerate()
            .filter(|(_, pair)| (pair[1] - pair[0]) as f64 > threshold)
            .map(|(i, _)| i + 1)
            .last();

        match last_gap {
            Some(start) => {
                tracing::debug!(
                    dropped = start,
                    threshold,
                    "Ignoring blocks of contracts from earlier deployments"
                );
                Some(sorted[start])
            }
            None => sorted.first().copied(),
        }
    }
}

/// Provenance recorded in `deploymentInfo` for a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentStamp {
    pub git_commit: String,
    pub version: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeploymentStamp {
    pub fn new(git_commit: impl Into<String>, version: Option<String>) -> Self {
        Self {
            git_commit: git_commit.into(),
            version,
            timestamp: Utc::now(),
        }
    }

    /// Stamp the deployment with the time the artifact was written.
    pub fn at_artifact(mut self, artifact: &Path) -> Self {
        if let Ok(modified) = std::fs::metadata(artifact).and_then(|m| m.modified()) {
            self.timestamp = modified.into();
        }
        self
    }
}

/// What a merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub contracts: usize,
    /// Contracts whose block and tx hash came from this run's data.
    pub resolved: usize,
    /// Contracts that kept metadata from a previous merge.
    pub preserved: usize,
    /// Contracts without block metadata.
    pub unresolved: usize,
    pub start_block: Option<u64>,
}

impl fmt::Display for MergeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} contracts merged ({} resolved, {} preserved, {} unresolved)",
            self.contracts, self.resolved, self.preserved, self.unresolved
        )?;
        match self.start_block {
            Some(block) => write!(f, ", start block {}", block),
            None => write!(f, ", start block unknown"),
        }
    }
}

/// Result of a merge gated by the artifact freshness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged(MergeReport),
    /// The artifact was too old and the operator did not confirm.
    SkippedStale { age: Duration },
}

/// Operator confirmation for actions that may overwrite good data.
pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Declines everything. Used when nobody can answer a prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decline;

impl Confirm for Decline {
    fn confirm(&self, _prompt: &str) -> bool {
        false
    }
}

/// Accepts everything (`--yes`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

/// Refuses artifacts older than `max_age` unless the operator confirms.
pub struct FreshnessGuard<'a> {
    pub max_age: Duration,
    pub confirm: &'a dyn Confirm,
}

impl FreshnessGuard<'_> {
    /// Returns the artifact age if it is stale and the operator declined.
    pub fn check(&self, artifact: &Path) -> Result<Option<Duration>, MergeError> {
        let age = FsHandler::file_age(artifact).map_err(|source| MergeError::Artifact {
            path: artifact.to_path_buf(),
            source,
        })?;

        if age <= self.max_age {
            return Ok(None);
        }

        let hours = age.as_secs() / 3600;
        tracing::warn!(
            artifact = %artifact.display(),
            age_hours = hours,
            "Deployment artifact is older than {} hours",
            self.max_age.as_secs() / 3600
        );
        let prompt = format!(
            "{} is {} hours old and will replace the contracts in the network config. Proceed?",
            artifact.display(),
            hours
        );
        if self.confirm.confirm(&prompt) {
            Ok(None)
        } else {
            Ok(Some(age))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Resolved,
    Preserved,
    Unresolved,
}

/// Merges deployment artifacts into network configs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigMerger {
    policy: StartBlockPolicy,
}

impl ConfigMerger {
    pub fn new(policy: StartBlockPolicy) -> Self {
        Self { policy }
    }

    /// Merge the artifact at `artifact_path` unless it is stale and the
    /// operator declines. A skipped merge leaves the config untouched.
    pub fn merge_gated(
        &self,
        guard: &FreshnessGuard<'_>,
        config_path: &Path,
        artifact_path: &Path,
        broadcast: Option<&BroadcastLog>,
        step_name: &str,
        stamp: &DeploymentStamp,
    ) -> Result<MergeOutcome, MergeError> {
        if !config_path.is_file() {
            return Err(MergeError::ConfigNotFound(config_path.to_path_buf()));
        }
        if let Some(age) = guard.check(artifact_path)? {
            tracing::warn!(config = %config_path.display(), "Skipping config merge of a stale artifact");
            return Ok(MergeOutcome::SkippedStale { age });
        }

        let artifact =
            DeploymentArtifact::load(artifact_path).map_err(|source| MergeError::Artifact {
                path: artifact_path.to_path_buf(),
                source,
            })?;
        self.merge(config_path, &artifact, broadcast, step_name, stamp)
            .map(MergeOutcome::Merged)
    }

    /// Merge `artifact` into the config file at `config_path`.
    ///
    /// On any failure after the backup was taken, the backup is restored and
    /// the original error returned. If the restore fails too, both errors are
    /// reported.
    pub fn merge(
        &self,
        config_path: &Path,
        artifact: &DeploymentArtifact,
        broadcast: Option<&BroadcastLog>,
        step_name: &str,
        stamp: &DeploymentStamp,
    ) -> Result<MergeReport, MergeError> {
        if !config_path.is_file() {
            return Err(MergeError::ConfigNotFound(config_path.to_path_buf()));
        }

        let backup_err = |source| MergeError::Backup {
            path: config_path.to_path_buf(),
            source,
        };
        let original = std::fs::read(config_path).map_err(backup_err)?;
        let digest = FsHandler::digest(&original);

        let backup = FsHandler::sibling(config_path, "bak");
        std::fs::copy(config_path, &backup).map_err(backup_err)?;
        tracing::debug!(backup = %backup.display(), "Network config backed up");

        match self.replace(config_path, &original, &digest, artifact, broadcast, step_name, stamp) {
            Ok(report) => {
                if let Err(e) = std::fs::remove_file(&backup) {
                    tracing::warn!(backup = %backup.display(), error = %e, "Failed to remove config backup");
                }
                tracing::info!(config = %config_path.display(), "{}", report);
                Ok(report)
            }
            Err(e) => Err(Self::abort(config_path, &backup, &digest, e)),
        }
    }

    /// Put the backup back after `cause` and return the error to report.
    fn abort(config_path: &Path, backup: &Path, digest: &str, cause: MergeError) -> MergeError {
        tracing::error!(config = %config_path.display(), error = %cause, "Config merge failed, restoring backup");
        match Self::restore(config_path, backup, digest) {
            Ok(()) => cause,
            Err(restore) => {
                tracing::error!(config = %config_path.display(), backup = %backup.display(), error = %restore, "Config backup could not be restored");
                MergeError::Unrestored {
                    cause: Box::new(cause),
                    restore: Box::new(restore),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn replace(
        &self,
        config_path: &Path,
        original: &[u8],
        digest: &str,
        artifact: &DeploymentArtifact,
        broadcast: Option<&BroadcastLog>,
        step_name: &str,
        stamp: &DeploymentStamp,
    ) -> Result<MergeReport, MergeError> {
        let mut config: NetworkConfig =
            serde_json::from_slice(original).map_err(|source| MergeError::Parse {
                path: config_path.to_path_buf(),
                source,
            })?;

        let report = self.apply(&mut config, artifact, broadcast, step_name, stamp);

        let json = config.to_json().map_err(|source| MergeError::Write {
            path: config_path.to_path_buf(),
            source,
        })?;

        let current = std::fs::read(config_path).map_err(|e| MergeError::Write {
            path: config_path.to_path_buf(),
            source: e.into(),
        })?;
        if FsHandler::digest(&current) != digest {
            return Err(MergeError::ConcurrentModification(config_path.to_path_buf()));
        }

        FsHandler::write_atomic(config_path, json).map_err(|source| MergeError::Write {
            path: config_path.to_path_buf(),
            source,
        })?;

        Ok(report)
    }

    fn restore(config_path: &Path, backup: &Path, digest: &str) -> Result<(), MergeError> {
        let restore_err = |source| MergeError::Restore {
            path: config_path.to_path_buf(),
            source,
        };
        std::fs::copy(backup, config_path).map_err(restore_err)?;

        let restored = std::fs::read(config_path).map_err(restore_err)?;
        if FsHandler::digest(&restored) != digest {
            return Err(MergeError::RestoreMismatch(config_path.to_path_buf()));
        }

        std::fs::remove_file(backup).map_err(restore_err)?;
        tracing::info!(config = %config_path.display(), "Network config restored from backup");
        Ok(())
    }

    /// Apply `artifact` to an in-memory config.
    pub fn apply(
        &self,
        config: &mut NetworkConfig,
        artifact: &DeploymentArtifact,
        broadcast: Option<&BroadcastLog>,
        step_name: &str,
        stamp: &DeploymentStamp,
    ) -> MergeReport {
        let mut report = MergeReport {
            contracts: artifact.contracts.len(),
            ..Default::default()
        };
        let mut blocks = Vec::with_capacity(artifact.contracts.len());

        for (name, entry) in &artifact.contracts {
            let (record, resolution) = Self::resolve(entry, config.contracts.get(name), broadcast);
            match resolution {
                Resolution::Resolved => report.resolved += 1,
                Resolution::Preserved => report.preserved += 1,
                Resolution::Unresolved => report.unresolved += 1,
            }
            if resolution == Resolution::Unresolved {
                tracing::debug!(contract = %name, address = %record.address, "No block metadata found");
            }
            blocks.extend(record.block_number);
            config
                .contracts
                .insert(name.clone(), ContractEntry::Record(record));
        }

        let previous_start = config
            .deployment_info
            .get(step_name)
            .and_then(|info| info.start_block);

        report.start_block = if let Some(explicit) = artifact.deployment_start_block {
            Some(explicit)
        } else if report.resolved > 0 {
            self.policy.detect(&blocks).or(previous_start)
        } else {
            previous_start
        };

        let extra = config
            .deployment_info
            .get(step_name)
            .map(|info| info.extra.clone())
            .unwrap_or_default();
        config.deployment_info.insert(
            step_name.to_string(),
            DeploymentInfo {
                git_commit: stamp.git_commit.clone(),
                timestamp: stamp.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                version: stamp.version.clone(),
                start_block: report.start_block,
                extra,
            },
        );

        report
    }

    /// Block and tx hash of one contract: this run's broadcast first, then the
    /// artifact itself, then whatever the config already knew for the same
    /// address.
    fn resolve(
        entry: &ContractEntry,
        existing: Option<&ContractEntry>,
        broadcast: Option<&BroadcastLog>,
    ) -> (ContractRecord, Resolution) {
        let address = entry.address();

        if let Some(deployment) = broadcast.and_then(|log| log.lookup(&address)) {
            let block_number = deployment.block_number.or_else(|| {
                existing
                    .filter(|e| e.address() == address)
                    .and_then(|e| e.block_number())
            });
            return (
                ContractRecord {
                    address,
                    block_number,
                    tx_hash: Some(deployment.tx_hash),
                },
                Resolution::Resolved,
            );
        }

        let previous = existing.filter(|e| e.address() == address);

        if entry.block_number().is_some() || entry.tx_hash().is_some() {
            let mut record = entry.clone().into_record();
            if let Some(previous) = previous {
                record.block_number = record.block_number.or(previous.block_number());
                record.tx_hash = record.tx_hash.or(previous.tx_hash());
            }
            return (record, Resolution::Resolved);
        }

        match previous {
            Some(previous) if previous.block_number().is_some() || previous.tx_hash().is_some() => {
                (previous.clone().into_record(), Resolution::Preserved)
            }
            _ => (ContractRecord::unresolved(address), Resolution::Unresolved),
        }
    }
}
