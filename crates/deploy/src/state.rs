//! Durable release progress.
//!
//! The release state records, per network, which of the four release steps
//! have completed. It is written after every successful step so that an
//! interrupted release resumes exactly where it stopped.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::fs::FsHandler;

/// One discrete action in a network's release sequence.
///
/// Steps always run in declaration order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Step {
    Protocol,
    Verification,
    Wiring,
    TestData,
}

impl Step {
    /// All steps, in execution order.
    pub const ALL: [Step; 4] = [
        Step::Protocol,
        Step::Verification,
        Step::Wiring,
        Step::TestData,
    ];

    /// 1-based position of the step, for "Step k/4" progress lines.
    pub fn position(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).unwrap_or_default() + 1
    }

    /// The deployment script run by this step, if any.
    pub fn script(&self) -> Option<&'static str> {
        match self {
            Step::Protocol => Some("LaunchDeployer"),
            Step::Verification => None,
            Step::Wiring => Some("WireAdapters"),
            Step::TestData => Some("TestData"),
        }
    }

    /// Human readable label used in logs and the summary table.
    pub fn label(&self) -> &'static str {
        match self {
            Step::Protocol => "Protocol",
            Step::Verification => "Verification",
            Step::Wiring => "Wiring",
            Step::TestData => "Test Data",
        }
    }
}

/// Completion flags of one network.
///
/// No flag may be set while an earlier one is unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    #[serde(default)]
    pub protocol: bool,
    #[serde(default)]
    pub verification: bool,
    #[serde(default)]
    pub wiring: bool,
    #[serde(default)]
    pub test_data: bool,
}

impl NetworkState {
    pub fn is_done(&self, step: Step) -> bool {
        match step {
            Step::Protocol => self.protocol,
            Step::Verification => self.verification,
            Step::Wiring => self.wiring,
            Step::TestData => self.test_data,
        }
    }

    /// Mark `step` as completed.
    ///
    /// Panics in debug builds if an earlier step is still pending.
    pub fn complete(&mut self, step: Step) {
        debug_assert!(
            Step::ALL
                .iter()
                .take_while(|s| **s != step)
                .all(|s| self.is_done(*s)),
            "step {step} completed before its predecessors"
        );

        match step {
            Step::Protocol => self.protocol = true,
            Step::Verification => self.verification = true,
            Step::Wiring => self.wiring = true,
            Step::TestData => self.test_data = true,
        }
    }

    pub fn is_complete(&self) -> bool {
        Step::ALL.iter().all(|s| self.is_done(*s))
    }

    /// The first step that has not completed yet.
    pub fn next_step(&self) -> Option<Step> {
        Step::ALL.into_iter().find(|s| !self.is_done(*s))
    }

    /// Steps still to run, in order.
    pub fn remaining_steps(&self) -> Vec<Step> {
        Step::ALL
            .into_iter()
            .skip_while(|s| self.is_done(*s))
            .collect()
    }

    /// Enforce monotonic progress: everything after the first pending step is
    /// reset. Returns true if anything changed.
    pub fn normalize(&mut self) -> bool {
        let Some(next) = self.next_step() else {
            return false;
        };

        let before = *self;
        let mut normalized = Self::default();
        for step in Step::ALL.into_iter().take_while(|s| *s != next) {
            normalized.complete(step);
        }
        *self = normalized;
        before != normalized
    }
}

/// Progress of one release attempt across all networks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentState {
    /// The release version. `None` for a state that was never started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub networks: IndexMap<String, NetworkState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Name of the network the last run stopped at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
}

impl DeploymentState {
    /// A fresh state for `version`.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Whether no release has been started in this state.
    pub fn is_fresh(&self) -> bool {
        self.version.is_none()
    }

    pub fn network(&self, name: &str) -> NetworkState {
        self.networks.get(name).copied().unwrap_or_default()
    }

    pub fn network_mut(&mut self, name: &str) -> &mut NetworkState {
        self.networks.entry(name.to_string()).or_default()
    }
}

/// JSON file backed persistence of the [`DeploymentState`].
///
/// The store assumes a single writer. Two releases running against the same
/// state path will race.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state.
    ///
    /// A missing or unreadable file yields an empty state: corrupt progress
    /// degrades to starting fresh instead of aborting the release.
    pub fn load(&self) -> DeploymentState {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No release state found, starting fresh");
                return DeploymentState::default();
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read release state, starting fresh");
                return DeploymentState::default();
            }
        };

        let mut state: DeploymentState = match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Release state is corrupt, starting fresh");
                return DeploymentState::default();
            }
        };

        for (network, progress) in state.networks.iter_mut() {
            if progress.normalize() {
                tracing::warn!(
                    network = %network,
                    resumes_at = ?progress.next_step(),
                    "Release state had steps completed out of order, resetting later steps"
                );
            }
        }

        tracing::debug!(path = %self.path.display(), version = ?state.version, "Release state loaded");
        state
    }

    /// Atomically overwrite the persisted state.
    pub fn save(&self, state: &DeploymentState) -> Result<()> {
        let json =
            serde_json::to_string_pretty(state).context("Failed to serialize release state")?;
        FsHandler::write_atomic(&self.path, json)
            .with_context(|| format!("Failed to save release state to {}", self.path.display()))?;
        tracing::trace!(path = %self.path.display(), "Release state saved");
        Ok(())
    }

    /// Delete the persisted state. A missing file is not an error.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "Release state cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to delete release state {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tempdir::TempDir;

    fn store() -> (TempDir, StateStore) {
        let temp_dir = TempDir::new("forgeship-state").expect("Failed to create temp dir");
        let store = StateStore::new(temp_dir.path().join("release-state.json"));
        (temp_dir, store)
    }

    #[test]
    fn test_load_missing_file_is_fresh() {
        let (_dir, store) = store();
        let state = store.load();
        assert!(state.is_fresh());
        assert!(state.networks.is_empty());
    }

    #[test]
    fn test_load_corrupt_file_is_fresh() {
        let (_dir, store) = store();
        std::fs::write(store.path(), "{ invalid json }").unwrap();
        assert_eq!(store.load(), DeploymentState::default());
    }

    #[test]
    fn test_save_then_load() {
        let (_dir, store) = store();
        let mut state = DeploymentState::new("v3");
        state.network_mut("sepolia").complete(Step::Protocol);
        state.network_mut("sepolia").complete(Step::Verification);
        state.failed_at = Some("sepolia".to_string());

        store.save(&state).expect("Failed to save state");
        let loaded = store.load();

        assert_eq!(loaded, state);
        assert_eq!(loaded.network("sepolia").next_step(), Some(Step::Wiring));
    }

    #[test]
    fn test_persisted_keys_are_camel_case() {
        let (_dir, store) = store();
        let mut state = DeploymentState::new("v1");
        state.network_mut("base-sepolia");
        store.save(&state).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], "v1");
        assert!(raw["startedAt"].is_string());
        assert_eq!(raw["networks"]["base-sepolia"]["testData"], false);
        assert!(raw.get("completedAt").is_none());
    }

    #[test]
    fn test_clear() {
        let (_dir, store) = store();
        store.save(&DeploymentState::new("v1")).unwrap();
        store.clear().expect("Failed to clear");
        assert!(!store.path().exists());
        // Clearing twice is fine.
        store.clear().expect("Second clear should succeed");
    }

    #[test]
    fn test_load_normalizes_out_of_order_progress() {
        let (_dir, store) = store();
        std::fs::write(
            store.path(),
            r#"{"version":"v2","networks":{"sepolia":{"protocol":true,"verification":false,"wiring":true,"testData":true}}}"#,
        )
        .unwrap();

        let state = store.load();
        assert_eq!(
            state.network("sepolia"),
            NetworkState {
                protocol: true,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_remaining_steps() {
        let mut progress = NetworkState::default();
        assert_eq!(progress.remaining_steps(), Step::ALL.to_vec());

        progress.complete(Step::Protocol);
        assert_eq!(
            progress.remaining_steps(),
            vec![Step::Verification, Step::Wiring, Step::TestData]
        );

        for step in Step::ALL {
            progress.complete(step);
        }
        assert!(progress.is_complete());
        assert!(progress.remaining_steps().is_empty());
        assert_eq!(progress.next_step(), None);
    }

    #[test]
    fn test_step_names() {
        assert_eq!(Step::TestData.to_string(), "test-data");
        assert_eq!(Step::from_str("verification").unwrap(), Step::Verification);
        assert_eq!(Step::Wiring.position(), 3);
        assert_eq!(Step::Protocol.script(), Some("LaunchDeployer"));
        assert_eq!(Step::Verification.script(), None);
    }
}
