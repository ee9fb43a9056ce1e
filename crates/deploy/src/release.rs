//! Multi-network release coordination.

use std::fmt;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use comfy_table::{Table, presets::UTF8_FULL};

use crate::{
    orchestrator::{NetworkOrchestrator, OrchestratorSettings},
    runner::StepExecutor,
    state::{DeploymentState, NetworkState, StateStore, Step},
};

/// Where a release stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFailure {
    pub network: String,
    pub step: Option<Step>,
    pub reason: Option<String>,
}

/// Outcome of a release, or the persisted progress of one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseReport {
    pub version: Option<String>,
    /// The networks of this release, in order.
    pub networks: Vec<(String, NetworkState)>,
    /// Networks the state knows that this release does not cover.
    pub others: Vec<(String, NetworkState)>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure: Option<ReleaseFailure>,
}

impl ReleaseReport {
    /// Summarize `state` for `networks`. Other networks the state knows are
    /// listed but do not count towards the outcome.
    pub fn from_state(state: &DeploymentState, networks: &[String]) -> Self {
        let rows = networks
            .iter()
            .map(|name| (name.clone(), state.network(name)))
            .collect();
        let others = state
            .networks
            .iter()
            .filter(|(name, _)| !networks.contains(name))
            .map(|(name, progress)| (name.clone(), *progress))
            .collect();

        let failure = state.failed_at.as_ref().map(|network| ReleaseFailure {
            network: network.clone(),
            step: state.network(network).next_step(),
            reason: None,
        });

        Self {
            version: state.version.clone(),
            networks: rows,
            others,
            started_at: state.started_at,
            completed_at: state.completed_at,
            failure,
        }
    }

    /// Every network of the release completed every step.
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.networks.iter().all(|(_, s)| s.is_complete())
    }
}

fn step_cell(done: bool) -> &'static str {
    if done { "[ok]" } else { "-" }
}

impl fmt::Display for ReleaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => writeln!(f, "Release {}", version)?,
            None => writeln!(f, "No release in progress")?,
        }
        if let Some(started) = self.started_at {
            writeln!(f, "Started:   {}", started.format("%Y-%m-%d %H:%M:%S UTC"))?;
        }
        if let Some(completed) = self.completed_at {
            writeln!(f, "Completed: {}", completed.format("%Y-%m-%d %H:%M:%S UTC"))?;
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);

        let mut header = vec!["Network"];
        header.extend(Step::ALL.iter().map(|s| s.label()));
        header.push("Status");
        table.set_header(header);

        for (name, progress) in &self.networks {
            let status = match (&self.failure, progress.next_step()) {
                (_, None) => "complete".to_string(),
                (Some(failure), Some(step)) if failure.network == *name => {
                    format!("FAILED at {}", step)
                }
                (_, Some(step)) if step == Step::Protocol => "pending".to_string(),
                (_, Some(step)) => format!("stopped before {}", step),
            };

            let mut row: Vec<String> = vec![name.clone()];
            row.extend(
                Step::ALL
                    .iter()
                    .map(|s| step_cell(progress.is_done(*s)).to_string()),
            );
            row.push(status);
            table.add_row(row);
        }
        for (name, progress) in &self.others {
            let mut row: Vec<String> = vec![name.clone()];
            row.extend(
                Step::ALL
                    .iter()
                    .map(|s| step_cell(progress.is_done(*s)).to_string()),
            );
            row.push("not in this release".to_string());
            table.add_row(row);
        }
        writeln!(f, "{}", table)?;

        match &self.failure {
            Some(failure) => {
                write!(f, "Release FAILED at {}", failure.network)?;
                if let Some(step) = failure.step {
                    write!(f, " ({})", step)?;
                }
                if let Some(reason) = &failure.reason {
                    write!(f, ": {}", reason)?;
                }
                writeln!(f)?;
                writeln!(f, "Run the release again with the same version to resume.")
            }
            None if self.is_success() => writeln!(f, "Release complete"),
            None => writeln!(f, "Release incomplete"),
        }
    }
}

/// Runs a release across networks, one network at a time.
pub struct ReleaseCoordinator<E> {
    executor: E,
    store: StateStore,
    settings: OrchestratorSettings,
}

impl<E: StepExecutor> ReleaseCoordinator<E> {
    pub fn new(executor: E, store: StateStore, settings: OrchestratorSettings) -> Self {
        Self {
            executor,
            store,
            settings,
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Release `version` to `networks`, in order.
    ///
    /// Progress of an earlier run of the same version is resumed. A different
    /// version starts over. The first network that fails stops the release and
    /// is reported in the returned [`ReleaseReport`]; `Err` is reserved for
    /// failures outside the steps (state persistence, preparatory build).
    pub async fn run(&self, networks: &[String], version: &str) -> Result<ReleaseReport> {
        let mut state = self.store.load();

        if let Some(previous) = &state.version {
            if previous != version {
                tracing::warn!(
                    previous = %previous,
                    version,
                    "Release state belongs to another version, starting over"
                );
                self.store.clear()?;
                state = DeploymentState::default();
            }
        }

        if state.is_fresh() {
            tracing::info!(version, "Starting release");
            self.executor
                .prepare()
                .await
                .context("Preparatory build failed")?;
            state = DeploymentState::new(version);
            self.store.save(&state)?;
        } else {
            tracing::info!(version, "Resuming release");
        }

        let orchestrator = NetworkOrchestrator::new(&self.executor, &self.store, self.settings);
        for (index, network) in networks.iter().enumerate() {
            if state.network(network).is_complete() {
                tracing::info!(network = %network, "Network already released, skipping");
                continue;
            }

            tracing::info!(
                network = %network,
                "=== Network {}/{}: {} ===",
                index + 1,
                networks.len(),
                network
            );

            if let Err(failure) = orchestrator.run(network, &mut state).await {
                tracing::error!(network = %network, step = %failure.step, error = %failure.source, "Release failed");

                state.failed_at = Some(network.clone());
                self.store.save(&state)?;

                let mut report = ReleaseReport::from_state(&state, networks);
                report.failure = Some(ReleaseFailure {
                    network: failure.network,
                    step: Some(failure.step),
                    reason: Some(failure.source.to_string()),
                });
                return Ok(report);
            }
        }

        state.completed_at = Some(Utc::now());
        state.failed_at = None;
        self.store.save(&state)?;
        tracing::info!(version, networks = networks.len(), "Release complete");

        Ok(ReleaseReport::from_state(&state, networks))
    }
}
