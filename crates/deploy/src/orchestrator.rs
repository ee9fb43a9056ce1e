//! Per-network step sequencing.

use std::time::Duration;

use crate::{
    config::{ReleaseConfig, RetryConfig},
    error::StepError,
    retry::{ResumeEvidence, ResumeToken, RetryController},
    runner::StepExecutor,
    state::{DeploymentState, StateStore, Step},
};

/// Knobs of the per-network state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub retry: RetryConfig,
    /// How recent a broadcast log must be to resume it on the first attempt.
    pub resume_window: Duration,
    /// Pause before wiring during which Ctrl+C cancels the release.
    pub wiring_grace: Duration,
    /// Replaces every policy's delay between attempts when set.
    pub retry_delay: Option<Duration>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&ReleaseConfig::default())
    }
}

impl From<&ReleaseConfig> for OrchestratorSettings {
    fn from(config: &ReleaseConfig) -> Self {
        Self {
            retry: config.retry,
            resume_window: config.resume_window(),
            wiring_grace: config.wiring_grace(),
            retry_delay: None,
        }
    }
}

impl OrchestratorSettings {
    fn controller(&self, step: Step) -> RetryController {
        let controller = RetryController::new(self.retry.for_step(step));
        match self.retry_delay {
            Some(delay) => controller.with_delay(delay),
            None => controller,
        }
    }
}

/// A network that stopped at `step`.
#[derive(Debug, thiserror::Error)]
#[error("{network} failed at step {step}: {source}")]
pub struct NetworkFailure {
    pub network: String,
    pub step: Step,
    #[source]
    pub source: StepError,
}

/// Drives the remaining steps of one network, in order, persisting after each.
pub struct NetworkOrchestrator<'a, E> {
    executor: &'a E,
    store: &'a StateStore,
    settings: OrchestratorSettings,
}

impl<'a, E: StepExecutor> NetworkOrchestrator<'a, E> {
    pub fn new(executor: &'a E, store: &'a StateStore, settings: OrchestratorSettings) -> Self {
        Self {
            executor,
            store,
            settings,
        }
    }

    /// Run the steps of `network` that `state` does not record as done.
    ///
    /// Stops at the first step whose retries are exhausted. Every step
    /// completed before that is already persisted.
    pub async fn run(
        &self,
        network: &str,
        state: &mut DeploymentState,
    ) -> Result<(), NetworkFailure> {
        let remaining = state.network(network).remaining_steps();
        if remaining.is_empty() {
            tracing::info!(network, "Network already complete");
            return Ok(());
        }

        tracing::info!(network, resume_at = %remaining[0], "Deploying network");

        for step in remaining {
            let fail = |source| NetworkFailure {
                network: network.to_string(),
                step,
                source,
            };

            tracing::info!(
                network,
                %step,
                "Step {}/{}: {}",
                step.position(),
                Step::ALL.len(),
                step.label()
            );

            if step == Step::Wiring {
                self.wiring_checkpoint(network).await.map_err(fail)?;
            }

            self.run_step(network, step).await.map_err(fail)?;

            state.network_mut(network).complete(step);
            self.store
                .save(state)
                .map_err(|e| fail(StepError::Fatal(e)))?;
            tracing::info!(network, %step, "Step completed");
        }

        tracing::info!(network, "Network complete");
        Ok(())
    }

    /// Wire `networks` again, in order, outside of a release.
    ///
    /// Wiring configures only the wired network's side of each connection,
    /// against the peer configs on disk at that moment. A network wired
    /// before a peer was redeployed keeps pointing at the old peer until it
    /// is wired again. The release state is not touched.
    pub async fn rewire(&self, networks: &[String]) -> Result<(), NetworkFailure> {
        let fail = |network: &str, source| NetworkFailure {
            network: network.to_string(),
            step: Step::Wiring,
            source,
        };

        let Some(first) = networks.first() else {
            return Ok(());
        };
        self.wiring_checkpoint(first)
            .await
            .map_err(|e| fail(first, e))?;

        for (index, network) in networks.iter().enumerate() {
            tracing::info!(
                network = %network,
                "Wiring {}/{}: {}",
                index + 1,
                networks.len(),
                network
            );
            self.run_step(network, Step::Wiring)
                .await
                .map_err(|e| fail(network, e))?;
        }

        tracing::info!(networks = ?networks, "Adapters wired");
        Ok(())
    }

    async fn run_step(&self, network: &str, step: Step) -> Result<(), StepError> {
        let resume = ResumeToken::new();
        let evidence_path = self.executor.resume_evidence(network, step);
        let evidence = evidence_path.as_deref().map(|artifact| ResumeEvidence {
            artifact,
            window: self.settings.resume_window,
        });

        let label = format!("{}:{}", network, step);
        self.settings
            .controller(step)
            .retry(&label, &resume, evidence, || {
                self.executor.execute(network, step, resume.is_set())
            })
            .await
    }

    /// Announce wiring and give the operator a chance to stop the release.
    async fn wiring_checkpoint(&self, network: &str) -> Result<(), StepError> {
        let grace = self.settings.wiring_grace;
        if grace.is_zero() {
            return Ok(());
        }

        tracing::warn!(
            network,
            "Wiring adapters in {}s, press Ctrl+C to stop the release",
            grace.as_secs()
        );

        tokio::select! {
            _ = tokio::time::sleep(grace) => Ok(()),
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!(network, "Received Ctrl+C, release cancelled before wiring");
                Err(StepError::Cancelled)
            }
        }
    }
}
