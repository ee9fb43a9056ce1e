//! Bounded retries with fixed backoff and resume-marker injection.
//!
//! A failed broadcast may have confirmed part of its transactions on-chain.
//! Re-submitting from scratch would reuse nonces or double-spend, so every
//! attempt after a failure runs with the resume marker set.

use std::{
    future::Future,
    path::Path,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use backon::{ConstantBuilder, Retryable};
use serde::{Deserialize, Serialize};

use crate::{error::StepError, fs::FsHandler};

/// Retry budget for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: usize,
    /// Pause between two attempts, in seconds.
    pub delay_secs: u64,
}

impl RetryPolicy {
    pub const fn new(max_attempts: usize, delay_secs: u64) -> Self {
        Self {
            max_attempts,
            delay_secs,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 5)
    }
}

/// Flag telling the script runner to continue a previous broadcast.
#[derive(Debug, Default)]
pub struct ResumeToken(AtomicBool);

impl ResumeToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Evidence of a partially completed prior run of the same step.
#[derive(Debug, Clone, Copy)]
pub struct ResumeEvidence<'a> {
    /// Broadcast artifact written by the script runner.
    pub artifact: &'a Path,
    /// How recent the artifact must be to count as the same release attempt.
    pub window: Duration,
}

/// Wraps a step with bounded retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryController {
    policy: RetryPolicy,
    delay: Duration,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            delay: policy.delay(),
            policy,
        }
    }

    /// Override the pause between attempts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Run `operation` until it succeeds, it fails with a non-retryable error,
    /// or `max_attempts` attempts have failed.
    ///
    /// If `evidence` points to a recent broadcast artifact, `resume` is set
    /// before the first attempt. Every retryable failure short of the last
    /// attempt sets `resume` and waits for the configured delay.
    pub async fn retry<F, Fut>(
        &self,
        label: &str,
        resume: &ResumeToken,
        evidence: Option<ResumeEvidence<'_>>,
        mut operation: F,
    ) -> Result<(), StepError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), StepError>>,
    {
        if let Some(evidence) = evidence {
            if FsHandler::modified_within(evidence.artifact, evidence.window) {
                tracing::info!(
                    step = label,
                    artifact = %evidence.artifact.display(),
                    "Found a recent broadcast from a previous attempt, resuming it"
                );
                resume.set();
            }
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let attempt = AtomicUsize::new(0);

        let backoff = ConstantBuilder::default()
            .with_delay(self.delay)
            .with_max_times(max_attempts - 1);

        let result = (|| {
            let n = attempt.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::info!(step = label, "Attempt {}/{}", n, max_attempts);
            operation()
        })
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .when(|e: &StepError| e.is_retryable())
        .notify(|e: &StepError, delay: Duration| {
            if !resume.is_set() {
                resume.set();
            }
            tracing::warn!(
                step = label,
                error = %e,
                "Attempt failed, retrying with resume in {:?}",
                delay
            );
        })
        .await;

        if let Err(e) = &result {
            let attempts = attempt.load(Ordering::SeqCst);
            if e.is_retryable() {
                tracing::error!(step = label, error = %e, "Giving up after {} attempts", attempts);
            } else {
                tracing::error!(step = label, error = %e, "Step failed with a non-retryable error");
            }
        }

        result
    }
}
