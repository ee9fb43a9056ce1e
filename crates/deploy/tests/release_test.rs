//! Integration tests for the release engine.
//!
//! These tests drive the [`ReleaseCoordinator`] with a scripted executor that
//! records every call instead of running forge, so they need neither a network
//! nor any external tool. Retry delays are zero.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use forgeship_deploy::{
    DeploymentState, OrchestratorSettings, ReleaseCoordinator, RetryConfig, RetryPolicy,
    StateStore, Step, StepError, StepExecutor,
};
use tempdir::TempDir;

/// A call made to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Prepare,
    Execute {
        network: String,
        step: Step,
        resume: bool,
    },
}

/// Executor whose steps fail a scripted number of times.
#[derive(Default)]
struct ScriptedExecutor {
    /// Number of leading attempts of (network, step) that fail.
    failures: HashMap<(String, Step), usize>,
    attempts: Mutex<HashMap<(String, Step), usize>>,
    calls: Mutex<Vec<Call>>,
    prepared: AtomicUsize,
}

impl ScriptedExecutor {
    fn failing(mut self, network: &str, step: Step, attempts: usize) -> Self {
        self.failures.insert((network.to_string(), step), attempts);
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Steps executed on `network`, in order, with their resume flag.
    fn executed(&self, network: &str) -> Vec<(Step, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Execute {
                    network: n,
                    step,
                    resume,
                } if n == network => Some((step, resume)),
                _ => None,
            })
            .collect()
    }
}

impl StepExecutor for ScriptedExecutor {
    async fn prepare(&self) -> Result<(), StepError> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(Call::Prepare);
        Ok(())
    }

    async fn execute(&self, network: &str, step: Step, resume: bool) -> Result<(), StepError> {
        self.calls.lock().unwrap().push(Call::Execute {
            network: network.to_string(),
            step,
            resume,
        });

        let key = (network.to_string(), step);
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let attempt = attempts.entry(key.clone()).or_default();
            *attempt += 1;
            *attempt
        };

        match self.failures.get(&key) {
            Some(failures) if attempt <= *failures => match step {
                Step::Verification => Err(StepError::VerificationIncomplete {
                    deployed: 12,
                    verified: 9,
                    total: 12,
                }),
                _ => Err(StepError::transient(anyhow::anyhow!(
                    "forge script exited with 1"
                ))),
            },
            _ => Ok(()),
        }
    }

    fn resume_evidence(&self, _network: &str, _step: Step) -> Option<PathBuf> {
        None
    }
}

/// Test setup context: a temporary state file and instant retries.
struct TestContext {
    _temp_dir: TempDir,
    state_path: PathBuf,
}

impl TestContext {
    fn new(prefix: &str) -> Self {
        let temp_dir = TempDir::new(prefix).expect("Failed to create temp dir");
        let state_path = temp_dir.path().join(".release-state.json");
        Self {
            _temp_dir: temp_dir,
            state_path,
        }
    }

    fn store(&self) -> StateStore {
        StateStore::new(&self.state_path)
    }

    fn coordinator(&self, executor: ScriptedExecutor) -> ReleaseCoordinator<ScriptedExecutor> {
        let settings = OrchestratorSettings {
            retry: RetryConfig::uniform(RetryPolicy::new(3, 0)),
            retry_delay: Some(Duration::ZERO),
            wiring_grace: Duration::ZERO,
            ..Default::default()
        };
        ReleaseCoordinator::new(executor, self.store(), settings)
    }

    fn state(&self) -> DeploymentState {
        self.store().load()
    }
}

fn networks(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn test_complete_release_is_idempotent() {
    let ctx = TestContext::new("release-idempotent");
    let networks = networks(&["sepolia", "base-sepolia"]);

    let first = ctx.coordinator(ScriptedExecutor::default());
    let report = first.run(&networks, "v1").await.unwrap();
    assert!(report.is_success(), "first run should complete: {}", report);
    assert_eq!(first.executor().calls().len(), 1 + 2 * Step::ALL.len());

    let second = ctx.coordinator(ScriptedExecutor::default());
    let report = second.run(&networks, "v1").await.unwrap();
    assert!(report.is_success());
    assert!(
        second.executor().calls().is_empty(),
        "a completed release must not call the executor again"
    );
}

#[tokio::test]
async fn test_resume_reruns_only_the_failed_step() {
    let ctx = TestContext::new("release-resume");
    let networks = networks(&["sepolia", "base-sepolia"]);

    let first = ctx.coordinator(ScriptedExecutor::default().failing("base-sepolia", Step::Wiring, 3));
    let report = first.run(&networks, "v2").await.unwrap();
    assert!(!report.is_success());

    let state = ctx.state();
    assert_eq!(state.failed_at.as_deref(), Some("base-sepolia"));
    assert!(state.network("sepolia").is_complete());
    assert_eq!(state.network("base-sepolia").next_step(), Some(Step::Wiring));

    let second = ctx.coordinator(ScriptedExecutor::default());
    let report = second.run(&networks, "v2").await.unwrap();
    assert!(report.is_success());

    let executor = second.executor();
    assert!(executor.executed("sepolia").is_empty());
    assert_eq!(
        executor.executed("base-sepolia"),
        vec![(Step::Wiring, false), (Step::TestData, false)]
    );
    // The release already started, the build is not repeated.
    assert!(!executor.calls().contains(&Call::Prepare));
}

#[tokio::test]
async fn test_version_change_resets_progress() {
    let ctx = TestContext::new("release-version");
    let networks = networks(&["sepolia"]);

    let first = ctx.coordinator(ScriptedExecutor::default());
    assert!(first.run(&networks, "v1").await.unwrap().is_success());
    assert_eq!(ctx.state().version.as_deref(), Some("v1"));

    let second = ctx.coordinator(ScriptedExecutor::default());
    let report = second.run(&networks, "v2").await.unwrap();
    assert!(report.is_success());

    let executor = second.executor();
    assert_eq!(executor.prepared.load(Ordering::SeqCst), 1);
    let steps: Vec<Step> = executor.executed("sepolia").into_iter().map(|(s, _)| s).collect();
    assert_eq!(steps, Step::ALL.to_vec());
    assert_eq!(ctx.state().version.as_deref(), Some("v2"));
}

#[tokio::test]
async fn test_failure_stops_later_networks() {
    let ctx = TestContext::new("release-fail-fast");
    let networks = networks(&["sepolia", "base-sepolia", "arbitrum-sepolia"]);

    let coordinator =
        ctx.coordinator(ScriptedExecutor::default().failing("sepolia", Step::Protocol, 5));
    let report = coordinator.run(&networks, "v1").await.unwrap();

    assert!(!report.is_success());
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.network, "sepolia");
    assert_eq!(failure.step, Some(Step::Protocol));

    let executor = coordinator.executor();
    assert_eq!(
        executor.executed("sepolia"),
        vec![
            (Step::Protocol, false),
            (Step::Protocol, true),
            (Step::Protocol, true)
        ]
    );
    assert!(executor.executed("base-sepolia").is_empty());
    assert!(executor.executed("arbitrum-sepolia").is_empty());

    let state = ctx.state();
    assert_eq!(state.failed_at.as_deref(), Some("sepolia"));
    assert_eq!(state.completed_at, None);
}

#[tokio::test]
async fn test_release_across_two_networks_with_flaky_steps() {
    let ctx = TestContext::new("release-e2e");
    let networks = networks(&["sepolia", "base-sepolia"]);

    // Run 1: protocol on base-sepolia needs three attempts, verification never passes.
    let first = ctx.coordinator(
        ScriptedExecutor::default()
            .failing("base-sepolia", Step::Protocol, 2)
            .failing("base-sepolia", Step::Verification, 3),
    );
    let report = first.run(&networks, "v3").await.unwrap();

    assert!(!report.is_success());
    assert_eq!(
        report.failure.as_ref().map(|f| f.network.as_str()),
        Some("base-sepolia")
    );
    assert!(
        report.to_string().contains("FAILED at verification"),
        "summary should name the stuck step: {}",
        report
    );

    let executed = first.executor().executed("base-sepolia");
    assert_eq!(
        executed,
        vec![
            (Step::Protocol, false),
            (Step::Protocol, true),
            (Step::Protocol, true),
            (Step::Verification, false),
            (Step::Verification, true),
            (Step::Verification, true),
        ]
    );

    let state = ctx.state();
    assert_eq!(state.version.as_deref(), Some("v3"));
    assert_eq!(state.failed_at.as_deref(), Some("base-sepolia"));
    assert!(state.network("sepolia").is_complete());
    let base = state.network("base-sepolia");
    assert!(base.protocol);
    assert!(!base.verification);
    assert!(!base.wiring);
    assert!(!base.test_data);

    // Run 2: the explorer caught up.
    let second = ctx.coordinator(ScriptedExecutor::default());
    let report = second.run(&networks, "v3").await.unwrap();
    assert!(report.is_success(), "second run should complete: {}", report);

    let executor = second.executor();
    assert!(executor.executed("sepolia").is_empty());
    assert_eq!(
        executor.executed("base-sepolia"),
        vec![
            (Step::Verification, false),
            (Step::Wiring, false),
            (Step::TestData, false),
        ]
    );

    let state = ctx.state();
    assert!(state.completed_at.is_some());
    assert_eq!(state.failed_at, None);
    assert!(state.network("base-sepolia").is_complete());
}

#[tokio::test]
async fn test_release_of_a_subset_succeeds_despite_other_networks() {
    let ctx = TestContext::new("release-subset");

    let first = ctx.coordinator(
        ScriptedExecutor::default().failing("base-sepolia", Step::Verification, 3),
    );
    let report = first
        .run(&networks(&["sepolia", "base-sepolia"]), "v3")
        .await
        .unwrap();
    assert!(!report.is_success());

    // base-sepolia is left out of the second run.
    let second = ctx.coordinator(ScriptedExecutor::default());
    let report = second.run(&networks(&["sepolia"]), "v3").await.unwrap();

    assert!(report.is_success(), "subset release should succeed: {}", report);
    assert!(report.failure.is_none());
    assert!(second.executor().calls().is_empty());
    assert_eq!(report.others.len(), 1);
    assert!(report.to_string().contains("Release complete"));

    let state = ctx.state();
    assert!(state.completed_at.is_some());
    assert_eq!(state.failed_at, None);
    assert!(!state.network("base-sepolia").is_complete());
}

#[tokio::test]
async fn test_state_is_persisted_after_each_step() {
    let ctx = TestContext::new("release-persist");
    let networks = networks(&["sepolia"]);

    let coordinator =
        ctx.coordinator(ScriptedExecutor::default().failing("sepolia", Step::TestData, 3));
    coordinator.run(&networks, "v1").await.unwrap();

    let progress = ctx.state().network("sepolia");
    assert!(progress.protocol && progress.verification && progress.wiring);
    assert!(!progress.test_data);
}
