//! forgeship-deploy - Release orchestration for forge based protocol deployments.
//!
//! This crate drives a versioned release across an ordered list of networks:
//! deploy the protocol, verify it, wire the adapters between networks and
//! deploy test data, resuming exactly where an interrupted release stopped.

mod broadcast;
pub use broadcast::{BroadcastDeployment, BroadcastLog, LATEST_RUN_FILE, broadcast_dir, latest_run};

mod config;
pub use config::{
    CONFIG_FILE_NAME, ConfigOverrides, ENV_PREFIX, LedgerConfig, ReleaseConfig, RetryConfig,
    SecretsConfig,
};

mod environment;
pub use environment::{
    Environment, LOCAL_NETWORK, LiveEnvironment, LocalEnvironment, NetworkEnvironment,
    admin_address, alchemy_rpc_url, redact,
};

mod error;
pub use error::{MergeError, StepError};

mod fs;
pub use fs::FsHandler;

mod merge;
pub use merge::{
    AssumeYes, ConfigMerger, Confirm, Decline, DeploymentStamp, FreshnessGuard, MergeOutcome,
    MergeReport, StartBlockPolicy, TIMESTAMP_FORMAT,
};

mod network_config;
pub use network_config::{
    ContractEntry, ContractRecord, DeploymentArtifact, DeploymentInfo, NetworkConfig,
    NetworkSection,
};

mod orchestrator;
pub use orchestrator::{NetworkFailure, NetworkOrchestrator, OrchestratorSettings};

mod release;
pub use release::{ReleaseCoordinator, ReleaseFailure, ReleaseReport};

mod retry;
pub use retry::{ResumeEvidence, ResumeToken, RetryController, RetryPolicy};

pub mod rpc;

pub mod runner;
pub use runner::{ForgeStepExecutor, StepExecutor};

mod secrets;
pub use secrets::SecretManager;

mod state;
pub use state::{DeploymentState, NetworkState, StateStore, Step};

mod verify;
pub use verify::{ContractStatus, ExplorerClient, VerificationChecker, VerificationReport};
