//! forgeship releases forge deployments across networks and keeps network configs in sync.

mod cli;

use std::{
    io::{self, BufRead, Write},
    process::ExitCode,
};

use anyhow::Result;
use clap::{CommandFactory, Parser};

use cli::{Cli, Command};
use forgeship_deploy::{
    AssumeYes, ConfigOverrides, Confirm, ForgeStepExecutor, MergeOutcome, NetworkOrchestrator,
    OrchestratorSettings, ReleaseConfig, ReleaseCoordinator, ReleaseReport, StateStore, Step,
};

/// Asks on the terminal. Anything but `y` or `yes` declines.
struct PromptConfirm;

impl Confirm for PromptConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        eprint!("{} [y/N] ", prompt);
        if io::stderr().flush().is_err() {
            return false;
        }

        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(0) | Err(_) => false,
            Ok(_) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    if let Command::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "forgeship", &mut io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let networks = match &cli.command {
        Command::Release { networks, .. } => networks.clone(),
        _ => None,
    };
    let overrides = ConfigOverrides {
        root_dir: Some(cli.root.clone()),
        networks,
        dry_run: cli.dry_run.then_some(true),
    };
    let config = ReleaseConfig::load(&cli.root, cli.config.as_deref(), &overrides)?;
    let store = StateStore::new(config.state_path());

    let confirm: Box<dyn Confirm> = if cli.yes {
        Box::new(AssumeYes)
    } else {
        Box::new(PromptConfirm)
    };

    match cli.command {
        Command::Release { version, .. } => {
            tracing::info!(
                version = %version,
                networks = ?config.networks,
                dry_run = config.dry_run,
                state = %store.path().display(),
                "Releasing..."
            );

            let settings = OrchestratorSettings::from(&config);
            let networks = config.networks.clone();
            let executor = ForgeStepExecutor::new(config, Some(version.clone()), confirm)?;
            let coordinator = ReleaseCoordinator::new(executor, store, settings);

            let report = coordinator.run(&networks, &version).await?;
            println!("{}", report);

            if report.is_success() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Status => {
            let state = store.load();
            println!("{}", ReleaseReport::from_state(&state, &config.networks));
            Ok(ExitCode::SUCCESS)
        }
        Command::Reset => {
            let state = store.load();
            if let Some(version) = &state.version {
                tracing::warn!(version = %version, "Discarding release progress");
            }
            store.clear()?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Verify { network } => {
            let version = store.load().version;
            let executor = ForgeStepExecutor::new(config, version, confirm)?;

            let report = executor.check(&network).await?;
            println!("{}", report);
            if !report.all_passed() {
                tracing::error!(network = %network, "Not every contract is deployed and verified, network config left unchanged");
                return Ok(ExitCode::FAILURE);
            }

            print_merge(executor.merge(&network, Step::Protocol, true).await?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Merge {
            network,
            step,
            check_age,
        } => {
            let version = store.load().version;
            let executor = ForgeStepExecutor::new(config, version, confirm)?;
            print_merge(executor.merge(&network, step, check_age).await?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Wire { network, connected } => {
            let version = store.load().version;
            let settings = OrchestratorSettings::from(&config);
            let executor = ForgeStepExecutor::new(config, version, confirm)?;

            let networks = if connected {
                executor.wiring_targets(&network)?
            } else {
                vec![network]
            };
            tracing::info!(networks = ?networks, "Wiring adapters");

            let orchestrator = NetworkOrchestrator::new(&executor, &store, settings);
            if let Err(failure) = orchestrator.rewire(&networks).await {
                tracing::error!(network = %failure.network, error = %failure.source, "Wiring failed");
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Completions { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn print_merge(outcome: MergeOutcome) {
    match outcome {
        MergeOutcome::Merged(report) => println!("{}", report),
        MergeOutcome::SkippedStale { age } => println!(
            "Skipped: artifact is {} hours old and was not confirmed",
            age.as_secs() / 3600
        ),
    }
}
