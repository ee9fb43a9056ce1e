use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use forgeship_deploy::Step;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "forgeship")]
#[command(
    author,
    version,
    about = "Release forge deployments across networks, resuming where the last run stopped"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "FORGESHIP_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Repository root holding `env/`, `script/` and `broadcast/`.
    #[arg(long, global = true, env = "FORGESHIP_ROOT", default_value = ".")]
    pub root: PathBuf,

    /// Path to the release configuration file.
    ///
    /// Defaults to `Release.toml` in the repository root.
    #[arg(long, alias = "conf", global = true, env = "FORGESHIP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Simulate the scripts without broadcasting any transaction.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Answer yes to every confirmation prompt.
    #[arg(short, long, global = true)]
    pub yes: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Release a version to every configured network, in order.
    ///
    /// An interrupted release of the same version resumes at the step that
    /// failed. A different version starts over.
    Release {
        /// The release version.
        #[arg(long, env = "VERSION")]
        version: String,

        /// Networks to release, in order. Defaults to the configured list.
        #[arg(long, value_delimiter = ',')]
        networks: Option<Vec<String>>,
    },

    /// Show the progress of the current release.
    Status,

    /// Forget the progress of the current release.
    Reset,

    /// Check deployment and explorer verification of a network's contracts,
    /// then merge them into its network config.
    Verify {
        /// The network to check.
        network: String,
    },

    /// Merge the latest deployment artifact into a network config.
    Merge {
        /// The network whose config is updated.
        network: String,

        /// The step that produced the artifact.
        #[arg(long, default_value_t = Step::Protocol)]
        step: Step,

        /// Ask before merging an artifact older than the configured maximum age.
        #[arg(long)]
        check_age: bool,
    },

    /// Run the adapter wiring of a network again, outside of a release.
    ///
    /// Needed when a peer was redeployed after the network was wired.
    Wire {
        /// The network to wire.
        network: String,

        /// Also wire every network listed in its `connectsTo`.
        #[arg(long)]
        connected: bool,
    },

    /// Print the effective configuration.
    Config,

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}
