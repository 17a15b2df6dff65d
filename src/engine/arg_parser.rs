use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::broker::BrokerKind;
use crate::monitor::DispatchFailurePolicy;
use crate::utils::config::PackagePaths;

/// Watch forensic case directories and dispatch processing modules to a worker fleet.
#[derive(Clone, Parser)]
#[command(name = "casewatch")]
#[command(about = "Watch a case directory, match new entries to modules, dispatch them to workers.")]
pub struct Cli {
    /// Config file. Default: `casewatch.toml` in the current directory (optional).
    #[arg(long, short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Verbose output.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand)]
pub enum Commands {
    /// Watch one case until every module has processed everything it matched.
    Watch(WatchArgs),
    /// Run the worker fleet only, consuming from the shared store.
    Agent(CommonArgs),
    /// Show the status of a case and its outstanding work.
    Status {
        /// Case directory.
        #[arg(long, value_name = "DIR")]
        case: PathBuf,

        #[command(flatten)]
        common: CommonArgs,
    },
}

/// Overrides shared by every subcommand.
#[derive(Clone, Args, Default)]
pub struct CommonArgs {
    /// Coordination store file. Default: `casewatch.db`.
    #[arg(long, value_name = "FILE")]
    pub store: Option<PathBuf>,

    /// Queue transport: `sqlite` (shared with other agents) or `memory` (this process only).
    #[arg(long)]
    pub broker: Option<BrokerKind>,
}

#[derive(Clone, Args)]
pub struct WatchArgs {
    /// Case directory.
    #[arg(long, value_name = "DIR")]
    pub case: PathBuf,

    /// Module profile (`<catalog>/profiles/<name>.toml`).
    #[arg(long, short = 'p')]
    pub profile: Option<String>,

    /// Modules to run, replacing the profile's list. Comma separated or repeated.
    #[arg(long, short = 'm', value_delimiter = ',')]
    pub module: Vec<String>,

    /// Modules added to the profile's list.
    #[arg(long, value_delimiter = ',')]
    pub module_add: Vec<String>,

    /// Modules removed from the profile's list.
    #[arg(long, value_delimiter = ',')]
    pub module_remove: Vec<String>,

    /// Ignore what earlier runs saw and process the whole tree again.
    #[arg(long)]
    pub reprocess: bool,

    /// Also run the worker fleet in this process (required with the memory broker).
    #[arg(long)]
    pub agent: bool,

    /// Module catalog directory.
    #[arg(long, value_name = "DIR")]
    pub catalog: Option<PathBuf>,

    /// Seconds between scans.
    #[arg(long, value_parser = clap::value_parser!(f64))]
    pub scan_interval: Option<f64>,

    /// Seconds a directory must stay the same size before it is dispatched.
    #[arg(long, value_parser = clap::value_parser!(f64))]
    pub cooldown: Option<f64>,

    /// What to do when a task cannot be enqueued: `retry` next cycle or `drop`.
    #[arg(long)]
    pub on_dispatch_failure: Option<DispatchFailurePolicy>,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl Cli {
    /// Config file path, defaulting to the package config filename in the working directory.
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(PackagePaths::get().config_filename()))
    }
}
