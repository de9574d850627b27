//! Command-line interface definitions.

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

use crate::services::complexity::ComplexityClass;
use crate::services::jobs::{JobState, Strategy};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "concord",
    version,
    author,
    about = "Multi-extractor PDF-to-Markdown coordination service"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP control surface (accept-and-enqueue only).
    Serve(ServeArgs),
    /// Run a worker that drains the job queue.
    Worker(WorkerArgs),
    /// Submit a document and print the job id.
    Submit(SubmitArgs),
    /// Show one job's status.
    Status(StatusArgs),
    /// List jobs, optionally filtered by state.
    Jobs(JobsArgs),
    /// List registered extractors and their availability.
    Extractors(ExtractorsArgs),
    /// Delete terminal jobs past retention and expired store entries.
    Reap(ReapArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs;

#[derive(Debug, Args)]
pub struct WorkerArgs;

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Path to the PDF to process.
    pub input: std::path::PathBuf,
    /// Routing strategy (fallback, parallel_local, parallel_all, hybrid).
    #[arg(long, value_enum)]
    pub strategy: Option<StrategyArg>,
    /// Force the complexity class, bypassing classification.
    #[arg(long, value_enum)]
    pub force_complexity: Option<ComplexityArg>,
    /// Restrict the run to these extractors, in order.
    #[arg(long = "extractor")]
    pub extractors: Vec<String>,
    /// Webhook URL notified on terminal states.
    #[arg(long)]
    pub callback_url: Option<String>,
    /// Wait for the job to finish and print the result path.
    #[arg(long)]
    pub wait: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum StrategyArg {
    Fallback,
    ParallelLocal,
    ParallelAll,
    Hybrid,
}

impl From<StrategyArg> for Strategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Fallback => Strategy::Fallback,
            StrategyArg::ParallelLocal => Strategy::ParallelLocal,
            StrategyArg::ParallelAll => Strategy::ParallelAll,
            StrategyArg::Hybrid => Strategy::Hybrid,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum ComplexityArg {
    Simple,
    Medium,
    Complex,
}

impl From<ComplexityArg> for ComplexityClass {
    fn from(value: ComplexityArg) -> Self {
        match value {
            ComplexityArg::Simple => ComplexityClass::Simple,
            ComplexityArg::Medium => ComplexityClass::Medium,
            ComplexityArg::Complex => ComplexityClass::Complex,
        }
    }
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    pub job_id: String,
}

#[derive(Debug, Args)]
pub struct JobsArgs {
    /// Filter by state (pending, analyzing, extracting, comparing,
    /// needs_review, arbitrated, completed, failed, timeout).
    #[arg(long)]
    pub state: Option<JobState>,
}

#[derive(Debug, Args)]
pub struct ExtractorsArgs;

#[derive(Debug, Args)]
pub struct ReapArgs;
