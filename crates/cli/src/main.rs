// relink CLI - identity and record reconciliation after a data migration

mod commands;
mod exit_codes;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use exit_codes::{recon_exit_code, EXIT_SUCCESS};
use relink_recon::ReconError;

#[derive(Parser)]
#[command(name = "relink")]
#[command(about = "Relink live records to their canonical owners after a migration")]
#[command(version)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace). Overrides RELINK_LOG.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the config and load the extract without touching the live store
    #[command(after_help = "\
Examples:
  relink validate relink.toml
  relink validate relink.toml --json")]
    Validate {
        /// Path to the relink.toml config file
        config: PathBuf,

        /// Output JSON to stdout instead of a human summary
        #[arg(long)]
        json: bool,
    },

    /// Match owners and write a reassignment plan for review
    #[command(after_help = "\
Examples:
  relink plan relink.toml --output plan.json
  relink plan relink.toml --live-export live.csv --json")]
    Plan {
        /// Path to the relink.toml config file
        config: PathBuf,

        /// Write the plan JSON to file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Output plan JSON to stdout
        #[arg(long)]
        json: bool,

        /// Allow the plan to create target owners missing from the live store
        #[arg(long)]
        create_missing_owners: bool,

        /// Read live state from an exported CSV (extract layout) instead of the store
        #[arg(long)]
        live_export: Option<PathBuf>,
    },

    /// Re-validate a reviewed plan against the live store, apply it, then verify
    #[command(after_help = "\
Examples:
  relink apply relink.toml --plan plan.json --dry-run
  relink apply relink.toml --plan plan.json --output apply.json")]
    Apply {
        /// Path to the relink.toml config file
        config: PathBuf,

        /// Plan JSON produced by `relink plan`
        #[arg(long)]
        plan: PathBuf,

        /// Read records and report what would change; issue no writes
        #[arg(long)]
        dry_run: bool,

        /// Authorize creation of the plan's missing target owners
        #[arg(long)]
        create_missing_owners: bool,

        /// Stop issuing batches once this file exists
        #[arg(long, env = "RELINK_CANCEL_FILE")]
        cancel_file: Option<PathBuf>,

        /// Write the apply report JSON to file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Output the apply report JSON to stdout
        #[arg(long)]
        json: bool,
    },

    /// Diff live per-table counts against the extract
    #[command(after_help = "\
Examples:
  relink verify relink.toml
  relink verify relink.toml --owner usr_42
  relink verify relink.toml --live-export live.csv --output verify.json")]
    Verify {
        /// Path to the relink.toml config file
        config: PathBuf,

        /// Audit a single canonical owner directly against the store
        #[arg(long)]
        owner: Option<String>,

        /// Read live state from an exported CSV (extract layout) instead of the store
        #[arg(long)]
        live_export: Option<PathBuf>,

        /// Write the verification report JSON to file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Output the verification report JSON to stdout
        #[arg(long)]
        json: bool,
    },

    /// Plan, apply and verify in one pass
    #[command(after_help = "\
Examples:
  relink run relink.toml --dry-run
  relink run relink.toml --output run.json")]
    Run {
        /// Path to the relink.toml config file
        config: PathBuf,

        /// Read records and report what would change; issue no writes
        #[arg(long)]
        dry_run: bool,

        /// Authorize creation of target owners missing from the live store
        #[arg(long)]
        create_missing_owners: bool,

        /// Stop issuing batches once this file exists
        #[arg(long, env = "RELINK_CANCEL_FILE")]
        cancel_file: Option<PathBuf>,

        /// Write the run report JSON to file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Output the run report JSON to stdout
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_env("RELINK_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal())
                .with_target(false),
        )
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Validate { config, json } => commands::cmd_validate(config, json),
        Commands::Plan {
            config,
            output,
            json,
            create_missing_owners,
            live_export,
        } => commands::cmd_plan(config, output, json, create_missing_owners, live_export),
        Commands::Apply {
            config,
            plan,
            dry_run,
            create_missing_owners,
            cancel_file,
            output,
            json,
        } => commands::cmd_apply(config, plan, dry_run, create_missing_owners, cancel_file, output, json),
        Commands::Verify {
            config,
            owner,
            live_export,
            output,
            json,
        } => commands::cmd_verify(config, owner, live_export, output, json),
        Commands::Run {
            config,
            dry_run,
            create_missing_owners,
            cancel_file,
            output,
            json,
        } => commands::cmd_run(config, dry_run, create_missing_owners, cancel_file, output, json),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn new(code: u8, msg: impl Into<String>) -> Self {
        Self { code, message: msg.into(), hint: None }
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl From<ReconError> for CliError {
    fn from(err: ReconError) -> Self {
        let code = recon_exit_code(&err);
        let hint = match &err {
            ReconError::InvalidPlan(_) => {
                Some("the live state changed since planning; re-run `relink plan` and review again".to_string())
            }
            ReconError::MissingColumn { .. } => Some("check [extract.columns] against the extract header".to_string()),
            ReconError::Store(e) if e.is_transient() => Some("the store is busy; retry later".to_string()),
            _ => None,
        };
        Self { code, message: err.to_string(), hint }
    }
}
