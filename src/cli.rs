use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use clap::{Args, Parser, Subcommand, ValueHint};

use crate::config::{JobFilter, Overrides};
use crate::logging::{self, LogFormat};
use crate::model::{Category, Runtime};

/// Which configuration to load and how to adjust it.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub config: Option<PathBuf>,
    pub overrides: Overrides,
}

/// The top-level command requested by the user.
#[derive(Debug, Clone)]
pub enum Command {
    Run(RunSpec),
    Plan(RunSpec),
    CheckToolchains,
    Up { config: Option<PathBuf> },
    Down { config: Option<PathBuf> },
    ShowVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub level: &'static str,
    pub format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub command: Command,
    pub log: LogOptions,
}

/// Parse CLI arguments into a high-level command.
pub fn parse() -> Result<Invocation> {
    from_cli(Cli::parse())
}

/// Same as [`parse`] for an explicit argument list.
pub fn parse_from<I, T>(args: I) -> Result<Invocation>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    from_cli(Cli::try_parse_from(args)?)
}

fn from_cli(cli: Cli) -> Result<Invocation> {
    let log = LogOptions {
        level: logging::level_for(cli.verbose, cli.quiet),
        format: cli.log_format,
    };

    if cli.version {
        return Ok(Invocation {
            command: Command::ShowVersion,
            log,
        });
    }

    let command = match cli.command {
        Some(CliCommand::Run(args)) => Command::Run(args.into_spec()?),
        Some(CliCommand::Plan(args)) => Command::Plan(args.into_spec()?),
        Some(CliCommand::Check) => Command::CheckToolchains,
        Some(CliCommand::Up(args)) => Command::Up {
            config: args.config,
        },
        Some(CliCommand::Down(args)) => Command::Down {
            config: args.config,
        },
        None => bail!("no command given (try `stackrun --help`)"),
    };

    Ok(Invocation { command, log })
}

#[derive(Parser, Debug)]
#[command(
    name = "stackrun",
    about = "Bring up test infrastructure, run multi-runtime test suites, report once",
    disable_help_subcommand = true,
    disable_version_flag = true
)]
struct Cli {
    /// Print version information and exit.
    #[arg(short = 'V', long = "version", action = clap::ArgAction::SetTrue)]
    version: bool,

    /// More log output (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Log line format.
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Start services, run the selected jobs, report and tear down.
    Run(RunArgs),
    /// Validate the configuration and print startup waves and jobs.
    Plan(RunArgs),
    /// Report which test toolchains are on PATH.
    Check,
    /// Start the services and keep them up until interrupted.
    Up(ConfigArg),
    /// Remove containers and compose stacks left by an earlier run.
    Down(ConfigArg),
}

#[derive(Args, Debug)]
struct ConfigArg {
    /// Configuration file (default: stackrun.toml found upward from here).
    #[arg(short, long, value_name = "PATH", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArg,

    /// Only run these categories (comma separated).
    #[arg(long = "category", value_name = "CATEGORY", value_delimiter = ',')]
    categories: Vec<Category>,

    /// Only run these runtimes (comma separated).
    #[arg(long = "runtime", value_name = "RUNTIME", value_delimiter = ',')]
    runtimes: Vec<Runtime>,

    /// Only run jobs for these targets or job names.
    #[arg(long = "target", value_name = "TARGET", value_delimiter = ',')]
    targets: Vec<String>,

    /// Maximum number of jobs in flight.
    #[arg(short = 'j', long = "concurrency", value_name = "N")]
    concurrency: Option<usize>,

    /// Stop dispatching after the first failed job.
    #[arg(long)]
    fail_fast: bool,

    /// Leave services running after a clean run.
    #[arg(long)]
    skip_teardown: bool,

    /// Minimum aggregate coverage in percent.
    #[arg(long, value_name = "PERCENT")]
    coverage_threshold: Option<f64>,

    /// Where logs, results and the report are written.
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    results_dir: Option<PathBuf>,

    /// Cancel the whole run after this many seconds.
    #[arg(long = "timeout", value_name = "SECS")]
    timeout_secs: Option<u64>,
}

impl RunArgs {
    fn into_spec(self) -> Result<RunSpec> {
        if let Some(n) = self.concurrency {
            ensure!(n > 0, "--concurrency must be at least 1");
        }
        if let Some(threshold) = self.coverage_threshold {
            ensure!(
                (0.0..=100.0).contains(&threshold),
                "--coverage-threshold must be between 0 and 100"
            );
        }

        Ok(RunSpec {
            config: self.config.config,
            overrides: Overrides {
                filter: JobFilter {
                    runtimes: self.runtimes,
                    categories: self.categories,
                    targets: self.targets,
                },
                max_concurrency: self.concurrency,
                fail_fast: self.fail_fast,
                skip_teardown: self.skip_teardown,
                coverage_threshold: self.coverage_threshold,
                results_dir: self.results_dir,
                global_timeout: self
                    .timeout_secs
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs),
            },
        })
    }
}
