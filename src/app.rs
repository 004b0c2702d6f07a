use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::adapter::AdapterRegistry;
use crate::cli::{Command, Invocation, RunSpec};
use crate::config::{self, StackConfig};
use crate::driver::{self, Driver};
use crate::error::{EXIT_FAILED, EXIT_OK};
use crate::logging;
use crate::version;

pub fn run(invocation: Invocation) -> Result<i32> {
    logging::init(invocation.log.level, invocation.log.format);
    let registry = AdapterRegistry::bootstrap();

    match invocation.command {
        Command::ShowVersion => {
            println!("{}", version::describe());
            Ok(EXIT_OK)
        }
        Command::CheckToolchains => Ok(check_toolchains(&registry)),
        Command::Plan(spec) => Ok(report_errors(plan(&spec, &registry))),
        Command::Run(spec) => block_on(async move {
            let cancel = cancel_on_interrupt();
            report_errors(run_stack(&spec, registry, cancel).await)
        }),
        Command::Up { config } => block_on(async move {
            let cancel = cancel_on_interrupt();
            report_errors(bring_up(config.as_deref(), &registry, cancel).await)
        }),
        Command::Down { config } => block_on(async move {
            report_errors(tear_down(config.as_deref()).await)
        }),
    }
}

fn block_on<F>(future: F) -> Result<i32>
where
    F: std::future::Future<Output = i32>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    Ok(runtime.block_on(future))
}

/// Cancel the returned token on the first Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            token.cancel();
        }
    });
    cancel
}

/// Print a library error and turn it into its exit code.
fn report_errors(result: crate::Result<i32>) -> i32 {
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("\x1b[31mError:\x1b[0m {err}");
            err.exit_code()
        }
    }
}

fn load_config(spec: &RunSpec) -> crate::Result<StackConfig> {
    load_from(spec.config.as_deref()).map(|mut config| {
        config.apply_overrides(&spec.overrides);
        config
    })
}

fn load_from(path: Option<&Path>) -> crate::Result<StackConfig> {
    let path = config::locate(path)?;
    let mut config = StackConfig::load(&path)?;
    config.apply_env(|key| std::env::var(key).ok())?;
    Ok(config)
}

async fn run_stack(
    spec: &RunSpec,
    registry: AdapterRegistry,
    cancel: CancellationToken,
) -> crate::Result<i32> {
    let config = load_config(spec)?;
    let results_dir = config.settings.results_dir.clone();
    let outcome = Driver::new(config, Arc::new(registry)).run(cancel).await?;

    print!("{}", outcome.report.render_text());
    println!("\nResults: {}", results_dir.display());
    io::stdout().flush().ok();
    Ok(outcome.exit_code)
}

fn plan(spec: &RunSpec, registry: &AdapterRegistry) -> crate::Result<i32> {
    let config = load_config(spec)?;
    let plan = config.validate(registry)?;
    let settings = &config.settings;

    println!("Configuration: {}", config.path.display());
    println!("\nStartup waves:");
    if plan.waves.is_empty() {
        println!("  (no services)");
    }
    for (index, wave) in plan.waves.iter().enumerate() {
        let members: Vec<String> = wave
            .iter()
            .map(|name| match config.service(name) {
                Some(spec) => format!("{name} [{}, {}]", spec.backend.kind(), spec.readiness),
                None => name.clone(),
            })
            .collect();
        println!("  {}: {}", index + 1, members.join(", "));
    }

    println!(
        "\nJobs: {} (max concurrency {}{})",
        config.jobs.len(),
        settings.max_concurrency,
        if settings.fail_fast { ", fail-fast" } else { "" }
    );
    for job in &config.jobs {
        let mut line = format!("  {:<40}", job.id);
        if !job.requires.is_empty() {
            line.push_str(&format!(" requires: {}", job.requires.join(", ")));
        }
        if job.retries > 0 {
            line.push_str(&format!(" retries: {}", job.retries));
        }
        println!("{}", line.trim_end());
    }

    if let Some(threshold) = settings.coverage_threshold {
        println!("\nCoverage threshold: {threshold:.0}%");
    }
    println!("Results: {}", settings.results_dir.display());
    Ok(EXIT_OK)
}

fn check_toolchains(registry: &AdapterRegistry) -> i32 {
    println!("Checking test toolchains...\n");

    let mut available = 0u32;
    let mut missing = 0u32;

    for adapter in registry.adapters() {
        let (status, location) = match adapter.validate() {
            Ok(path) => {
                available += 1;
                ("\x1b[32m OK \x1b[0m", path.display().to_string())
            }
            Err(_) => {
                missing += 1;
                ("\x1b[31mMISS\x1b[0m", format!("{} not on PATH", adapter.tool()))
            }
        };
        println!(
            "  [{status}] {:<12} {:<12} {location}",
            adapter.runtime().as_str(),
            adapter.display_name()
        );
    }

    println!();
    println!(
        "  {} available, {} missing, {} total",
        available,
        missing,
        available + missing
    );
    if missing > 0 {
        println!("\n  Tip: jobs with a command override do not need the default tool.");
    }
    EXIT_OK
}

async fn bring_up(
    path: Option<&Path>,
    registry: &AdapterRegistry,
    cancel: CancellationToken,
) -> crate::Result<i32> {
    let config = load_from(path)?;
    let states = driver::bring_up(&config, registry, cancel).await?;
    for (name, state) in states {
        println!("  {name:<20} {state}");
    }
    Ok(EXIT_OK)
}

async fn tear_down(path: Option<&Path>) -> crate::Result<i32> {
    let config = load_from(path)?;
    let errors = driver::tear_down(&config).await;
    for err in &errors {
        eprintln!("\x1b[33mWarning:\x1b[0m {err}");
    }
    Ok(if errors.is_empty() { EXIT_OK } else { EXIT_FAILED })
}
