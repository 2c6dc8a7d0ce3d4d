//! # pmucount - Main Entry Point
//!
//! Supports three subcommands:
//! - **cgroup** (`--cgroup <NAME>`): count per cgroup subtree
//! - **process** (`--pid <PID>`): count per process lineage
//! - **replay** (`<TRACE>`): run a recorded trace through the in-process tables
//!   (no root needed)

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::time::{Duration, Instant};

use pmucount::cli::{Args, Command};
use pmucount::config::{Config, Targets};
use pmucount::counting::{print_diagnostics, CountingSession};
use pmucount::domain::{ConfigError, CountingError, Pid};
use pmucount::replay::replay_file;
use pmucount::report::Report;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let usage = err.chain().any(|cause| {
        cause.downcast_ref::<ConfigError>().is_some()
            || matches!(cause.downcast_ref::<CountingError>(), Some(CountingError::Config(_)))
    });
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if usage || msg.contains("missing required argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();

    let config = match args.command {
        Command::Cgroup { cgroups, cgroup_root, common } => {
            Config::from_args(Targets::Cgroups { names: cgroups, root: cgroup_root }, &common)?
        }
        Command::Process { pids, common } => {
            let pids = pids.into_iter().map(Pid).collect();
            Config::from_args(Targets::Processes(pids), &common)?
        }
        Command::Replay { trace, per_cpu, export } => {
            let report = replay_file(&trace)
                .with_context(|| format!("Failed to replay {}", trace.display()))?;
            print!("{}", report.render_table(per_cpu));
            if let Some(path) = export {
                report.write_json(&path).context("Failed to export report")?;
                println!("saved: {}", path.display());
            }
            return Ok(());
        }
    };

    count(&config).await
}

/// Live counting until Ctrl+C or the duration limit
async fn count(config: &Config) -> Result<()> {
    let mut session = CountingSession::start(config)?;

    if !config.quiet {
        println!(
            "pmucount v{}: {} mode, events {}",
            env!("CARGO_PKG_VERSION"),
            config.mode(),
            config.event_names().join(",")
        );
        println!("Press Ctrl+C to stop\n");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut ticker = tokio::time::interval(config.interval);
    // the first tick completes immediately
    ticker.tick().await;

    let started = Instant::now();
    let mut exit_reason = "interrupted";
    let mut last: Option<Report> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut ctrl_c => break,
        }

        let report = session.read().context("Failed to read counters")?;
        print_report(config, &report);
        last = Some(report);

        if config.duration.is_some_and(|limit| started.elapsed() >= limit) {
            exit_reason = "duration limit reached";
            break;
        }
    }

    // whatever accumulated since the last tick
    if exit_reason == "interrupted" {
        let report = session.read().context("Failed to read counters")?;
        print_report(config, &report);
        last = Some(report);
    }

    if !config.quiet {
        eprintln!("\n{exit_reason}: {:.1}s", started.elapsed().as_secs_f64());
        print_diagnostics(&session.diagnostics()?);
    }
    info!("stopping after {:?}", started.elapsed());

    if let (Some(path), Some(report)) = (&config.export, last) {
        report.write_json(path).context("Failed to export report")?;
        if !config.quiet {
            println!("saved: {}", path.display());
        }
    }
    Ok(())
}

fn print_report(config: &Config, report: &Report) {
    if config.quiet && config.export.is_some() {
        return;
    }
    println!("--- {:.3}s ---", Duration::from_millis(report.elapsed_ms).as_secs_f64());
    print!("{}", report.render_table(config.per_cpu));
}
