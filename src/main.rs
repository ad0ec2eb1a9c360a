use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use tickrun::config::{Cli, OutputFormat, RunConfig};
use tickrun::reporter::{HumanReporter, JsonReporter, MultiReporter, Reporter};
use tickrun::supervisor::{HostInvocation, RunOutcome, Supervisor, SupervisorOptions};
use tickrun::watch::{self, WatchPatterns};
use tickrun::{junit, logging, results, signals, Error};
use tokio::runtime::Runtime;

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[tickrun] Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = RunConfig::resolve(cli).context("invalid configuration")?;
    logging::init_cli(config.verbose);
    signals::install_signal_handlers().context("failed to install signal handlers")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    if config.watch {
        let root = std::env::current_dir()?;
        let patterns = WatchPatterns::new(&root, &config.watch_patterns)?;
        watch::start_watch_loop(&root, &patterns, || {
            match run_session(&runtime, &config) {
                Ok(outcome) => tracing::info!(status = %outcome.status, "run finished"),
                Err(Error::Cancelled) => return Ok(false),
                Err(e) => tracing::error!("run failed: {}", e),
            }
            Ok(!signals::shutdown_requested())
        })?;
        return Ok(ExitCode::SUCCESS);
    }

    let outcome = run_session(&runtime, &config)?;
    Ok(exit_code(&outcome, config.forbid_only))
}

/// One supervised host run, with results and reports written afterwards
fn run_session(runtime: &Runtime, config: &RunConfig) -> tickrun::Result<RunOutcome> {
    let mut test = config.test.clone();
    if test.reorder_failed_first {
        test.failed_tests = results::read_failed_tests(&config.results_file)
            .into_iter()
            .collect();
    }

    // Verbose JSON runs also get the readable view on stderr
    let mut reporter: Box<dyn Reporter> = match config.format {
        OutputFormat::Human => Box::new(HumanReporter::new()),
        OutputFormat::Json if config.verbose => Box::new(MultiReporter::new(vec![
            Box::new(JsonReporter::new()),
            Box::new(HumanReporter::new()),
        ])),
        OutputFormat::Json => Box::new(JsonReporter::new()),
    };
    let invocation =
        HostInvocation::from_command(&config.command)?.log_path(config.host_log.clone());
    let mut supervisor = Supervisor::new(SupervisorOptions::from(config), reporter.as_mut());
    let outcome = runtime.block_on(supervisor.run(&invocation, &test))?;

    results::write_results(&outcome.report, &config.run_name, &config.results_file)?;
    if let Some(path) = &config.junit_xml {
        junit::write_report(&outcome.report, &config.run_name, path)?;
    }
    Ok(outcome)
}

fn exit_code(outcome: &RunOutcome, forbid_only: bool) -> ExitCode {
    if forbid_only && outcome.focused {
        eprintln!("[tickrun] Focused tests found but --forbid-only is set");
        return ExitCode::FAILURE;
    }
    if outcome.status.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
