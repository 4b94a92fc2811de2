//! Single-unit and `run-all` execution.

use std::io::IsTerminal;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tundra_core::cache::outputs::OutputsCache;
use tundra_core::cache::run_cmd::RunCmdCache;
use tundra_core::config::eval::Evaluator;
use tundra_core::discovery::discover;
use tundra_core::report::{console, json, UnitStatus};
use tundra_core::runner::logwriter::{LogMultiplexer, PathRewriter};
use tundra_core::runner::Runner;

use crate::cli::args::Cli;
use crate::cli::commands::build_options;
use crate::exit_codes;

/// First interrupt stops scheduling and drains running units; the second
/// forwards kill signals to engine subprocesses.
fn spawn_interrupt_handler(cancel: CancellationToken, kill: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt: letting running units finish (interrupt again to kill)");
            cancel.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("second interrupt: killing engine subprocesses");
                kill.cancel();
            }
        }
    });
}

fn confirm(prompt: &str, non_interactive: bool) -> anyhow::Result<bool> {
    if non_interactive {
        return Ok(true);
    }
    eprint!("{prompt} (y/n) ");
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

pub async fn run(cli: &Cli) -> anyhow::Result<i32> {
    let (command, engine_args, run_all) = cli
        .command
        .engine_command()
        .expect("dispatch routes inspection commands elsewhere");
    let options = Arc::new(build_options(&cli.global, command, engine_args, run_all)?);

    let evaluator = Evaluator::new(options.clone(), Arc::new(RunCmdCache::new()));
    let root = options
        .working_dir
        .canonicalize()
        .unwrap_or_else(|_| options.working_dir.clone());
    let color = std::io::stderr().is_terminal();
    let (mux, mux_handle) = LogMultiplexer::spawn(
        PathRewriter::new(&root),
        run_all && options.log_prefix,
        color,
    );

    let cancel = CancellationToken::new();
    let kill = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone(), kill.clone());

    let runner = Runner::new(
        options.clone(),
        evaluator.clone(),
        Arc::new(OutputsCache::new()),
        mux,
        cancel,
        kill,
    );

    let code = if run_all {
        if options.is_destroy()
            && !confirm(
                &format!("Run 'destroy' on all units under {}?", root.display()),
                options.non_interactive,
            )?
        {
            return Ok(exit_codes::SUCCESS);
        }
        let tree = discover(&options, &evaluator)?;
        debug!(units = tree.units.len(), "discovery complete");
        let report = runner.run(&tree).await?;
        drop(runner);
        let _ = mux_handle.await;

        console::print_summary(&report);
        if let Some(path) = &options.report_json {
            json::write_json(&report, path)?;
        }
        if report.success() || options.ignore_errors {
            exit_codes::SUCCESS
        } else {
            exit_codes::UNIT_FAILURE
        }
    } else {
        let (result, _early_exit) = runner.run_single().await?;
        drop(runner);
        let _ = mux_handle.await;

        if let Some(message) = &result.message {
            eprintln!("{message}");
        }
        match result.status {
            UnitStatus::Failed if !options.ignore_errors => exit_codes::UNIT_FAILURE,
            _ => exit_codes::SUCCESS,
        }
    };
    Ok(code)
}
