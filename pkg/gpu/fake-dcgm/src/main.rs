// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![allow(clippy::print_stdout)]

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Action, Args};
use fake_dcgm::manager::usage_summary;
use fake_dcgm::{
    FakeGpuManager, ManagerConfig, ManagerError, OnAlreadyRunning, StartReport, StopOutcome,
    logger,
};
use log::{LevelFilter, error, info, warn};
use std::io::{BufRead, Write};
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// How long exit waits for a DCGM call that outlived its refresh cycle.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

fn main() -> Result<ExitCode> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let result = runtime.block_on(run());
    // A wedged host engine can hold a blocking thread indefinitely.
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
    result
}

async fn run() -> Result<ExitCode> {
    let args = Args::parse();
    let default_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    logger::init(default_level)?;

    let config = ManagerConfig::resolve(args.config.as_deref(), args.overrides())
        .context("invalid configuration")?;
    let mut manager = FakeGpuManager::new(config);

    match args.action {
        Action::Stop => Ok(match manager.stop().await {
            StopOutcome::Failed => ExitCode::FAILURE,
            StopOutcome::Graceful | StopOutcome::Forced | StopOutcome::NotRunning => {
                ExitCode::SUCCESS
            }
        }),
        Action::Status => {
            manager.status().await;
            Ok(ExitCode::SUCCESS)
        }
        Action::Restart => {
            let result = manager.restart().await;
            finish_start(&manager, result, args.once).await
        }
        Action::Start => {
            let policy = match (args.on_running.resolved(), manager.is_running()) {
                (Some(policy), _) => policy,
                (None, None) => OnAlreadyRunning::Abort,
                (None, Some(pid)) => {
                    warn!("DCGM is already running (PID: {pid})");
                    ask_restart()
                }
            };
            let result = manager.start(policy).await;
            finish_start(&manager, result, args.once).await
        }
    }
}

fn ask_restart() -> OnAlreadyRunning {
    print!("Stop and restart? (y/n): ");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => cli::parse_answer(&line),
        Err(e) => {
            warn!("Could not read answer: {e}");
            OnAlreadyRunning::Abort
        }
    }
}

async fn finish_start(
    manager: &FakeGpuManager,
    result: Result<StartReport, ManagerError>,
    once: bool,
) -> Result<ExitCode> {
    let report = match result {
        Ok(report) => report,
        Err(e) => {
            error!("{e}");
            if let ManagerError::Start(start) = &e
                && let Some(log) = start.log_contents()
            {
                error!("Check log: {}", manager.config().log_file.display());
                for line in log.lines() {
                    error!("  {line}");
                }
            }
            return Ok(ExitCode::FAILURE);
        }
    };

    if !report.wants_refresh() {
        return Ok(ExitCode::SUCCESS);
    }
    match &report {
        StartReport::Started {
            process, entities, ..
        } => println!(
            "{}",
            usage_summary(manager.config(), process, entities, !once)
        ),
        StartReport::Reused { pid } => info!("Refreshing metrics for host engine {pid}"),
        StartReport::Declined { .. } => {}
    }

    if once {
        info!("Host engine left running (PID: {})", report.pid());
        return Ok(ExitCode::SUCCESS);
    }
    refresh_until_signal(manager).await?;
    Ok(ExitCode::SUCCESS)
}

/// Keeps telemetry fresh until SIGTERM or SIGINT. The host engine keeps
/// running afterwards; `stop` shuts it down.
async fn refresh_until_signal(manager: &FakeGpuManager) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let refresher = manager.spawn_refresher(token.clone());
    info!("Press Ctrl+C to stop the metric updater");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    token.cancel();
    refresher.await.context("metric updater task failed")?;
    Ok(())
}
