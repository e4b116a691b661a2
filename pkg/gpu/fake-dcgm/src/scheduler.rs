// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Periodic telemetry refresh.
//!
//! DCGM calls block, so each cycle runs on the blocking pool with its own
//! connection and is bounded by a timeout. A cycle that times out keeps its
//! blocking thread until the call returns. The loop keeps its handle and skips
//! ticks until it has finished, so at most one cycle talks to the host engine.

use crate::dcgm::DcgmConnector;
use crate::error::{DcgmError, RefreshError};
use crate::telemetry::{RefreshReport, TelemetryRefresher};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

type CycleHandle = JoinHandle<Result<RefreshReport, DcgmError>>;

/// Counters returned when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub cycles: u64,
    pub failures: u64,
    /// Ticks dropped because an earlier cycle was still running.
    pub skipped: u64,
}

/// Connects and refreshes every known GPU on the blocking pool.
fn spawn_cycle(connector: Arc<dyn DcgmConnector>) -> CycleHandle {
    tokio::task::spawn_blocking(move || {
        let mut client = connector.connect()?;
        let mut rng = rand::rng();
        TelemetryRefresher::new(client.as_mut()).refresh_all(&mut rng)
    })
}

/// Waits for `cycle` for at most `call_timeout`. On timeout the handle is
/// left untouched so the caller can keep tracking it.
async fn await_cycle(
    cycle: &mut CycleHandle,
    call_timeout: Duration,
) -> Result<RefreshReport, RefreshError> {
    match timeout(call_timeout, cycle).await {
        Ok(Ok(result)) => result.map_err(RefreshError::from),
        Ok(Err(join_err)) => Err(RefreshError::Panicked(join_err.to_string())),
        Err(_) => Err(RefreshError::TimedOut(call_timeout)),
    }
}

/// Runs one refresh cycle off the async runtime, within `call_timeout`.
pub async fn run_refresh_cycle(
    connector: Arc<dyn DcgmConnector>,
    call_timeout: Duration,
) -> Result<RefreshReport, RefreshError> {
    await_cycle(&mut spawn_cycle(connector), call_timeout).await
}

pub struct RefreshScheduler;

impl RefreshScheduler {
    /// Refreshes every `interval` until `token` is cancelled. A failed cycle
    /// is logged and the next one runs on schedule. A cycle still running past
    /// its timeout is not awaited on cancellation.
    pub fn spawn(
        connector: Arc<dyn DcgmConnector>,
        interval: Duration,
        call_timeout: Duration,
        token: CancellationToken,
    ) -> JoinHandle<SchedulerStats> {
        info!(
            "✓ Started metric updater (updates every {}s)",
            interval.as_secs()
        );
        tokio::spawn(async move {
            let mut stats = SchedulerStats::default();
            let mut stuck: Option<CycleHandle> = None;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {}
                }

                if stuck.as_ref().is_some_and(|cycle| !cycle.is_finished()) {
                    stats.skipped += 1;
                    warn!("Previous metric update still running, skipping this one");
                    continue;
                }
                stuck = None;

                info!("Updating metrics...");
                let mut cycle = spawn_cycle(Arc::clone(&connector));
                tokio::select! {
                    _ = token.cancelled() => break,
                    outcome = await_cycle(&mut cycle, call_timeout) => {
                        stats.cycles += 1;
                        match outcome {
                            Ok(_) => {}
                            Err(RefreshError::TimedOut(limit)) => {
                                stats.failures += 1;
                                warn!("Metric updater cycle exceeded {limit:?}, continuing");
                                stuck = Some(cycle);
                            }
                            Err(e) => {
                                stats.failures += 1;
                                error!("Metric updater error: {e}");
                            }
                        }
                    }
                }
            }
            info!(
                "Metric updater stopped after {} cycles ({} failed, {} skipped)",
                stats.cycles, stats.failures, stats.skipped
            );
            stats
        })
    }
}
