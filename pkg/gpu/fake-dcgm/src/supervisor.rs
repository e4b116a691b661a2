// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Lifecycle of the single nv-hostengine process.
//!
//! The engine runs in its own session so it outlives the tool. Its pid is
//! persisted through a [`PidStore`], which is how a later invocation finds it
//! again for `stop` or `status`.

use crate::config::{ManagerConfig, SupervisorTimings};
use crate::env::injection_env_from_process;
use crate::error::StartError;
use crate::pid_store::PidStore;
use crate::probe::ReadinessProbe;
use crate::state::SupervisorState;
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::time::{Duration, Instant, sleep};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What to run and where it listens.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub log_path: PathBuf,
    pub host: String,
    pub port: u16,
}

impl LaunchSpec {
    /// nv-hostengine from the DCGM build, with the NVML injection overlay.
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            program: config.hostengine_path(),
            args: config.hostengine_args(),
            working_dir: config.dcgm_dir.clone(),
            env: injection_env_from_process(&config.dcgm_dir),
            log_path: config.log_file.clone(),
            host: config.host.clone(),
            port: config.port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisedProcess {
    pub pid: u32,
    pub log_path: PathBuf,
    pub readiness_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited after SIGTERM, or was already gone when signaled.
    Graceful,
    /// Needed SIGKILL.
    Forced,
    NotRunning,
    /// Signaling failed or the process survived SIGKILL.
    Failed,
}

pub struct ProcessSupervisor {
    launch: LaunchSpec,
    timings: SupervisorTimings,
    pid_store: Arc<dyn PidStore>,
    probe: Arc<dyn ReadinessProbe>,
    state: SupervisorState,
    /// Present only when this instance spawned the engine.
    child: Option<Child>,
}

impl ProcessSupervisor {
    pub fn new(
        launch: LaunchSpec,
        timings: SupervisorTimings,
        pid_store: Arc<dyn PidStore>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Self {
        Self {
            launch,
            timings,
            pid_store,
            probe,
            state: SupervisorState::Stopped,
            child: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn probe(&self) -> &Arc<dyn ReadinessProbe> {
        &self.probe
    }

    fn transition(&mut self, next: SupervisorState) {
        if self.state.can_transition_to(next) {
            debug!("supervisor state {} -> {next}", self.state);
            self.state = next;
        } else {
            error!(
                "ignoring invalid supervisor transition {} -> {next}",
                self.state
            );
        }
    }

    /// Spawns the engine and waits for its readiness port.
    ///
    /// Callers are expected to check [`Self::is_running`] first.
    pub async fn start(&mut self) -> Result<SupervisedProcess, StartError> {
        self.transition(SupervisorState::Starting);
        info!("Starting nv-hostengine...");

        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.transition(SupervisorState::Stopped);
                return Err(e);
            }
        };

        let Some(pid) = child.id() else {
            let code = child.try_wait().ok().flatten().and_then(|s| s.code());
            self.transition(SupervisorState::Stopped);
            return Err(StartError::ExitedEarly {
                code,
                log: read_log(&self.launch.log_path),
            });
        };

        if let Err(e) = self.pid_store.save(pid) {
            error!("Failed to record host engine pid {pid}: {e}");
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill unrecorded host engine {pid}: {e}");
            }
            let _ = child.wait().await;
            self.transition(SupervisorState::Stopped);
            return Err(e.into());
        }
        self.child = Some(child);
        info!("Host engine started (PID: {pid})");

        self.wait_until_ready(pid).await
    }

    fn spawn(&self) -> Result<Child, StartError> {
        let log_err = |source| StartError::LogFile {
            path: self.launch.log_path.clone(),
            source,
        };
        let stdout = std::fs::File::create(&self.launch.log_path).map_err(log_err)?;
        let stderr = stdout.try_clone().map_err(log_err)?;

        let mut cmd = Command::new(&self.launch.program);
        cmd.args(&self.launch.args)
            .current_dir(&self.launch.working_dir)
            .envs(self.launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        // SAFETY: the closure runs in the forked child before exec and only
        // calls setsid(2), which is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }

        cmd.spawn().map_err(|source| StartError::Spawn {
            command: self.launch.program.clone(),
            source,
        })
    }

    async fn wait_until_ready(&mut self, pid: u32) -> Result<SupervisedProcess, StartError> {
        let max = self.timings.max_attempts;
        info!("Waiting for host engine to initialize...");

        for attempt in 1..=max {
            sleep(self.timings.poll_interval).await;

            if let Some(code) = self.exited_during_startup() {
                return Err(self.fail_early_exit(pid, code));
            }

            if self
                .probe
                .is_ready(&self.launch.host, self.launch.port, self.timings.probe_timeout)
                .await
            {
                self.transition(SupervisorState::Running);
                info!(
                    "✓ Host engine is ready and listening on port {}",
                    self.launch.port
                );
                return Ok(SupervisedProcess {
                    pid,
                    log_path: self.launch.log_path.clone(),
                    readiness_port: self.launch.port,
                });
            }

            if attempt < max {
                info!("Still waiting... ({attempt}/{max})");
            }
        }

        warn!("Timeout waiting for port {}", self.launch.port);
        self.transition(SupervisorState::Stopped);
        Err(StartError::ReadinessTimeout {
            port: self.launch.port,
            attempts: max,
            log: read_log(&self.launch.log_path),
        })
    }

    /// `Some(exit code)` once the spawned child has exited.
    fn exited_during_startup(&mut self) -> Option<Option<i32>> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to poll host engine: {e}");
                None
            }
        }
    }

    fn fail_early_exit(&mut self, pid: u32, code: Option<i32>) -> StartError {
        self.child = None;
        error!("Host engine process died!");
        match code {
            Some(code) => error!("Exit code: {code}"),
            None => error!("Exit code: none (terminated by signal)"),
        }
        error!("Check log: {}", self.launch.log_path.display());
        if let Err(e) = self.pid_store.clear() {
            warn!("Failed to remove pid record for exited engine {pid}: {e}");
        }
        self.transition(SupervisorState::Stopped);
        StartError::ExitedEarly {
            code,
            log: read_log(&self.launch.log_path),
        }
    }

    /// Pid of the engine when the record exists and the process is alive.
    /// A stale record is left in place.
    pub fn is_running(&mut self) -> Option<u32> {
        let pid = match self.pid_store.load() {
            Ok(Some(pid)) => pid,
            Ok(None) => return None,
            Err(e) => {
                debug!("ignoring unreadable pid record {}: {e}", self.pid_store.location());
                return None;
            }
        };
        if self.process_alive(pid) {
            Some(pid)
        } else {
            None
        }
    }

    fn process_alive(&mut self, pid: u32) -> bool {
        if let Some(child) = self.child.as_mut()
            && child.id() == Some(pid)
        {
            match child.try_wait() {
                Ok(Some(_)) => {
                    self.child = None;
                    if self.state == SupervisorState::Running {
                        warn!("Host engine (PID: {pid}) exited unexpectedly");
                        self.transition(SupervisorState::Stopped);
                    }
                    return false;
                }
                Ok(None) => return true,
                Err(e) => debug!("try_wait on {pid} failed, falling back to kill(0): {e}"),
            }
        }
        pid_alive(pid)
    }

    /// SIGTERM, then SIGKILL if the engine outlives the grace period. The pid
    /// record is removed whenever a running engine was found.
    pub async fn stop(&mut self) -> StopOutcome {
        let Some(pid) = self.is_running() else {
            warn!("DCGM host engine is not running");
            return StopOutcome::NotRunning;
        };

        self.transition(SupervisorState::Stopping);
        info!("Stopping DCGM host engine (PID: {pid})...");
        let outcome = self.terminate(pid).await;

        if let Err(e) = self.pid_store.clear() {
            error!("Failed to remove pid record {}: {e}", self.pid_store.location());
        }
        self.child = None;
        self.transition(SupervisorState::Stopped);

        if matches!(outcome, StopOutcome::Graceful | StopOutcome::Forced) {
            info!("✓ DCGM host engine stopped");
        }
        outcome
    }

    async fn terminate(&mut self, pid: u32) -> StopOutcome {
        match send_signal(pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                debug!("host engine {pid} exited before SIGTERM");
                return StopOutcome::Graceful;
            }
            Err(e) => {
                error!("Failed to stop host engine: {e}");
                return StopOutcome::Failed;
            }
        }

        if self.wait_for_exit(pid, self.timings.stop_grace).await {
            return StopOutcome::Graceful;
        }

        warn!("Process still running, forcing kill...");
        match send_signal(pid, Signal::SIGKILL) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return StopOutcome::Graceful,
            Err(e) => {
                error!("Failed to kill host engine: {e}");
                return StopOutcome::Failed;
            }
        }

        if self.wait_for_exit(pid, self.timings.kill_wait).await {
            StopOutcome::Forced
        } else {
            error!("Host engine (PID: {pid}) still alive after SIGKILL");
            StopOutcome::Failed
        }
    }

    async fn wait_for_exit(&mut self, pid: u32, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if !self.process_alive(pid) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(EXIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    pub async fn restart(&mut self) -> Result<SupervisedProcess, StartError> {
        self.stop().await;
        sleep(self.timings.restart_delay).await;
        self.start().await
    }
}

fn send_signal(pid: u32, sig: Signal) -> Result<(), Errno> {
    let raw = i32::try_from(pid).map_err(|_| Errno::ESRCH)?;
    signal::kill(Pid::from_raw(raw), sig)
}

/// Liveness through signal 0. EPERM still means the pid exists.
pub fn pid_alive(pid: u32) -> bool {
    // kill(0, ..) targets the caller's process group.
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw == 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

/// A zombie still answers signal 0 until its parent reaps it.
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The command name may contain spaces or parentheses; the state is the
    // first field after the last ')'.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

fn read_log(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => format!("<could not read {}: {e}>", path.display()),
    }
}
