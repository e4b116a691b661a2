// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Manager configuration.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! command line overrides. Validation happens once at the end and is the only
//! place a [`ConfigError::MissingDcgmDir`] can come from.

use crate::error::ConfigError;
use log::debug;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_NUM_GPUS: u32 = 4;
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5555;
pub const DEFAULT_PID_FILE: &str = "/tmp/dcgm-fake-gpu.pid";
pub const DEFAULT_LOG_FILE: &str = "/tmp/dcgm-fake.log";
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// DCGM build output, relative to `$HOME`.
const DEFAULT_DCGM_SUBDIR: &str = "Workspace/DCGM/_out/Linux-amd64-debug";
/// `DCGM_MAX_NUM_DEVICES` (32) minus the baseline GPU 0 the injection layer
/// already provides.
pub const MAX_NUM_GPUS: u32 = 31;

/// Timings of the supervised process lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorTimings {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub probe_timeout: Duration,
    pub stop_grace: Duration,
    pub kill_wait: Duration,
    pub restart_delay: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_attempts: 15,
            probe_timeout: Duration::from_secs(1),
            stop_grace: Duration::from_secs(2),
            kill_wait: Duration::from_secs(1),
            restart_delay: Duration::from_secs(2),
        }
    }
}

impl SupervisorTimings {
    /// Upper bound on how long `start` waits for readiness.
    pub fn readiness_budget(&self) -> Duration {
        self.poll_interval.saturating_mul(self.max_attempts)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    pub dcgm_dir: PathBuf,
    pub num_gpus: u32,
    pub host: String,
    pub port: u16,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub timings: SupervisorTimings,
    /// Pause between readiness and provisioning.
    pub startup_settle: Duration,
    /// Pause between provisioning and the first telemetry push.
    pub provision_settle: Duration,
    pub refresh_interval: Duration,
    /// Upper bound on a single periodic refresh cycle.
    pub refresh_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            dcgm_dir: default_dcgm_dir(),
            num_gpus: DEFAULT_NUM_GPUS,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            timings: SupervisorTimings::default(),
            startup_settle: Duration::from_secs(2),
            provision_settle: Duration::from_secs(1),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            refresh_timeout: Duration::from_secs(20),
        }
    }
}

/// Command line values that take precedence over the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub dcgm_dir: Option<PathBuf>,
    pub num_gpus: Option<u32>,
}

/// On-disk representation. Every key is optional; durations are in seconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    dcgm_dir: Option<PathBuf>,
    num_gpus: Option<u32>,
    host: Option<String>,
    port: Option<u16>,
    pid_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
    poll_interval: Option<u64>,
    max_attempts: Option<u32>,
    stop_grace: Option<u64>,
    kill_wait: Option<u64>,
    restart_delay: Option<u64>,
    refresh_interval: Option<u64>,
    refresh_timeout: Option<u64>,
}

impl ManagerConfig {
    /// Builds and validates the configuration.
    pub fn resolve(file: Option<&Path>, overrides: Overrides) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = file {
            config.apply_file(load_file(path)?);
        }
        if let Some(dir) = overrides.dcgm_dir {
            config.dcgm_dir = dir;
        }
        if let Some(n) = overrides.num_gpus {
            config.num_gpus = n;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        let secs = Duration::from_secs;
        if let Some(v) = file.dcgm_dir {
            self.dcgm_dir = v;
        }
        if let Some(v) = file.num_gpus {
            self.num_gpus = v;
        }
        if let Some(v) = file.host {
            self.host = v;
        }
        if let Some(v) = file.port {
            self.port = v;
        }
        if let Some(v) = file.pid_file {
            self.pid_file = v;
        }
        if let Some(v) = file.log_file {
            self.log_file = v;
        }
        if let Some(v) = file.poll_interval {
            self.timings.poll_interval = secs(v);
        }
        if let Some(v) = file.max_attempts {
            self.timings.max_attempts = v;
        }
        if let Some(v) = file.stop_grace {
            self.timings.stop_grace = secs(v);
        }
        if let Some(v) = file.kill_wait {
            self.timings.kill_wait = secs(v);
        }
        if let Some(v) = file.restart_delay {
            self.timings.restart_delay = secs(v);
        }
        if let Some(v) = file.refresh_interval {
            self.refresh_interval = secs(v);
        }
        if let Some(v) = file.refresh_timeout {
            self.refresh_timeout = secs(v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.dcgm_dir.is_dir() {
            return Err(ConfigError::MissingDcgmDir(self.dcgm_dir.clone()));
        }
        if self.num_gpus > MAX_NUM_GPUS {
            return Err(ConfigError::Invalid(format!(
                "num_gpus must be at most {MAX_NUM_GPUS}, got {}",
                self.num_gpus
            )));
        }
        if self.timings.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "refresh_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn hostengine_path(&self) -> PathBuf {
        self.dcgm_dir.join("bin").join("nv-hostengine")
    }

    /// `-n` keeps nv-hostengine in the foreground so the spawned pid is the
    /// engine itself rather than a short-lived launcher.
    pub fn hostengine_args(&self) -> Vec<String> {
        vec!["-n".to_string()]
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn default_dcgm_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(DEFAULT_DCGM_SUBDIR),
        None => PathBuf::from("/").join(DEFAULT_DCGM_SUBDIR),
    }
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("loaded config file {}", path.display());
    // An empty document deserializes as null.
    if contents.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
