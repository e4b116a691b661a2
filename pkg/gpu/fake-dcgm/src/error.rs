// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Error types surfaced by the library. The binary wraps them in `anyhow`.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal configuration problems, raised before any process is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DCGM directory not found: {}", .0.display())]
    MissingDcgmDir(PathBuf),

    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum PidStoreError {
    #[error("pid record {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pid record contains an invalid pid: {0:?}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to spawn {}: {source}", command.display())]
    Spawn {
        command: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open log file {}: {source}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    PidStore(#[from] PidStoreError),

    #[error("host engine exited during startup ({})", describe_exit(.code))]
    ExitedEarly { code: Option<i32>, log: String },

    #[error("timed out waiting for port {port} after {attempts} attempts")]
    ReadinessTimeout {
        port: u16,
        attempts: u32,
        log: String,
    },
}

impl StartError {
    /// Captured host engine output, when the failure came with any.
    pub fn log_contents(&self) -> Option<&str> {
        match self {
            StartError::ExitedEarly { log, .. } | StartError::ReadinessTimeout { log, .. } => {
                Some(log.as_str())
            }
            _ => None,
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match *code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Failures talking to DCGM.
///
/// `Library` and `Connection` errors, and API calls rejected because the
/// connection is gone, are fatal: nothing else in the current batch can
/// succeed. Every other API error only affects the call that produced it.
#[derive(Debug, Error)]
pub enum DcgmError {
    #[error("failed to load DCGM library {}: {reason}", path.display())]
    Library { path: PathBuf, reason: String },

    #[error("failed to connect to host engine at {address}: {reason}")]
    Connection { address: String, reason: String },

    #[error("{call} failed with DCGM status {code}")]
    Api { call: &'static str, code: i32 },

    #[error("invalid argument for {call}: {reason}")]
    InvalidArgument { call: &'static str, reason: String },
}

/// `DCGM_ST_CONNECTION_NOT_VALID`
pub const DCGM_ST_CONNECTION_NOT_VALID: i32 = -21;
/// `DCGM_ST_UNINITIALIZED`
pub const DCGM_ST_UNINITIALIZED: i32 = -10;

impl DcgmError {
    pub fn is_fatal(&self) -> bool {
        match self {
            DcgmError::Library { .. } | DcgmError::Connection { .. } => true,
            DcgmError::Api { code, .. } => {
                matches!(*code, DCGM_ST_CONNECTION_NOT_VALID | DCGM_ST_UNINITIALIZED)
            }
            DcgmError::InvalidArgument { .. } => false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Client(#[from] DcgmError),

    #[error("requested {requested} fake GPUs but only {created} were created")]
    Shortfall { requested: u32, created: u32 },

    #[error("provisioning task failed: {0}")]
    Aborted(String),
}

/// Why `start` gave up. The host engine has been stopped again by the time
/// this is returned, unless it exited on its own.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Start(#[from] StartError),

    #[error("failed to create fake GPUs: {0}")]
    Provision(#[from] ProvisionError),
}

/// Failure of one telemetry refresh cycle.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Dcgm(#[from] DcgmError),

    #[error("refresh did not finish within {0:?}")]
    TimedOut(std::time::Duration),

    #[error("refresh task panicked: {0}")]
    Panicked(String),
}
