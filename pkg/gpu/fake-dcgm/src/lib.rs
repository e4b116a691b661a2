// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Runs a DCGM host engine backed by NVML injection, fills it with fake GPUs
//! and keeps synthetic telemetry flowing so GPU checks can be developed
//! without real hardware.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::indexing_slicing
    )
)]

pub mod config;
pub mod dcgm;
pub mod env;
pub mod error;
pub mod logger;
pub mod manager;
pub mod pid_store;
pub mod probe;
pub mod provisioner;
pub mod scheduler;
pub mod state;
pub mod supervisor;
pub mod telemetry;
pub mod wrapper;

pub use config::{ManagerConfig, SupervisorTimings};
pub use error::{
    ConfigError, DcgmError, ManagerError, PidStoreError, ProvisionError, RefreshError,
    StartError,
};
pub use manager::{FakeGpuManager, OnAlreadyRunning, StartReport, StatusReport};
pub use pid_store::{FilePidStore, MemoryPidStore, PidStore};
pub use probe::{ReadinessProbe, TcpReadinessProbe};
pub use state::SupervisorState;
pub use supervisor::{LaunchSpec, ProcessSupervisor, StopOutcome, SupervisedProcess};
