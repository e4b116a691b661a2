// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use clap::{Parser, ValueEnum};
use fake_dcgm::OnAlreadyRunning;
use fake_dcgm::config::Overrides;
use std::path::PathBuf;

/// Manage a DCGM host engine populated with fake GPUs
#[derive(Parser, Debug, Clone)]
#[command(name = "fake-dcgm", version)]
#[command(about = "Start a DCGM host engine with fake GPUs and synthetic metrics")]
pub struct Args {
    /// What to do with the host engine
    #[arg(value_enum, default_value_t = Action::Start)]
    pub action: Action,

    /// Number of fake GPUs to create
    #[arg(short = 'n', long)]
    pub num_gpus: Option<u32>,

    /// DCGM build directory containing bin/nv-hostengine and lib/
    #[arg(short = 'd', long)]
    pub dcgm_dir: Option<PathBuf>,

    /// YAML config file
    #[arg(long, env = "DD_FAKE_DCGM_CONFIG")]
    pub config: Option<PathBuf>,

    /// What `start` does when a host engine is already running
    #[arg(long, value_enum, default_value_t = RunningPolicy::Prompt)]
    pub on_running: RunningPolicy,

    /// Inject metrics once and exit instead of refreshing until interrupted
    #[arg(long)]
    pub once: bool,

    /// Log at debug level
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            dcgm_dir: self.dcgm_dir.clone(),
            num_gpus: self.num_gpus,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    Restart,
    Status,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningPolicy {
    /// Ask on the terminal
    Prompt,
    Abort,
    Restart,
    Ignore,
}

impl RunningPolicy {
    /// `None` means the user has to be asked.
    pub fn resolved(self) -> Option<OnAlreadyRunning> {
        match self {
            RunningPolicy::Prompt => None,
            RunningPolicy::Abort => Some(OnAlreadyRunning::Abort),
            RunningPolicy::Restart => Some(OnAlreadyRunning::Restart),
            RunningPolicy::Ignore => Some(OnAlreadyRunning::Ignore),
        }
    }
}

/// Reads a y/n answer. Anything but "y" declines.
pub fn parse_answer(line: &str) -> OnAlreadyRunning {
    if line.trim().eq_ignore_ascii_case("y") {
        OnAlreadyRunning::Restart
    } else {
        OnAlreadyRunning::Abort
    }
}
