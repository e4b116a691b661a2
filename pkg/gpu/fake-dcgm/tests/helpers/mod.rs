// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use fake_dcgm::dcgm::InMemoryDcgm;
use fake_dcgm::{
    FakeGpuManager, FilePidStore, LaunchSpec, ManagerConfig, ProcessSupervisor, SupervisorTimings,
    TcpReadinessProbe,
};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Fake host engine that stays up until signaled.
pub const HEALTHY_ENGINE: &str = "#!/bin/sh\necho \"fake nv-hostengine $*\"\nexec sleep 300\n";

/// Fake host engine that fails right away.
pub const CRASHING_ENGINE: &str = "#!/bin/sh\necho \"cannot bind port\" >&2\nexit 3\n";

/// A DCGM build directory with a scripted `bin/nv-hostengine`, a listener
/// standing in for the engine's port and an in-memory DCGM.
pub struct Harness {
    pub dir: TempDir,
    pub dcgm: InMemoryDcgm,
    pub config: ManagerConfig,
    _listener: TcpListener,
}

impl Harness {
    pub async fn new(engine_script: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let engine = bin.join("nv-hostengine");
        std::fs::write(&engine, engine_script).unwrap();
        std::fs::set_permissions(&engine, std::fs::Permissions::from_mode(0o755)).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = ManagerConfig {
            dcgm_dir: dir.path().to_path_buf(),
            num_gpus: 4,
            host: "127.0.0.1".to_string(),
            port,
            pid_file: dir.path().join("dcgm-fake-gpu.pid"),
            log_file: dir.path().join("dcgm-fake.log"),
            timings: SupervisorTimings {
                poll_interval: Duration::from_millis(50),
                max_attempts: 10,
                probe_timeout: Duration::from_millis(200),
                stop_grace: Duration::from_secs(1),
                kill_wait: Duration::from_secs(1),
                restart_delay: Duration::from_millis(10),
            },
            startup_settle: Duration::ZERO,
            provision_settle: Duration::ZERO,
            refresh_interval: Duration::from_millis(50),
            refresh_timeout: Duration::from_secs(5),
        };
        config.validate().unwrap();

        Self {
            dir,
            dcgm: InMemoryDcgm::new(),
            config,
            _listener: listener,
        }
    }

    /// A manager as a separate invocation of the tool would build it: fresh
    /// supervisor, same pid file.
    pub fn manager(&self) -> FakeGpuManager {
        let supervisor = ProcessSupervisor::new(
            LaunchSpec::from_config(&self.config),
            self.config.timings,
            Arc::new(FilePidStore::new(&self.config.pid_file)),
            Arc::new(TcpReadinessProbe),
        );
        FakeGpuManager::with_parts(self.config.clone(), supervisor, Arc::new(self.dcgm.clone()))
    }

    pub fn pid_file(&self) -> &Path {
        &self.config.pid_file
    }
}

pub fn pid_is_alive(pid: u32) -> bool {
    fake_dcgm::supervisor::pid_alive(pid)
}

/// Poll until `pid` is gone or the timeout elapses.
pub fn wait_for_pid_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !pid_is_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}
