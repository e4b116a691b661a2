// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Ties the pieces together: launch the host engine, create the fake GPUs,
//! push a first round of telemetry and hand back what the CLI needs to keep
//! refreshing.

use crate::config::ManagerConfig;
use crate::dcgm::{DcgmConnector, LibDcgmConnector};
use crate::error::{DcgmError, ManagerError, ProvisionError, StartError};
use crate::pid_store::FilePidStore;
use crate::probe::TcpReadinessProbe;
use crate::provisioner::{DeviceEntity, EntityProvisioner};
use crate::scheduler::{RefreshScheduler, SchedulerStats, run_refresh_cycle};
use crate::supervisor::{LaunchSpec, ProcessSupervisor, StopOutcome, SupervisedProcess};
use crate::telemetry::RefreshReport;
use crate::wrapper::write_wrapper;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// What `start` does when a host engine is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnAlreadyRunning {
    /// Leave it alone and do nothing.
    Abort,
    /// Stop it and start a fresh one.
    Restart,
    /// Keep it and refresh its telemetry.
    Ignore,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartReport {
    Started {
        process: SupervisedProcess,
        entities: Vec<DeviceEntity>,
        /// `None` when the first refresh failed.
        initial_refresh: Option<RefreshReport>,
        wrapper: Option<PathBuf>,
    },
    /// An engine was already running and was kept.
    Reused { pid: u32 },
    /// An engine was already running and start was abandoned.
    Declined { pid: u32 },
}

impl StartReport {
    pub fn pid(&self) -> u32 {
        match self {
            StartReport::Started { process, .. } => process.pid,
            StartReport::Reused { pid } | StartReport::Declined { pid } => *pid,
        }
    }

    /// Whether an engine this run is responsible for refreshing is up.
    pub fn wants_refresh(&self) -> bool {
        !matches!(self, StartReport::Declined { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub pid: Option<u32>,
    pub port_open: bool,
    /// GPUs the host engine reports, including the baseline one. `None` when
    /// not running or the query failed.
    pub entity_count: Option<usize>,
    pub log_path: PathBuf,
}

pub struct FakeGpuManager {
    config: ManagerConfig,
    supervisor: ProcessSupervisor,
    connector: Arc<dyn DcgmConnector>,
}

impl FakeGpuManager {
    /// Production wiring: pid file on disk, TCP readiness and `libdcgm.so`
    /// from the DCGM build.
    pub fn new(config: ManagerConfig) -> Self {
        let supervisor = ProcessSupervisor::new(
            LaunchSpec::from_config(&config),
            config.timings,
            Arc::new(FilePidStore::new(&config.pid_file)),
            Arc::new(TcpReadinessProbe),
        );
        let connector = Arc::new(LibDcgmConnector::new(&config.dcgm_dir, config.endpoint()));
        Self::with_parts(config, supervisor, connector)
    }

    pub fn with_parts(
        config: ManagerConfig,
        supervisor: ProcessSupervisor,
        connector: Arc<dyn DcgmConnector>,
    ) -> Self {
        Self {
            config,
            supervisor,
            connector,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn is_running(&mut self) -> Option<u32> {
        self.supervisor.is_running()
    }

    pub async fn start(&mut self, policy: OnAlreadyRunning) -> Result<StartReport, ManagerError> {
        if let Some(pid) = self.supervisor.is_running() {
            warn!("DCGM is already running (PID: {pid})");
            match policy {
                OnAlreadyRunning::Abort => {
                    info!("Exiting...");
                    return Ok(StartReport::Declined { pid });
                }
                OnAlreadyRunning::Ignore => {
                    info!("Keeping the running host engine");
                    self.initial_refresh().await;
                    return Ok(StartReport::Reused { pid });
                }
                OnAlreadyRunning::Restart => {
                    self.supervisor.stop().await;
                    sleep(self.config.timings.restart_delay).await;
                }
            }
        }

        let process = match self.supervisor.start().await {
            Ok(process) => process,
            Err(e) => {
                error!("Failed to start host engine: {e}");
                if matches!(e, StartError::ReadinessTimeout { .. }) {
                    self.supervisor.stop().await;
                }
                return Err(e.into());
            }
        };

        sleep(self.config.startup_settle).await;

        let entities = match self.provision().await {
            Ok(entities) => entities,
            Err(e) => {
                error!("Failed to create fake GPUs: {e}");
                self.supervisor.stop().await;
                return Err(e.into());
            }
        };

        sleep(self.config.provision_settle).await;
        let initial_refresh = self.initial_refresh().await;

        let wrapper = match write_wrapper(&self.config.dcgm_dir) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Could not create dcgm.sh wrapper: {e}");
                None
            }
        };

        Ok(StartReport::Started {
            process,
            entities,
            initial_refresh,
            wrapper,
        })
    }

    async fn provision(&self) -> Result<Vec<DeviceEntity>, ProvisionError> {
        let connector = Arc::clone(&self.connector);
        let count = self.config.num_gpus;
        tokio::task::spawn_blocking(move || {
            let mut client = connector.connect()?;
            EntityProvisioner::new(client.as_mut()).create_entities(count)
        })
        .await
        .map_err(|e| ProvisionError::Aborted(e.to_string()))?
    }

    async fn initial_refresh(&self) -> Option<RefreshReport> {
        match run_refresh_cycle(Arc::clone(&self.connector), self.config.refresh_timeout).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Failed to inject metrics (GPUs created but no metrics): {e}");
                None
            }
        }
    }

    pub async fn stop(&mut self) -> StopOutcome {
        self.supervisor.stop().await
    }

    pub async fn restart(&mut self) -> Result<StartReport, ManagerError> {
        self.supervisor.stop().await;
        sleep(self.config.timings.restart_delay).await;
        self.start(OnAlreadyRunning::Restart).await
    }

    pub async fn status(&mut self) -> StatusReport {
        let log_path = self.config.log_file.clone();
        let Some(pid) = self.supervisor.is_running() else {
            warn!("DCGM is not running");
            return StatusReport {
                pid: None,
                port_open: false,
                entity_count: None,
                log_path,
            };
        };

        info!("DCGM is running (PID: {pid})");
        info!("Log file: {}", log_path.display());

        let port_open = self
            .supervisor
            .probe()
            .is_ready(
                &self.config.host,
                self.config.port,
                self.config.timings.probe_timeout,
            )
            .await;
        if port_open {
            info!("✓ Port {} is open and accepting connections", self.config.port);
        } else {
            warn!("Port {} is not accessible", self.config.port);
        }

        let entity_count = match self.count_entities().await {
            Ok(count) => {
                info!("Number of GPUs: {count}");
                Some(count)
            }
            Err(e) => {
                warn!("Could not query GPU count: {e}");
                None
            }
        };

        StatusReport {
            pid: Some(pid),
            port_open,
            entity_count,
            log_path,
        }
    }

    async fn count_entities(&self) -> Result<usize, String> {
        let connector = Arc::clone(&self.connector);
        let task = tokio::task::spawn_blocking(move || -> Result<usize, DcgmError> {
            Ok(connector.connect()?.list_entities()?.len())
        });
        match timeout(self.config.refresh_timeout, task).await {
            Ok(Ok(result)) => result.map_err(|e| e.to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.config.refresh_timeout)),
        }
    }

    /// Starts the periodic refresh against this manager's host engine.
    pub fn spawn_refresher(&self, token: CancellationToken) -> JoinHandle<SchedulerStats> {
        RefreshScheduler::spawn(
            Arc::clone(&self.connector),
            self.config.refresh_interval,
            self.config.refresh_timeout,
            token,
        )
    }
}

/// Human readable summary printed after a successful start.
pub fn usage_summary(
    config: &ManagerConfig,
    process: &SupervisedProcess,
    entities: &[DeviceEntity],
    refreshing: bool,
) -> String {
    let rule = "=".repeat(50);
    let dir = config.dcgm_dir.display();
    let gpus = match (entities.first(), entities.last()) {
        (Some(first), Some(last)) => format!(
            "{} (GPUs {}-{})",
            entities.len(),
            first.entity_id,
            last.entity_id
        ),
        _ => "0".to_string(),
    };
    let metrics = if refreshing {
        format!(
            "Auto-updating every {} seconds",
            config.refresh_interval.as_secs()
        )
    } else {
        "Injected once".to_string()
    };

    format!(
        "{rule}\n✓ Setup Complete!\n{rule}\n\n\
         Host Engine PID: {pid}\n\
         Fake GPUs: {gpus}\n\
         Note: GPU 0 is from NVML injection (shows N/A)\n\
         Metrics: {metrics}\n\
         Log File: {log}\n\n\
         Usage:\n  {dir}/dcgm.sh discovery -l\n  {dir}/dcgm.sh dmon -e 150,155,203,204\n\n\
         To stop: fake-dcgm stop\nOr: kill {pid}\n",
        pid = process.pid,
        log = process.log_path.display(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorTimings;
    use crate::dcgm::{DeviceAttribute, InMemoryDcgm};
    use crate::pid_store::{MemoryPidStore, PidStore};
    use crate::supervisor::pid_alive;
    use crate::supervisor::tests::{FixedProbe, fast_timings};
    use std::path::Path;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        dcgm: InMemoryDcgm,
        store: MemoryPidStore,
        manager: FakeGpuManager,
    }

    fn config(dir: &Path, timings: SupervisorTimings) -> ManagerConfig {
        ManagerConfig {
            dcgm_dir: dir.to_path_buf(),
            num_gpus: 4,
            pid_file: dir.join("engine.pid"),
            log_file: dir.join("engine.log"),
            timings,
            startup_settle: Duration::ZERO,
            provision_settle: Duration::ZERO,
            refresh_interval: Duration::from_millis(20),
            refresh_timeout: Duration::from_secs(5),
            ..ManagerConfig::default()
        }
    }

    fn fixture_with(program: &str, args: &[&str], dcgm: InMemoryDcgm) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), fast_timings());
        let store = MemoryPidStore::new();
        let launch = LaunchSpec {
            program: PathBuf::from(program),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: dir.path().to_path_buf(),
            env: Vec::new(),
            log_path: config.log_file.clone(),
            host: config.host.clone(),
            port: config.port,
        };
        let supervisor = ProcessSupervisor::new(
            launch,
            config.timings,
            Arc::new(store.clone()),
            Arc::new(FixedProbe(true)),
        );
        let manager = FakeGpuManager::with_parts(config, supervisor, Arc::new(dcgm.clone()));
        Fixture {
            _dir: dir,
            dcgm,
            store,
            manager,
        }
    }

    fn fixture() -> Fixture {
        fixture_with("/bin/sleep", &["60"], InMemoryDcgm::new())
    }

    #[tokio::test]
    async fn test_start_provisions_and_refreshes() {
        let mut f = fixture();
        let report = f.manager.start(OnAlreadyRunning::Abort).await.unwrap();

        let StartReport::Started {
            process,
            entities,
            initial_refresh,
            wrapper,
        } = report
        else {
            panic!("expected a fresh start");
        };
        assert_eq!(entities.len(), 4);
        assert_eq!(f.dcgm.create_calls(), vec![4]);
        assert_eq!(
            initial_refresh,
            Some(RefreshReport {
                entities: 4,
                pushed: 36,
                failed: 0
            })
        );
        assert!(f.dcgm.injections_for(0).is_empty());
        assert_eq!(
            f.dcgm.attribute(3, DeviceAttribute::Name).as_deref(),
            Some("A100-SXM4-40GB")
        );
        assert!(wrapper.unwrap().ends_with("dcgm.sh"));
        assert_eq!(f.store.load().unwrap(), Some(process.pid));

        assert_eq!(f.manager.stop().await, StopOutcome::Graceful);
        assert_eq!(f.store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_already_running_abort_keeps_engine() {
        let mut f = fixture();
        let first = f.manager.start(OnAlreadyRunning::Abort).await.unwrap().pid();

        let report = f.manager.start(OnAlreadyRunning::Abort).await.unwrap();
        assert_eq!(report, StartReport::Declined { pid: first });
        assert!(!report.wants_refresh());
        assert_eq!(f.dcgm.create_calls(), vec![4], "no second provisioning");
        assert!(pid_alive(first));

        f.manager.stop().await;
    }

    #[tokio::test]
    async fn test_already_running_ignore_refreshes_existing() {
        let mut f = fixture();
        let first = f.manager.start(OnAlreadyRunning::Abort).await.unwrap().pid();
        f.dcgm.clear_injections();

        let report = f.manager.start(OnAlreadyRunning::Ignore).await.unwrap();
        assert_eq!(report, StartReport::Reused { pid: first });
        assert!(report.wants_refresh());
        assert_eq!(f.dcgm.injections().len(), 36);

        f.manager.stop().await;
    }

    #[tokio::test]
    async fn test_already_running_restart_replaces_engine() {
        let mut f = fixture();
        let first = f.manager.start(OnAlreadyRunning::Abort).await.unwrap().pid();

        let second = f.manager.start(OnAlreadyRunning::Restart).await.unwrap().pid();
        assert_ne!(first, second);
        assert!(!pid_alive(first));
        assert_eq!(f.store.load().unwrap(), Some(second));

        f.manager.stop().await;
    }

    #[tokio::test]
    async fn test_early_exit_provisions_nothing() {
        let mut f = fixture_with("/bin/sh", &["-c", "exit 7"], InMemoryDcgm::new());

        let err = f.manager.start(OnAlreadyRunning::Abort).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Start(StartError::ExitedEarly { code: Some(7), .. })
        ));
        assert!(f.dcgm.create_calls().is_empty());
        assert_eq!(f.dcgm.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_shortfall_stops_engine() {
        let mut f = fixture_with("/bin/sleep", &["60"], InMemoryDcgm::new().with_shortfall(1));

        let err = f.manager.start(OnAlreadyRunning::Abort).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Provision(ProvisionError::Shortfall {
                requested: 4,
                created: 3
            })
        ));
        assert_eq!(f.store.load().unwrap(), None, "engine was stopped");
        assert!(f.dcgm.injections().is_empty(), "no telemetry after a failed provision");
    }

    #[tokio::test]
    async fn test_unreachable_dcgm_stops_engine() {
        let dcgm = InMemoryDcgm::new();
        dcgm.set_reachable(false);
        let mut f = fixture_with("/bin/sleep", &["60"], dcgm);

        let err = f.manager.start(OnAlreadyRunning::Abort).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Provision(ProvisionError::Client(DcgmError::Connection { .. }))
        ));
        assert_eq!(f.manager.is_running(), None);
    }

    #[tokio::test]
    async fn test_failed_first_refresh_is_not_fatal() {
        let mut f = fixture();
        f.dcgm.set_call_delay(Duration::from_millis(20));
        f.manager.config.refresh_timeout = Duration::from_millis(1);

        let report = f.manager.start(OnAlreadyRunning::Abort).await.unwrap();
        assert!(matches!(
            report,
            StartReport::Started {
                initial_refresh: None,
                ..
            }
        ));
        f.manager.stop().await;
    }

    #[tokio::test]
    async fn test_status() {
        let mut f = fixture();
        let stopped = f.manager.status().await;
        assert_eq!(stopped.pid, None);
        assert_eq!(stopped.entity_count, None);

        let pid = f.manager.start(OnAlreadyRunning::Abort).await.unwrap().pid();
        let running = f.manager.status().await;
        assert_eq!(running.pid, Some(pid));
        assert!(running.port_open);
        assert_eq!(running.entity_count, Some(5), "four fake GPUs plus the baseline");

        f.manager.stop().await;
    }

    #[tokio::test]
    async fn test_refresher_targets_manager_connector() {
        let mut f = fixture();
        f.manager.start(OnAlreadyRunning::Abort).await.unwrap();
        f.dcgm.clear_injections();

        let token = CancellationToken::new();
        let handle = f.manager.spawn_refresher(token.clone());
        while f.dcgm.injections().len() < 36 {
            sleep(Duration::from_millis(10)).await;
        }
        token.cancel();
        assert!(handle.await.unwrap().cycles >= 1);

        f.manager.stop().await;
    }

    #[test]
    fn test_usage_summary() {
        let config = ManagerConfig {
            dcgm_dir: PathBuf::from("/opt/dcgm"),
            ..ManagerConfig::default()
        };
        let process = SupervisedProcess {
            pid: 4321,
            log_path: PathBuf::from("/tmp/dcgm-fake.log"),
            readiness_port: 5555,
        };
        let entities: Vec<DeviceEntity> = (1..=4)
            .map(|id| DeviceEntity {
                entity_id: id,
                model: "H100-SXM5-80GB".into(),
                uuid: String::new(),
                pci_bus_id: String::new(),
            })
            .collect();

        let summary = usage_summary(&config, &process, &entities, true);
        assert!(summary.contains("Host Engine PID: 4321\n"));
        assert!(summary.contains("Fake GPUs: 4 (GPUs 1-4)\n"));
        assert!(summary.contains("Metrics: Auto-updating every 30 seconds\n"));
        assert!(summary.contains("  /opt/dcgm/dcgm.sh dmon -e 150,155,203,204\n"));
        assert!(summary.contains("Or: kill 4321\n"));

        let once = usage_summary(&config, &process, &[], false);
        assert!(once.contains("Fake GPUs: 0\n"));
        assert!(once.contains("Metrics: Injected once\n"));
    }
}
