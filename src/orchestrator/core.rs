use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::caddy::CaddyManager;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::model::{HealthStatus, Service, ServiceResponse, ServiceStatus};
use crate::provision::Provisioner;
use crate::repo::ServiceRepository;
use crate::sync::{ConfigStatus, Reconciler};
use crate::systemd::SystemdManager;
use crate::validate::Validator;

/// Supervisor-level action on an existing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Start,
    Stop,
    Restart,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Start => "start",
            ControlAction::Stop => "stop",
            ControlAction::Restart => "restart",
        }
    }
}

impl FromStr for ControlAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(ControlAction::Start),
            "stop" => Ok(ControlAction::Stop),
            "restart" => Ok(ControlAction::Restart),
            other => Err(Error::Configuration(format!("invalid action: {}", other))),
        }
    }
}

/// Coordinates the repository, the unit and gateway managers, and the
/// provisioner into transactional service workflows.
///
/// # Locking
///
/// - Every mutating operation on a service serializes on a per-name async
///   lock from the keyed lock map; operations on distinct services run in
///   parallel.
/// - Port allocation and the subsequent repository insert run under one
///   allocation mutex, so two concurrent creates can never agree on the
///   same port.
/// - The gateway file and `daemon-reload` carry their own process-wide
///   locks inside their managers.
pub struct Orchestrator {
    pub(super) settings: Settings,
    pub(super) repo: Arc<dyn ServiceRepository>,
    pub(super) systemd: Arc<SystemdManager>,
    pub(super) caddy: Arc<CaddyManager>,
    pub(super) provisioner: Arc<dyn Provisioner>,
    pub(super) validator: Validator,
    pub(super) reconciler: Reconciler,
    service_locks: SyncMutex<HashMap<String, Arc<Mutex<()>>>>,
    pub(super) alloc_lock: Mutex<()>,
    pub(super) shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        repo: Arc<dyn ServiceRepository>,
        systemd: Arc<SystemdManager>,
        caddy: Arc<CaddyManager>,
        provisioner: Arc<dyn Provisioner>,
        validator: Validator,
    ) -> Self {
        let reconciler = Reconciler::new(
            Arc::clone(&systemd),
            Arc::clone(&caddy),
            settings.base_dir.clone(),
        );
        Self {
            settings,
            repo,
            systemd,
            caddy,
            provisioner,
            validator,
            reconciler,
            service_locks: SyncMutex::new(HashMap::new()),
            alloc_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn repository(&self) -> &Arc<dyn ServiceRepository> {
        &self.repo
    }

    /// Signal background tasks (health monitor, pending sweeps) to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// The per-service lock for `project_name`; all mutating operations on
    /// one service funnel through it.
    pub(super) fn lock_for(&self, project_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.service_locks.lock();
        Arc::clone(
            locks
                .entry(project_name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Reconciliation verdict for one row.
    pub async fn classify(&self, id: &str) -> Result<ConfigStatus> {
        let service = self.repo.get(id).await?;
        Ok(self.reconciler.classify(&service).await)
    }

    /// Dispatch a start/stop/restart to the supervisor and record the
    /// resulting status.
    pub async fn control(&self, id: &str, action: ControlAction) -> Result<ServiceResponse> {
        let service = self.repo.get(id).await?;
        let lock = self.lock_for(&service.project_name);
        let _guard = lock.lock().await;

        match action {
            ControlAction::Start => self.systemd.start(&service.project_name).await?,
            ControlAction::Stop => self.systemd.stop(&service.project_name).await?,
            ControlAction::Restart => self.systemd.restart(&service.project_name).await?,
        }

        let new_status = match action {
            ControlAction::Stop => ServiceStatus::Inactive,
            ControlAction::Start | ControlAction::Restart => ServiceStatus::Active,
        };
        self.repo.update_status(id, new_status).await?;

        tracing::info!(
            service = %service.project_name,
            action = action.as_str(),
            "control action completed"
        );
        Ok(ServiceResponse::ok(
            id,
            format!("Service {} completed successfully", action.as_str()),
        ))
    }

    /// Supervisor view of a service. Supervisor trouble degrades to
    /// `running: false` with a message; this never raises past a missing
    /// row.
    pub async fn status(&self, id: &str) -> Result<HealthStatus> {
        let service = self.repo.get(id).await?;
        let running = self.systemd.is_active(&service.project_name).await;

        Ok(HealthStatus {
            project_name: service.project_name,
            running,
            supervisor_state: if running { "active".into() } else { "inactive".into() },
            last_checked: Utc::now(),
            error: None,
        })
    }

    /// Last `n` journal lines for the service, split on newlines.
    pub async fn logs(&self, id: &str, n: usize) -> Result<Vec<String>> {
        let service = self.repo.get(id).await?;
        let raw = self.systemd.logs(&service.project_name, n).await?;
        Ok(raw
            .trim_end_matches('\n')
            .split('\n')
            .map(str::to_string)
            .collect())
    }

    /// Fetch a row by project name (CLI convenience).
    pub async fn find_by_name(&self, name: &str) -> Result<Service> {
        self.repo.get_by_name(name).await
    }
}
