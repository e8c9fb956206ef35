//! Record-event bridge.
//!
//! The external record layer (REST surface, admin UI) owns the collection;
//! when it writes a row it calls into this module, which synthesizes typed
//! values and dispatches the matching orchestrator workflow. Startup wiring
//! also schedules the health monitor here.

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::model::{Service, ServiceRequest, ServiceResponse};
use crate::orchestrator::Orchestrator;

pub struct ServiceHooks {
    orchestrator: Arc<Orchestrator>,
}

impl ServiceHooks {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// A row was created: kick off the deployment pipeline. Returns as
    /// soon as the row is persisted as `deploying`; the pipeline continues
    /// on its own task.
    pub async fn on_record_created(&self, request: ServiceRequest) -> Result<ServiceResponse> {
        self.orchestrator.create(request).await
    }

    /// A row was edited: reconcile the host with the new values.
    pub async fn on_record_updated(&self, new: Service, old: Service) -> Result<ServiceResponse> {
        self.orchestrator.update(new, old).await
    }

    /// A row was deleted: tear down the artifacts it owned.
    pub async fn on_record_deleted(&self, id: &str) -> Result<ServiceResponse> {
        self.orchestrator.delete(id).await
    }

    /// Schedule the background health monitor.
    pub fn schedule_health_monitor(&self) -> JoinHandle<()> {
        self.orchestrator.spawn_monitor()
    }
}
