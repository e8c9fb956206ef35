use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::{
    config_hash, Service, ServiceRequest, ServiceResponse, ServiceStatus, SERVICE_SUBDIRS,
};
use crate::rollback::{Journal, RollbackKind};

use super::Orchestrator;

/// Outcome of request preparation: either a fully resolved row persisted as
/// `deploying`, or a validation response to hand straight back.
enum Prepared {
    Ready(Service),
    Invalid(ServiceResponse),
}

impl Orchestrator {
    /// Create a service. Resolves defaults, validates, persists the row as
    /// `deploying`, then runs the deployment pipeline on a detached task —
    /// the caller gets the deploying row back immediately.
    pub async fn create(self: &Arc<Self>, request: ServiceRequest) -> Result<ServiceResponse> {
        let service = match self.prepare(request).await? {
            Prepared::Ready(service) => service,
            Prepared::Invalid(response) => return Ok(response),
        };

        let orchestrator = Arc::clone(self);
        let pipeline_row = service.clone();
        tokio::spawn(async move {
            // Failures are logged and recorded on the row inside deploy().
            let _ = orchestrator.deploy(pipeline_row).await;
        });

        Ok(ServiceResponse {
            id: service.id.clone(),
            status: ServiceStatus::Deploying.as_str().into(),
            message: "Service deployment started".into(),
            service: Some(service),
            errors: Vec::new(),
        })
    }

    /// Synchronous variant of [`create`](Self::create): waits for the
    /// pipeline and reports the final state.
    pub async fn create_blocking(self: &Arc<Self>, request: ServiceRequest) -> Result<ServiceResponse> {
        let service = match self.prepare(request).await? {
            Prepared::Ready(service) => service,
            Prepared::Invalid(response) => return Ok(response),
        };

        match self.deploy(service.clone()).await {
            Ok(()) => {
                let row = self.repo.get(&service.id).await?;
                Ok(ServiceResponse::ok(&service.id, "Service deployed successfully")
                    .with_service(row))
            }
            Err(e) => {
                let mut response =
                    ServiceResponse::error(e.to_string(), Vec::new());
                response.id = service.id.clone();
                if let Ok(row) = self.repo.get(&service.id).await {
                    response.service = Some(row);
                }
                Ok(response)
            }
        }
    }

    /// Resolve defaults, validate against the repository snapshot, and
    /// persist the `deploying` row. Port selection and the insert share the
    /// allocation mutex so concurrent creates cannot collide.
    async fn prepare(&self, request: ServiceRequest) -> Result<Prepared> {
        let version = match request.pocketbase_version {
            Some(version) => version,
            None => self
                .provisioner
                .latest_version()
                .await
                .map_err(|e| e.at_step("failed to resolve latest PocketBase version"))?,
        };
        let domain = request
            .domain
            .unwrap_or_else(|| self.settings.default_domain.clone());

        let _alloc = self.alloc_lock.lock().await;

        let used_ports = self.repo.used_ports().await?;
        let used_names = self.repo.used_names().await?;
        let port = match request.port {
            Some(port) => port,
            None => self.validator.next_port(&used_ports),
        };

        let validation = self.validator.validate_service_config(
            &request.project_name,
            port,
            &version,
            &domain,
            &used_names,
            &used_ports,
        );
        if !validation.is_valid {
            return Ok(Prepared::Invalid(ServiceResponse::error(
                "Validation failed",
                validation.errors,
            )));
        }

        let now = chrono::Utc::now();
        let service = Service {
            id: String::new(),
            project_name: request.project_name,
            port,
            pocketbase_version: version,
            domain,
            subdomain: request.subdomain,
            status: ServiceStatus::Deploying,
            systemd_config_hash: String::new(),
            caddy_config_hash: String::new(),
            last_health_check: None,
            created_by: request.created_by.unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };

        let persisted = self.repo.create(service).await?;
        tracing::info!(
            service = %persisted.project_name,
            port = persisted.port,
            version = %persisted.pocketbase_version,
            "service row created, deployment starting"
        );
        Ok(Prepared::Ready(persisted))
    }

    /// Run the pipeline under the per-service lock with a fresh journal.
    /// On failure: roll back, mark the row `error`, and surface the
    /// step-labelled failure (joined with any compensation errors).
    pub(super) async fn deploy(&self, service: Service) -> Result<()> {
        let lock = self.lock_for(&service.project_name);
        let _guard = lock.lock().await;

        let mut journal = Journal::new();
        match self.deploy_steps(&service, &mut journal).await {
            Ok((unit_content, block_content)) => {
                journal.clear();
                self.repo
                    .update_status(&service.id, ServiceStatus::Active)
                    .await?;
                self.repo
                    .update_config_hashes(
                        &service.id,
                        &config_hash(&unit_content),
                        &config_hash(&block_content),
                    )
                    .await?;
                tracing::info!(service = %service.project_name, "deployment completed");
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    service = %service.project_name,
                    step = e.step().unwrap_or("unknown"),
                    "deployment failed: {}",
                    e
                );

                let compensation_errors = journal.rollback().await;
                if let Err(status_err) = self
                    .repo
                    .update_status(&service.id, ServiceStatus::Error)
                    .await
                {
                    tracing::error!(
                        service = %service.project_name,
                        "failed to mark row as error: {}",
                        status_err
                    );
                }

                if compensation_errors.is_empty() {
                    Err(e)
                } else {
                    Err(Error::RollbackFailed {
                        operation: Box::new(e),
                        compensation_errors,
                    })
                }
            }
        }
    }

    /// The deployment pipeline proper. Every artifact-producing step pushes
    /// its compensation before the next step runs. Returns the unit and
    /// block contents for digesting.
    async fn deploy_steps(
        &self,
        service: &Service,
        journal: &mut Journal,
    ) -> Result<(String, String)> {
        let service_dir = service.service_dir(&self.settings.base_dir);
        let project_name = service.project_name.clone();

        std::fs::create_dir_all(&service_dir)
            .map_err(|e| Error::from(e).at_step("failed to create service directory"))?;
        {
            let dir = service_dir.clone();
            journal.push(
                RollbackKind::DirRemove,
                format!("remove directory {}", dir.display()),
                move || {
                    Box::pin(async move {
                        match std::fs::remove_dir_all(&dir) {
                            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                            _ => Ok(()),
                        }
                    })
                },
            );
        }

        let archive = self
            .provisioner
            .download(&service.pocketbase_version, &service_dir)
            .await
            .map_err(|e| e.at_step("failed to download PocketBase"))?;
        {
            let archive = archive.clone();
            journal.push(
                RollbackKind::FileRemove,
                format!("remove archive {}", archive.display()),
                move || {
                    Box::pin(async move {
                        match std::fs::remove_file(&archive) {
                            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                            _ => Ok(()),
                        }
                    })
                },
            );
        }

        let binary = self
            .provisioner
            .extract(&service_dir, &service.pocketbase_version)
            .await
            .map_err(|e| e.at_step("failed to extract PocketBase"))?;
        {
            let binary = binary.clone();
            journal.push(
                RollbackKind::FileRemove,
                format!("remove binary {}", binary.display()),
                move || {
                    Box::pin(async move {
                        match std::fs::remove_file(&binary) {
                            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                            _ => Ok(()),
                        }
                    })
                },
            );
        }

        for subdir in SERVICE_SUBDIRS {
            std::fs::create_dir_all(service_dir.join(subdir))
                .map_err(|e| Error::from(e).at_step("failed to create service subdirectories"))?;
        }

        let unit_content = self
            .systemd
            .write_unit(&service.project_name, &service_dir, service.port)
            .map_err(|e| e.at_step("failed to write unit file"))?;
        {
            let systemd = Arc::clone(&self.systemd);
            let name = project_name.clone();
            journal.push(
                RollbackKind::UnitRemove,
                format!("remove unit for {}", name),
                move || Box::pin(async move { systemd.remove(&name).await }),
            );
        }

        self.systemd
            .enable(&service.project_name)
            .await
            .map_err(|e| e.at_step("failed to enable service"))?;

        let block_content = self
            .caddy
            .add_or_replace(service.subdomain(), &service.domain, service.port)
            .await
            .map_err(|e| e.at_step("failed to add gateway configuration"))?;
        {
            let caddy = Arc::clone(&self.caddy);
            let subdomain = service.subdomain().to_string();
            let domain = service.domain.clone();
            journal.push(
                RollbackKind::GatewayRemove,
                format!("remove gateway block for {}.{}", subdomain, domain),
                move || {
                    Box::pin(async move {
                        caddy.remove(&subdomain, &domain).await?;
                        caddy.reload().await
                    })
                },
            );
        }

        self.caddy
            .reload()
            .await
            .map_err(|e| e.at_step("failed to reload gateway"))?;

        // Grace period for the instance to bind before the superuser call.
        tokio::time::sleep(Duration::from_secs(self.settings.bind_grace_secs)).await;

        if let Some(password) = &self.settings.superuser_password {
            if let Err(e) = self
                .provisioner
                .init_admin(&service_dir, &service.admin_email(), password)
                .await
            {
                tracing::warn!(
                    service = %service.project_name,
                    "superuser bootstrap failed (continuing): {}",
                    e
                );
            }
        }

        Ok((unit_content, block_content))
    }
}
