use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::{config_hash, Service, ServiceResponse, ServiceStatus};
use crate::rollback::{Journal, RollbackKind};
use crate::validate::{code, ValidationError};

use super::Orchestrator;

impl Orchestrator {
    /// Apply a record edit to the host. Computes the diff between `new`
    /// and `old` and touches only the affected artifacts, journaling the
    /// inverse of every change.
    pub async fn update(&self, new: Service, old: Service) -> Result<ServiceResponse> {
        if new.project_name != old.project_name {
            return Ok(ServiceResponse::error(
                "Renaming a service is not supported",
                vec![ValidationError {
                    field: "project_name".into(),
                    code: code::NAME_CHANGE_UNSUPPORTED.into(),
                    message: "Renaming would require moving the directory, unit file, and gateway \
                              block atomically; delete and recreate instead"
                        .into(),
                }],
            ));
        }

        let port_changed = new.port != old.port;
        let host_changed = new.host() != old.host();

        if port_changed {
            let used_ports: Vec<u16> = self
                .repo
                .used_ports()
                .await?
                .into_iter()
                .filter(|p| *p != old.port)
                .collect();
            let used_names: Vec<String> = Vec::new();
            let validation = self.validator.validate_service_config(
                &new.project_name,
                new.port,
                &new.pocketbase_version,
                &new.domain,
                &used_names,
                &used_ports,
            );
            if !validation.is_valid {
                return Ok(ServiceResponse::error("Validation failed", validation.errors));
            }
        }

        let lock = self.lock_for(&old.project_name);
        let _guard = lock.lock().await;

        let mut journal = Journal::new();
        match self
            .update_steps(&new, &old, port_changed, host_changed, &mut journal)
            .await
        {
            Ok(()) => {
                journal.clear();
                // Keep the digests written while the artifacts were
                // re-emitted; `new` still carries the pre-update values.
                let mut persisted = new.clone();
                if let Ok(row) = self.repo.get(&new.id).await {
                    persisted.systemd_config_hash = row.systemd_config_hash;
                    persisted.caddy_config_hash = row.caddy_config_hash;
                }
                self.repo.update(&persisted).await?;
                tracing::info!(service = %persisted.project_name, "update completed");
                Ok(ServiceResponse::ok(&persisted.id, "Service updated successfully")
                    .with_service(persisted))
            }
            Err(e) => {
                tracing::error!(
                    service = %new.project_name,
                    "update failed, rolling back: {}",
                    e
                );
                let compensation_errors = journal.rollback().await;
                if let Err(status_err) = self
                    .repo
                    .update_status(&new.id, ServiceStatus::Error)
                    .await
                {
                    tracing::error!(
                        service = %new.project_name,
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

    async fn update_steps(
        &self,
        new: &Service,
        old: &Service,
        port_changed: bool,
        host_changed: bool,
        journal: &mut Journal,
    ) -> Result<()> {
        let service_dir = new.service_dir(&self.settings.base_dir);
        let was_active = self.systemd.is_active(&old.project_name).await;

        if port_changed {
            // Capture the previous unit so a later failure can re-emit it.
            if let Ok(previous) = self.systemd.read_unit(&old.project_name) {
                let systemd = Arc::clone(&self.systemd);
                let name = old.project_name.clone();
                journal.push(
                    RollbackKind::UnitRestore,
                    format!("restore previous unit for {}", name),
                    move || Box::pin(async move { systemd.write_unit_raw(&name, &previous) }),
                );
            }

            let unit_content = self
                .systemd
                .write_unit(&new.project_name, &service_dir, new.port)
                .map_err(|e| e.at_step("failed to update unit file"))?;
            self.systemd
                .daemon_reload()
                .await
                .map_err(|e| e.at_step("failed to reload supervisor"))?;

            self.repo
                .update_config_hashes(
                    &new.id,
                    &config_hash(&unit_content),
                    &new.caddy_config_hash,
                )
                .await?;
        }

        if port_changed || host_changed {
            {
                let caddy = Arc::clone(&self.caddy);
                let old_sub = old.subdomain().to_string();
                let old_domain = old.domain.clone();
                let old_port = old.port;
                let new_sub = new.subdomain().to_string();
                let new_domain = new.domain.clone();
                let drop_new = host_changed;
                journal.push(
                    RollbackKind::GatewayRestore,
                    format!("restore gateway block for {}.{}", old_sub, old_domain),
                    move || {
                        Box::pin(async move {
                            if drop_new {
                                caddy.remove(&new_sub, &new_domain).await?;
                            }
                            caddy.add_or_replace(&old_sub, &old_domain, old_port).await?;
                            caddy.reload().await
                        })
                    },
                );
            }

            if host_changed {
                self.caddy
                    .remove(old.subdomain(), &old.domain)
                    .await
                    .map_err(|e| e.at_step("failed to remove previous gateway block"))?;
            }
            let block_content = self
                .caddy
                .add_or_replace(new.subdomain(), &new.domain, new.port)
                .await
                .map_err(|e| e.at_step("failed to update gateway configuration"))?;
            self.caddy
                .reload()
                .await
                .map_err(|e| e.at_step("failed to reload gateway"))?;

            let row = self.repo.get(&new.id).await?;
            self.repo
                .update_config_hashes(&new.id, &row.systemd_config_hash, &config_hash(&block_content))
                .await?;
        }

        if (port_changed || host_changed) && was_active {
            {
                let systemd = Arc::clone(&self.systemd);
                let name = new.project_name.clone();
                journal.push(
                    RollbackKind::ServiceStateRestore,
                    format!("restore running state for {}", name),
                    move || Box::pin(async move { systemd.start(&name).await }),
                );
            }
            self.systemd
                .stop(&new.project_name)
                .await
                .map_err(|e| e.at_step("failed to stop service for update"))?;
            self.systemd
                .start(&new.project_name)
                .await
                .map_err(|e| e.at_step("failed to restart service after update"))?;
            return Ok(());
        }

        // Pure status flip: no artifacts changed, only the run state.
        if new.status != old.status {
            match (new.status, old.status) {
                (ServiceStatus::Active, previous) if previous != ServiceStatus::Active => {
                    {
                        let systemd = Arc::clone(&self.systemd);
                        let name = new.project_name.clone();
                        journal.push(
                            RollbackKind::ServiceStateRestore,
                            format!("stop {} again", name),
                            move || Box::pin(async move { systemd.stop(&name).await }),
                        );
                    }
                    self.systemd
                        .start(&new.project_name)
                        .await
                        .map_err(|e| e.at_step("failed to start service"))?;
                }
                (ServiceStatus::Inactive, ServiceStatus::Active) => {
                    {
                        let systemd = Arc::clone(&self.systemd);
                        let name = new.project_name.clone();
                        journal.push(
                            RollbackKind::ServiceStateRestore,
                            format!("start {} again", name),
                            move || Box::pin(async move { systemd.start(&name).await }),
                        );
                    }
                    self.systemd
                        .stop(&new.project_name)
                        .await
                        .map_err(|e| e.at_step("failed to stop service"))?;
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Tear a service down: unit, gateway block, row. Both artifact
    /// removals tolerate already-missing state. The data directory is
    /// preserved for rows that reached `active` (current status `active`
    /// or `inactive`); rows that never deployed cleanly are removed
    /// entirely.
    pub async fn delete(&self, id: &str) -> Result<ServiceResponse> {
        let service = self.repo.get(id).await?;
        let lock = self.lock_for(&service.project_name);
        let _guard = lock.lock().await;

        self.systemd
            .remove(&service.project_name)
            .await
            .map_err(|e| e.at_step("failed to remove unit"))?;

        self.caddy
            .remove(service.subdomain(), &service.domain)
            .await
            .map_err(|e| e.at_step("failed to remove gateway block"))?;
        if let Err(e) = self.caddy.reload().await {
            // A gateway that cannot reload should not block the teardown;
            // the block is already gone from the config.
            tracing::warn!(
                service = %service.project_name,
                "gateway reload after delete failed: {}",
                e
            );
        }

        let service_dir = service.service_dir(&self.settings.base_dir);
        let preserved = matches!(
            service.status,
            ServiceStatus::Active | ServiceStatus::Inactive
        );
        if preserved {
            tracing::info!(
                service = %service.project_name,
                "service data preserved at {}",
                service_dir.display()
            );
        } else {
            match std::fs::remove_dir_all(&service_dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::from(e).at_step("failed to remove service directory")),
            }
        }

        self.repo.delete(id).await?;

        tracing::info!(service = %service.project_name, "service deleted");
        let message = if preserved {
            format!(
                "Service deleted; data preserved at {}",
                service_dir.display()
            )
        } else {
            "Service deleted".to_string()
        };
        Ok(ServiceResponse::ok(id, message))
    }
}
