//! Bidirectional reconciliation between the authoritative service row and
//! the on-disk artifacts (unit file, gateway block, supervisor state,
//! binary).
//!
//! The reconciler only observes and applies; it never chooses a direction.
//! After [`Reconciler::sync_record_to_system`], an immediate
//! [`Reconciler::sync_system_to_record`] returns the same record (ignoring
//! timestamps).

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::caddy::CaddyManager;
use crate::error::Result;
use crate::model::{Service, ServiceStatus, BINARY_NAME};
use crate::systemd::SystemdManager;

/// Per-field comparison between the record and the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ItemState<T> {
    /// Record and system agree.
    Synced,
    /// Both sides hold a value and they differ.
    Conflict { system: T, record: T },
    /// The artifact is absent (or unreadable) on disk.
    MissingFile,
    /// The record lacks the field the artifact carries.
    MissingCollection,
}

impl<T> ItemState<T> {
    pub fn is_synced(&self) -> bool {
        matches!(self, ItemState::Synced)
    }
}

/// Presence of the extracted binary in the service directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryState {
    Present,
    Missing,
}

/// Full reconciliation verdict for one service row.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigStatus {
    pub project_name: String,
    pub port: ItemState<u16>,
    pub subdomain: ItemState<String>,
    pub status: ItemState<ServiceStatus>,
    pub binary: BinaryState,
}

impl ConfigStatus {
    /// True when every field agrees and the binary is in place.
    pub fn is_synced(&self) -> bool {
        self.port.is_synced()
            && self.subdomain.is_synced()
            && self.status.is_synced()
            && self.binary == BinaryState::Present
    }
}

/// Artifacts emitted by a record→system sync, for digesting.
pub struct SyncedArtifacts {
    pub unit_content: String,
    pub block_content: String,
}

pub struct Reconciler {
    systemd: Arc<SystemdManager>,
    caddy: Arc<CaddyManager>,
    base_dir: PathBuf,
}

impl Reconciler {
    pub fn new(systemd: Arc<SystemdManager>, caddy: Arc<CaddyManager>, base_dir: PathBuf) -> Self {
        Self {
            systemd,
            caddy,
            base_dir,
        }
    }

    /// Compare the row against the unit file, gateway block, supervisor
    /// state, and binary. Unreadable or malformed artifacts classify as
    /// `MissingFile`; nothing here aborts.
    pub async fn classify(&self, service: &Service) -> ConfigStatus {
        let port = match self.systemd.read_port(&service.project_name) {
            Ok(system_port) if system_port == service.port => ItemState::Synced,
            Ok(system_port) => ItemState::Conflict {
                system: system_port,
                record: service.port,
            },
            Err(_) => ItemState::MissingFile,
        };

        let subdomain = self.classify_subdomain(service);

        let observed = if self.systemd.is_active(&service.project_name).await {
            ServiceStatus::Active
        } else {
            ServiceStatus::Inactive
        };
        let status = if observed == service.status {
            ItemState::Synced
        } else {
            ItemState::Conflict {
                system: observed,
                record: service.status,
            }
        };

        let binary = if service.service_dir(&self.base_dir).join(BINARY_NAME).is_file() {
            BinaryState::Present
        } else {
            BinaryState::Missing
        };

        ConfigStatus {
            project_name: service.project_name.clone(),
            port,
            subdomain,
            status,
            binary,
        }
    }

    fn classify_subdomain(&self, service: &Service) -> ItemState<String> {
        match self.caddy.has_block(service.subdomain(), &service.domain) {
            Ok(true) => ItemState::Synced,
            Ok(false) => {
                // No block under the record's host; something may still
                // route this port under another name.
                match self.caddy.read_subdomain_for_port(service.port) {
                    Ok(Some(found)) => ItemState::Conflict {
                        system: found,
                        record: service.subdomain().to_string(),
                    },
                    Ok(None) | Err(_) => ItemState::MissingFile,
                }
            }
            Err(_) => ItemState::MissingFile,
        }
    }

    /// Re-emit the artifacts from the record and align the run state with
    /// it: a unit that was running is bounced to pick up the new config, a
    /// unit whose record says `active` is started, one whose record says
    /// `inactive` is stopped.
    pub async fn sync_record_to_system(&self, service: &Service) -> Result<SyncedArtifacts> {
        let was_active = self.systemd.is_active(&service.project_name).await;

        let unit_content = self.systemd.write_unit(
            &service.project_name,
            &service.service_dir(&self.base_dir),
            service.port,
        )?;
        let block_content = self
            .caddy
            .add_or_replace(service.subdomain(), &service.domain, service.port)
            .await?;

        self.systemd.daemon_reload().await?;
        self.caddy.reload().await?;

        let should_run = match service.status {
            ServiceStatus::Active | ServiceStatus::Deploying => true,
            ServiceStatus::Inactive | ServiceStatus::Error => false,
        };

        match (was_active, should_run) {
            (true, true) => self.systemd.restart(&service.project_name).await?,
            (false, true) => self.systemd.start(&service.project_name).await?,
            (true, false) => self.systemd.stop(&service.project_name).await?,
            (false, false) => {}
        }

        Ok(SyncedArtifacts {
            unit_content,
            block_content,
        })
    }

    /// Overwrite port, subdomain, and status from the on-disk values and
    /// return the updated record. The caller persists it.
    pub async fn sync_system_to_record(&self, service: &Service) -> Result<Service> {
        let mut updated = service.clone();

        if let Ok(port) = self.systemd.read_port(&service.project_name) {
            updated.port = port;
        }

        if let Ok(Some(subdomain)) = self.caddy.read_subdomain_for_port(updated.port) {
            if subdomain == updated.project_name {
                updated.subdomain = None;
            } else {
                updated.subdomain = Some(subdomain);
            }
        }

        updated.status = if self.systemd.is_active(&service.project_name).await {
            ServiceStatus::Active
        } else {
            ServiceStatus::Inactive
        };

        Ok(updated)
    }
}
