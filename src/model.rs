//! Domain types for managed PocketBase instances.
//!
//! A [`Service`] row is the product of record; the unit file, the gateway
//! site block, and the on-disk binary are derived artifacts. Everything the
//! orchestrator writes to disk is recomputable from the row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::validate::ValidationError;

/// Subdirectories created inside every service directory.
pub const SERVICE_SUBDIRS: [&str; 4] = ["pb_data", "pb_public", "pb_migrations", "pb_hooks"];

/// File name of the extracted PocketBase binary.
pub const BINARY_NAME: &str = "pocketbase";

/// Log file the unit appends stdout/stderr to.
pub const ERROR_LOG_NAME: &str = "errors.log";

/// Lifecycle state of a managed instance. `Deploying` is transient; the
/// other three are terminal until the next operation or health sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Deploying,
    Active,
    Inactive,
    Error,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Deploying => "deploying",
            ServiceStatus::Active => "active",
            ServiceStatus::Inactive => "inactive",
            ServiceStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One managed PocketBase instance, as stored in the backing collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// Opaque identifier assigned by the repository.
    pub id: String,

    /// Directory name and unit-file prefix. Unique case-insensitively.
    pub project_name: String,

    /// Loopback port the instance binds. Unique across services.
    pub port: u16,

    /// Semver-shaped PocketBase release, e.g. `0.28.4`.
    pub pocketbase_version: String,

    /// DNS domain; the instance is reachable at `<subdomain>.<domain>`.
    pub domain: String,

    /// Explicit subdomain override. Defaults to `project_name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,

    pub status: ServiceStatus,

    /// Digest over the unit-file content last written for this service.
    #[serde(default)]
    pub systemd_config_hash: String,

    /// Digest over the site-block content last written for this service.
    #[serde(default)]
    pub caddy_config_hash: String,

    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,

    /// Principal that created the row (email-shaped, opaque here).
    #[serde(default)]
    pub created_by: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Service {
    /// Effective subdomain: the explicit override, or the project name.
    pub fn subdomain(&self) -> &str {
        self.subdomain.as_deref().unwrap_or(&self.project_name)
    }

    /// Public host name, `<subdomain>.<domain>`.
    pub fn host(&self) -> String {
        format!("{}.{}", self.subdomain(), self.domain)
    }

    /// Directory owned by this service.
    pub fn service_dir(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(&self.project_name)
    }

    /// Unit file name, `<project_name>-pocketbase.service`.
    pub fn unit_name(&self) -> String {
        format!("{}-pocketbase.service", self.project_name)
    }

    /// Bootstrap superuser address, `admin@<subdomain>.<domain>`.
    pub fn admin_email(&self) -> String {
        format!("admin@{}", self.host())
    }
}

/// Inbound request to create or update a service. Optional fields are
/// resolved to defaults by the orchestrator before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub project_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pocketbase_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

/// Outcome of a service operation, shaped for the external record layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub id: String,
    pub status: String,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Service>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ValidationError>,
}

impl ServiceResponse {
    pub fn ok(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: "success".into(),
            message: message.into(),
            service: None,
            errors: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>, errors: Vec<ValidationError>) -> Self {
        Self {
            id: String::new(),
            status: "error".into(),
            message: message.into(),
            service: None,
            errors,
        }
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.service = Some(service);
        self
    }
}

/// Point-in-time supervisor view of a single instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub project_name: String,
    pub running: bool,
    pub supervisor_state: String,
    pub last_checked: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Hex SHA-256 digest of generated config content; stored on the row so the
/// health monitor can detect external edits.
pub fn config_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Service {
        Service {
            id: "abc123".into(),
            project_name: "moots".into(),
            port: 8094,
            pocketbase_version: "0.28.4".into(),
            domain: "example.com".into(),
            subdomain: None,
            status: ServiceStatus::Active,
            systemd_config_hash: String::new(),
            caddy_config_hash: String::new(),
            last_health_check: None,
            created_by: "ops@example.com".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn subdomain_defaults_to_project_name() {
        let mut svc = sample();
        assert_eq!(svc.subdomain(), "moots");
        assert_eq!(svc.host(), "moots.example.com");

        svc.subdomain = Some("api-moots".into());
        assert_eq!(svc.subdomain(), "api-moots");
        assert_eq!(svc.host(), "api-moots.example.com");
    }

    #[test]
    fn derived_paths_and_names() {
        let svc = sample();
        assert_eq!(svc.unit_name(), "moots-pocketbase.service");
        assert_eq!(
            svc.service_dir(Path::new("/home/ubuntu")),
            PathBuf::from("/home/ubuntu/moots")
        );
        assert_eq!(svc.admin_email(), "admin@moots.example.com");
    }

    #[test]
    fn config_hash_is_stable_and_content_sensitive() {
        let a = config_hash("reverse_proxy 127.0.0.1:8094");
        let b = config_hash("reverse_proxy 127.0.0.1:8094");
        let c = config_hash("reverse_proxy 127.0.0.1:8095");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&ServiceStatus::Deploying).unwrap();
        assert_eq!(json, "\"deploying\"");
        let back: ServiceStatus = serde_json::from_str("\"active\"").unwrap();
        assert_eq!(back, ServiceStatus::Active);
    }
}
