//! Process configuration.
//!
//! Settings are loaded from a YAML file (all fields optional, falling back
//! to the defaults below) and stay immutable for the lifetime of the
//! process. An unreadable or malformed settings file is an unrecoverable
//! startup failure.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Floor for auto-assigned instance ports.
pub const DEFAULT_PORT_BASE: u16 = 8091;

/// Health monitor period (seconds).
pub const DEFAULT_HEALTH_PERIOD_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Where per-service directories live.
    pub base_dir: PathBuf,

    /// Where systemd unit files live.
    pub unit_dir: PathBuf,

    /// Path to the shared Caddyfile.
    pub gateway_config: PathBuf,

    /// Domain used when a service does not supply one.
    pub default_domain: String,

    /// Backing state file for the shipped JSON repository.
    pub state_file: PathBuf,

    /// Password for the best-effort superuser bootstrap. When unset the
    /// admin-init step is skipped.
    pub superuser_password: Option<String>,

    /// Health monitor period in seconds.
    pub health_check_period_secs: u64,

    /// Seconds to wait after the gateway reload for the instance to bind,
    /// before the superuser bootstrap runs.
    pub bind_grace_secs: u64,

    /// Floor for auto-assigned ports.
    pub port_base: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/home/ubuntu"),
            unit_dir: PathBuf::from("/lib/systemd/system"),
            gateway_config: PathBuf::from("/etc/caddy/Caddyfile"),
            default_domain: String::from("localhost"),
            state_file: PathBuf::from("/home/ubuntu/.pockestrator/services.json"),
            superuser_password: None,
            health_check_period_secs: DEFAULT_HEALTH_PERIOD_SECS,
            bind_grace_secs: 5,
            port_base: DEFAULT_PORT_BASE,
        }
    }
}

impl Settings {
    /// Load settings from a YAML file. A missing file yields the defaults;
    /// an unreadable or malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(Error::Configuration(format!(
                    "cannot read settings file {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let settings: Settings = serde_yaml::from_str(&raw)?;
        Ok(settings)
    }

    /// Directory owned by a service, `<base_dir>/<project_name>`.
    pub fn service_dir(&self, project_name: &str) -> PathBuf {
        self.base_dir.join(project_name)
    }

    pub fn health_check_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.health_check_period_secs)
    }
}
