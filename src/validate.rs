//! Field validation, host prerequisite checks, and port auto-assignment.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::config::Settings;
use crate::fsutil;

/// Names that may not be used as project names (they collide with common
/// subdomains or host services).
pub const RESERVED_NAMES: [&str; 9] = [
    "admin", "api", "www", "mail", "ftp", "root", "system", "caddy", "systemd",
];

/// Machine-readable validation error codes.
pub mod code {
    pub const EMPTY_NAME: &str = "EMPTY_NAME";
    pub const NAME_TOO_LONG: &str = "NAME_TOO_LONG";
    pub const INVALID_CHARACTERS: &str = "INVALID_CHARACTERS";
    pub const INVALID_START: &str = "INVALID_START";
    pub const RESERVED_NAME: &str = "RESERVED_NAME";
    pub const DUPLICATE_SERVICE: &str = "DUPLICATE_SERVICE";
    pub const NAME_CHANGE_UNSUPPORTED: &str = "NAME_CHANGE_UNSUPPORTED";
    pub const INVALID_PORT_RANGE: &str = "INVALID_PORT_RANGE";
    pub const DUPLICATE_PORT: &str = "DUPLICATE_PORT";
    pub const PORT_IN_USE: &str = "PORT_IN_USE";
    pub const EMPTY_VERSION: &str = "EMPTY_VERSION";
    pub const INVALID_VERSION_FORMAT: &str = "INVALID_VERSION_FORMAT";
    pub const EMPTY_DOMAIN: &str = "EMPTY_DOMAIN";
    pub const INVALID_DOMAIN_FORMAT: &str = "INVALID_DOMAIN_FORMAT";
    pub const MISSING_SYSTEMD: &str = "MISSING_SYSTEMD";
    pub const MISSING_CADDY: &str = "MISSING_CADDY";
    pub const SYSTEMD_DIR_NOT_WRITABLE: &str = "SYSTEMD_DIR_NOT_WRITABLE";
    pub const CADDYFILE_NOT_WRITABLE: &str = "CADDYFILE_NOT_WRITABLE";
    pub const BASE_DIR_NOT_WRITABLE: &str = "BASE_DIR_NOT_WRITABLE";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub code: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]: {}", self.field, self.code, self.message)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn push_error(&mut self, err: ValidationError) {
        self.is_valid = false;
        self.errors.push(err);
    }

    fn push_warning(&mut self, err: ValidationError) {
        self.warnings.push(err);
    }

    fn merge(&mut self, other: ValidationResult) {
        if !other.is_valid {
            self.is_valid = false;
        }
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }
}

fn name_charset_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"))
}

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(\d+)\.(\d+)\.(\d+)(?:-([0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*))?(?:\+([0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*))?$",
        )
        .expect("static regex")
    })
}

fn domain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$",
        )
        .expect("static regex")
    })
}

/// OS-level probe used before handing a port out. Injectable so tests do
/// not depend on which ports the host happens to have bound.
pub type PortProbe = Box<dyn Fn(u16) -> bool + Send + Sync>;

/// Bind-check on loopback and the wildcard address. On Linux the wildcard
/// bind may fail with EADDRINUSE purely because of the loopback listener,
/// so only the loopback result decides.
pub fn os_port_probe(port: u16) -> bool {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(l) => {
            let _any = TcpListener::bind(("0.0.0.0", port));
            drop(l);
            true
        }
        Err(_) => false,
    }
}

/// Validates service records and computes port assignments.
pub struct Validator {
    base_dir: PathBuf,
    unit_dir: PathBuf,
    gateway_config: PathBuf,
    port_base: u16,
    probe: PortProbe,
}

impl Validator {
    pub fn new(settings: &Settings) -> Self {
        Self {
            base_dir: settings.base_dir.clone(),
            unit_dir: settings.unit_dir.clone(),
            gateway_config: settings.gateway_config.clone(),
            port_base: settings.port_base,
            probe: Box::new(os_port_probe),
        }
    }

    /// Replace the OS port probe (tests).
    pub fn with_port_probe(mut self, probe: PortProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn validate_project_name(&self, name: &str) -> ValidationResult {
        let mut result = ValidationResult::valid();

        if name.trim().is_empty() {
            result.push_error(ValidationError::new(
                "project_name",
                code::EMPTY_NAME,
                "Project name cannot be empty",
            ));
            return result;
        }

        if name.len() > 50 {
            result.push_error(ValidationError::new(
                "project_name",
                code::NAME_TOO_LONG,
                "Project name cannot exceed 50 characters",
            ));
        }

        if !name_charset_re().is_match(name) {
            result.push_error(ValidationError::new(
                "project_name",
                code::INVALID_CHARACTERS,
                "Project name can only contain letters, numbers, hyphens, and underscores",
            ));
        }

        if !name.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
            result.push_error(ValidationError::new(
                "project_name",
                code::INVALID_START,
                "Project name must start with a letter",
            ));
        }

        if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(name)) {
            result.push_error(ValidationError::new(
                "project_name",
                code::RESERVED_NAME,
                format!("'{}' is a reserved name", name),
            ));
        }

        result
    }

    pub fn validate_port(&self, port: u16) -> ValidationResult {
        let mut result = ValidationResult::valid();

        if port < 1024 {
            result.push_error(ValidationError::new(
                "port",
                code::INVALID_PORT_RANGE,
                "Port must be between 1024 and 65535",
            ));
            return result;
        }

        if !(self.probe)(port) {
            result.push_error(ValidationError::new(
                "port",
                code::PORT_IN_USE,
                format!("Port {} is already in use on this host", port),
            ));
        }

        result
    }

    pub fn validate_version(&self, version: &str) -> ValidationResult {
        let mut result = ValidationResult::valid();

        if version.trim().is_empty() {
            result.push_error(ValidationError::new(
                "pocketbase_version",
                code::EMPTY_VERSION,
                "Version cannot be empty",
            ));
            return result;
        }

        if !version_re().is_match(version) {
            result.push_error(ValidationError::new(
                "pocketbase_version",
                code::INVALID_VERSION_FORMAT,
                "Invalid version format (expected semantic versioning like 0.28.4)",
            ));
        }

        result
    }

    pub fn validate_domain(&self, domain: &str) -> ValidationResult {
        let mut result = ValidationResult::valid();

        if domain.trim().is_empty() {
            result.push_error(ValidationError::new(
                "domain",
                code::EMPTY_DOMAIN,
                "Domain cannot be empty",
            ));
            return result;
        }

        if !domain_re().is_match(domain) {
            result.push_error(ValidationError::new(
                "domain",
                code::INVALID_DOMAIN_FORMAT,
                "Invalid domain format",
            ));
        }

        result
    }

    pub fn validate_name_unique(&self, name: &str, existing_names: &[String]) -> ValidationResult {
        let mut result = ValidationResult::valid();
        if existing_names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            result.push_error(ValidationError::new(
                "project_name",
                code::DUPLICATE_SERVICE,
                format!("Service '{}' already exists", name),
            ));
        }
        result
    }

    pub fn validate_port_unique(&self, port: u16, used_ports: &[u16]) -> ValidationResult {
        let mut result = ValidationResult::valid();
        if used_ports.contains(&port) {
            result.push_error(ValidationError::new(
                "port",
                code::DUPLICATE_PORT,
                format!("Port {} is already used by another service", port),
            ));
        }
        result
    }

    /// Aggregate validation for a complete service configuration. Field
    /// checks run first, then uniqueness against the repository snapshot.
    pub fn validate_service_config(
        &self,
        name: &str,
        port: u16,
        version: &str,
        domain: &str,
        existing_names: &[String],
        used_ports: &[u16],
    ) -> ValidationResult {
        let mut result = ValidationResult::valid();

        result.merge(self.validate_project_name(name));
        result.merge(self.validate_name_unique(name, existing_names));
        // Repository uniqueness first: a port another service owns reports
        // DUPLICATE_PORT, not PORT_IN_USE, even though its process has it
        // bound right now.
        let unique = self.validate_port_unique(port, used_ports);
        if unique.is_valid {
            result.merge(self.validate_port(port));
        } else {
            result.merge(unique);
        }
        result.merge(self.validate_version(version));
        result.merge(self.validate_domain(domain));

        result
    }

    /// Next port to auto-assign: strictly `max(used) + 1` with the
    /// configured floor (8091), skipping forward over ports the OS probe
    /// reports busy. Gaps in `used` are never refilled.
    pub fn next_port(&self, used_ports: &[u16]) -> u16 {
        let used: HashSet<u16> = used_ports.iter().copied().collect();
        let start = used_ports
            .iter()
            .copied()
            .max()
            .map(|m| m.saturating_add(1))
            .unwrap_or(self.port_base)
            .max(self.port_base);

        let mut port = start;
        loop {
            if !used.contains(&port) && (self.probe)(port) {
                return port;
            }
            if port == u16::MAX {
                return start;
            }
            port += 1;
        }
    }

    /// Host prerequisite sweep: supervisor present and unit dir writable
    /// (errors), gateway binary and config writable (warnings only), base
    /// dir writable (error).
    pub fn check_prerequisites(&self) -> ValidationResult {
        let mut result = ValidationResult::valid();

        if !command_on_path("systemctl") {
            result.push_error(ValidationError::new(
                "system",
                code::MISSING_SYSTEMD,
                "systemd is not available on this host",
            ));
        }

        if let Err(e) = fsutil::check_dir_writable(&self.unit_dir) {
            result.push_error(ValidationError::new(
                "system",
                code::SYSTEMD_DIR_NOT_WRITABLE,
                format!("Cannot write to unit directory {}: {}", self.unit_dir.display(), e),
            ));
        }

        if !command_on_path("caddy") {
            result.push_warning(ValidationError::new(
                "system",
                code::MISSING_CADDY,
                "Caddy is not installed or not on PATH",
            ));
        }

        if let Err(e) = fsutil::check_file_writable(&self.gateway_config) {
            result.push_warning(ValidationError::new(
                "system",
                code::CADDYFILE_NOT_WRITABLE,
                format!(
                    "Cannot write to gateway config {}: {}",
                    self.gateway_config.display(),
                    e
                ),
            ));
        }

        if let Err(e) = fsutil::check_dir_writable(&self.base_dir) {
            result.push_error(ValidationError::new(
                "system",
                code::BASE_DIR_NOT_WRITABLE,
                format!("Cannot write to base directory {}: {}", self.base_dir.display(), e),
            ));
        }

        result
    }
}

fn command_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(name).is_file())
}
