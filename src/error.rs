use miette::Diagnostic;
use std::io;
use thiserror::Error;

use crate::validate::ValidationError;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Validation failed: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    #[diagnostic(
        code(pockestrator::validation),
        help("Fix the reported fields and retry; nothing was changed on disk")
    )]
    Validation(Vec<ValidationError>),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("System error: {0}")]
    #[diagnostic(
        code(pockestrator::system),
        help("Check directory permissions and that the process runs with enough privileges")
    )]
    System(String),

    #[error("HTTP error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Download failed with status {code}")]
    #[diagnostic(
        code(pockestrator::download::status),
        help("Verify the requested PocketBase version exists upstream")
    )]
    DownloadStatus { code: u16 },

    #[error("`{command}` exited with {}: {stderr}", .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    #[diagnostic(
        code(pockestrator::supervisor),
        help("Inspect the unit with `systemctl status` and the journal for details")
    )]
    Supervisor {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    #[error("Gateway config validation failed: {output}")]
    #[diagnostic(
        code(pockestrator::gateway::validate),
        help("Run `caddy validate --config <path>` to see the offending directive")
    )]
    GatewayValidation { output: String },

    #[error("Unit file not found for '{0}'")]
    UnitNotFound(String),

    #[error("Malformed unit file: {0}")]
    #[diagnostic(code(pockestrator::unit::malformed))]
    MalformedUnit(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Service not found: {0}")]
    #[diagnostic(
        code(pockestrator::service::not_found),
        help("List known services with `pockestrator list`")
    )]
    NotFound(String),

    #[error("Service '{0}' already exists")]
    #[diagnostic(code(pockestrator::service::duplicate_name))]
    DuplicateName(String),

    #[error("Port {0} is already used by another service")]
    #[diagnostic(code(pockestrator::service::duplicate_port))]
    DuplicatePort(u16),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{step}: {source}")]
    Deploy {
        step: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{operation}; rollback reported {} error(s)", .compensation_errors.len())]
    #[diagnostic(
        code(pockestrator::rollback),
        help("Some compensations failed; the host may hold leftover artifacts that need manual cleanup")
    )]
    RollbackFailed {
        operation: Box<Error>,
        compensation_errors: Vec<Error>,
    },

    #[error("Multiple errors occurred:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an error with the deployment step it occurred in, e.g.
    /// "failed to download PocketBase".
    pub fn at_step(self, step: impl Into<String>) -> Self {
        Error::Deploy {
            step: step.into(),
            source: Box::new(self),
        }
    }

    /// The step label of a `Deploy` error, if this is one.
    pub fn step(&self) -> Option<&str> {
        match self {
            Error::Deploy { step, .. } => Some(step),
            Error::RollbackFailed { operation, .. } => operation.step(),
            _ => None,
        }
    }

    /// True when the underlying cause is a missing file or unit; delete
    /// paths use this to keep going past artifacts that are already gone.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == io::ErrorKind::NotFound,
            Error::UnitNotFound(_) | Error::NotFound(_) => true,
            Error::Deploy { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_label_is_preserved_through_wrapping() {
        let err = Error::System("disk full".into()).at_step("failed to download PocketBase");
        assert_eq!(err.step(), Some("failed to download PocketBase"));
        assert!(err.to_string().contains("failed to download PocketBase"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn rollback_failure_reports_compensation_count() {
        let err = Error::RollbackFailed {
            operation: Box::new(
                Error::System("boom".into()).at_step("failed to extract PocketBase"),
            ),
            compensation_errors: vec![Error::System("rm failed".into())],
        };
        assert_eq!(err.step(), Some("failed to extract PocketBase"));
        assert!(err.to_string().contains("1 error(s)"));
    }

    #[test]
    fn not_found_detection_sees_through_deploy_wrapper() {
        let io = Error::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(io.is_not_found());
        assert!(io.at_step("failed to remove unit").is_not_found());
        assert!(!Error::System("nope".into()).is_not_found());
    }
}
