//! # Pockestrator
//!
//! Manages a fleet of PocketBase instances on a single Linux host. Each
//! managed service is one row in a backing collection plus three derived
//! artifacts: a working directory with the extracted binary, a systemd unit
//! supervising it, and a site block in the shared Caddyfile routing
//! `<subdomain>.<domain>` to the instance's loopback port.
//!
//! ## Features
//!
//! - **Transactional deployment**: download → extract → unit → enable →
//!   gateway → superuser, with a LIFO compensation journal that unwinds
//!   partial failures
//! - **Bidirectional reconciliation**: per-field comparison of the row
//!   against the unit file, gateway block, and supervisor state, with sync
//!   in either direction
//! - **Port auto-assignment**: strict `max + 1` allocation above 8091,
//!   funneled through a single allocation lock so concurrent creates never
//!   collide
//! - **Health monitoring**: a periodic background sweep recording status
//!   transitions on the rows
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use pockestrator::{
//!     CaddyManager, JsonFileRepository, Orchestrator, PocketBaseProvisioner,
//!     ServiceRequest, Settings, SystemRunner, SystemdManager, Validator,
//! };
//!
//! # async fn example() -> Result<(), pockestrator::Error> {
//! let settings = Settings::default();
//! let runner = Arc::new(SystemRunner);
//! let systemd = Arc::new(SystemdManager::new(settings.unit_dir.clone(), runner.clone()));
//! let caddy = Arc::new(CaddyManager::new(settings.gateway_config.clone(), runner));
//! let repo = Arc::new(JsonFileRepository::open(settings.state_file.clone())?);
//! let validator = Validator::new(&settings);
//!
//! let orchestrator = Arc::new(Orchestrator::new(
//!     settings,
//!     repo,
//!     systemd,
//!     caddy,
//!     Arc::new(PocketBaseProvisioner),
//!     validator,
//! ));
//!
//! let response = orchestrator
//!     .create(ServiceRequest {
//!         project_name: "moots".into(),
//!         ..Default::default()
//!     })
//!     .await?;
//! println!("{}: {}", response.status, response.message);
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! Mutations on one service serialize on a keyed per-service lock; the
//! shared Caddyfile and `daemon-reload` serialize process-wide; port
//! allocation and the repository insert share one mutex. `create` returns
//! while the pipeline still runs on a detached task.

pub mod caddy;
pub mod config;
pub mod error;
pub mod exec;
pub mod fsutil;
pub mod hooks;
pub mod model;
pub mod orchestrator;
pub mod provision;
pub mod repo;
pub mod rollback;
pub mod sync;
pub mod systemd;
pub mod validate;

// Re-export commonly used types
pub use caddy::CaddyManager;
pub use config::Settings;
pub use error::{Error, Result};
pub use exec::{CommandOutput, CommandRunner, SystemRunner};
pub use hooks::ServiceHooks;
pub use model::{Service, ServiceRequest, ServiceResponse, ServiceStatus};
pub use orchestrator::{ControlAction, Orchestrator};
pub use provision::{PocketBaseProvisioner, Provisioner};
pub use repo::{JsonFileRepository, ServiceRepository};
pub use sync::{BinaryState, ConfigStatus, ItemState, Reconciler};
pub use systemd::SystemdManager;
pub use validate::{ValidationError, ValidationResult, Validator};
