//! Record repository capability and the shipped JSON-file implementation.
//!
//! The authoritative collection lives in an external record store; the core
//! only depends on the [`ServiceRepository`] capability below. The JSON
//! implementation persists a small state file with atomic replacement and
//! enforces the two storage-level constraints (unique name, unique port) so
//! callers exercise the late-violation path the same way they would against
//! the real store.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::fsutil;
use crate::model::{Service, ServiceStatus};

#[async_trait]
pub trait ServiceRepository: Send + Sync {
    /// Insert a row; assigns id and timestamps. Fails on duplicate name or
    /// port.
    async fn create(&self, service: Service) -> Result<Service>;

    async fn get(&self, id: &str) -> Result<Service>;

    async fn get_by_name(&self, name: &str) -> Result<Service>;

    async fn list(&self) -> Result<Vec<Service>>;

    /// Replace a row wholesale; refreshes `updated_at`.
    async fn update(&self, service: &Service) -> Result<()>;

    async fn update_status(&self, id: &str, status: ServiceStatus) -> Result<()>;

    async fn update_config_hashes(
        &self,
        id: &str,
        systemd_hash: &str,
        caddy_hash: &str,
    ) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn used_ports(&self) -> Result<Vec<u16>>;

    async fn used_names(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RepositoryState {
    services: HashMap<String, Service>,
}

/// File-backed repository. All rows are held in memory behind one async
/// lock and flushed atomically after every mutation.
pub struct JsonFileRepository {
    path: PathBuf,
    state: Mutex<RepositoryState>,
}

impl JsonFileRepository {
    /// Open (or initialize) the state file at `path`.
    pub fn open(path: PathBuf) -> Result<Self> {
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Repository(format!("corrupt state file {}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RepositoryState::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &RepositoryState) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let raw = serde_json::to_string_pretty(state)?;
        fsutil::write_atomic(&self.path, &raw, 0o644)
    }

    fn new_id() -> String {
        // PocketBase-shaped: 15 lowercase alphanumerics.
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::thread_rng();
        (0..15)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect()
    }
}

#[async_trait]
impl ServiceRepository for JsonFileRepository {
    async fn create(&self, mut service: Service) -> Result<Service> {
        let mut state = self.state.lock().await;

        for existing in state.services.values() {
            if existing
                .project_name
                .eq_ignore_ascii_case(&service.project_name)
            {
                return Err(Error::DuplicateName(service.project_name));
            }
            if existing.port == service.port {
                return Err(Error::DuplicatePort(service.port));
            }
        }

        let now = Utc::now();
        service.id = Self::new_id();
        service.created_at = now;
        service.updated_at = now;

        state.services.insert(service.id.clone(), service.clone());
        self.persist(&state)?;
        Ok(service)
    }

    async fn get(&self, id: &str) -> Result<Service> {
        let state = self.state.lock().await;
        state
            .services
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn get_by_name(&self, name: &str) -> Result<Service> {
        let state = self.state.lock().await;
        state
            .services
            .values()
            .find(|s| s.project_name.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<Service>> {
        let state = self.state.lock().await;
        let mut services: Vec<Service> = state.services.values().cloned().collect();
        services.sort_by(|a, b| a.project_name.cmp(&b.project_name));
        Ok(services)
    }

    async fn update(&self, service: &Service) -> Result<()> {
        let mut state = self.state.lock().await;

        if !state.services.contains_key(&service.id) {
            return Err(Error::NotFound(service.id.clone()));
        }
        for existing in state.services.values() {
            if existing.id == service.id {
                continue;
            }
            if existing
                .project_name
                .eq_ignore_ascii_case(&service.project_name)
            {
                return Err(Error::DuplicateName(service.project_name.clone()));
            }
            if existing.port == service.port {
                return Err(Error::DuplicatePort(service.port));
            }
        }

        let mut updated = service.clone();
        updated.updated_at = Utc::now();
        state.services.insert(updated.id.clone(), updated);
        self.persist(&state)?;
        Ok(())
    }

    async fn update_status(&self, id: &str, status: ServiceStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        let service = state
            .services
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        service.status = status;
        service.updated_at = Utc::now();
        self.persist(&state)?;
        Ok(())
    }

    async fn update_config_hashes(
        &self,
        id: &str,
        systemd_hash: &str,
        caddy_hash: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let service = state
            .services
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        service.systemd_config_hash = systemd_hash.to_string();
        service.caddy_config_hash = caddy_hash.to_string();
        service.updated_at = Utc::now();
        self.persist(&state)?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.services.remove(id).is_none() {
            return Err(Error::NotFound(id.to_string()));
        }
        self.persist(&state)?;
        Ok(())
    }

    async fn used_ports(&self) -> Result<Vec<u16>> {
        let state = self.state.lock().await;
        let mut ports: Vec<u16> = state.services.values().map(|s| s.port).collect();
        ports.sort_unstable();
        Ok(ports)
    }

    async fn used_names(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .services
            .values()
            .map(|s| s.project_name.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, port: u16) -> Service {
        Service {
            id: String::new(),
            project_name: name.into(),
            port,
            pocketbase_version: "0.28.4".into(),
            domain: "example.com".into(),
            subdomain: None,
            status: ServiceStatus::Deploying,
            systemd_config_hash: String::new(),
            caddy_config_hash: String::new(),
            last_health_check: None,
            created_by: "ops@example.com".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn repo(dir: &tempfile::TempDir) -> JsonFileRepository {
        JsonFileRepository::open(dir.path().join("services.json")).unwrap()
    }

    #[tokio::test]
    async fn create_assigns_id_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let repository = repo(&dir);

        let created = repository.create(sample("moots", 8094)).await.unwrap();
        assert_eq!(created.id.len(), 15);

        // A fresh handle over the same file sees the row.
        let reopened = repo(&dir);
        let loaded = reopened.get(&created.id).await.unwrap();
        assert_eq!(loaded.project_name, "moots");
        assert_eq!(loaded.port, 8094);
    }

    #[tokio::test]
    async fn storage_layer_enforces_uniqueness() {
        let dir = tempfile::tempdir().unwrap();
        let repository = repo(&dir);
        repository.create(sample("moots", 8094)).await.unwrap();

        assert!(matches!(
            repository.create(sample("MOOTS", 8095)).await,
            Err(Error::DuplicateName(_))
        ));
        assert!(matches!(
            repository.create(sample("other", 8094)).await,
            Err(Error::DuplicatePort(8094))
        ));

        // Update runs into the same constraints.
        let other = repository.create(sample("other", 8095)).await.unwrap();
        let mut clashing = other.clone();
        clashing.port = 8094;
        assert!(matches!(
            repository.update(&clashing).await,
            Err(Error::DuplicatePort(8094))
        ));
    }

    #[tokio::test]
    async fn lookups_and_index_queries() {
        let dir = tempfile::tempdir().unwrap();
        let repository = repo(&dir);
        repository.create(sample("beta", 8092)).await.unwrap();
        repository.create(sample("alpha", 8091)).await.unwrap();

        let by_name = repository.get_by_name("Alpha").await.unwrap();
        assert_eq!(by_name.port, 8091);
        assert!(matches!(
            repository.get_by_name("ghost").await,
            Err(Error::NotFound(_))
        ));

        let listed = repository.list().await.unwrap();
        assert_eq!(
            listed.iter().map(|s| s.project_name.as_str()).collect::<Vec<_>>(),
            vec!["alpha", "beta"]
        );
        assert_eq!(repository.used_ports().await.unwrap(), vec![8091, 8092]);

        let mut names = repository.used_names().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn status_and_hash_updates_touch_updated_at() {
        let dir = tempfile::tempdir().unwrap();
        let repository = repo(&dir);
        let created = repository.create(sample("moots", 8094)).await.unwrap();

        repository
            .update_status(&created.id, ServiceStatus::Active)
            .await
            .unwrap();
        repository
            .update_config_hashes(&created.id, "aaa", "bbb")
            .await
            .unwrap();

        let loaded = repository.get(&created.id).await.unwrap();
        assert_eq!(loaded.status, ServiceStatus::Active);
        assert_eq!(loaded.systemd_config_hash, "aaa");
        assert_eq!(loaded.caddy_config_hash, "bbb");
        assert!(loaded.updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let dir = tempfile::tempdir().unwrap();
        let repository = repo(&dir);
        let created = repository.create(sample("moots", 8094)).await.unwrap();

        repository.delete(&created.id).await.unwrap();
        assert!(matches!(
            repository.get(&created.id).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            repository.delete(&created.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_state_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(JsonFileRepository::open(path).is_err());
    }
}
