//! Binary provisioner: resolves PocketBase releases upstream, downloads and
//! extracts them into service directories, and runs the one-shot superuser
//! bootstrap.

use async_trait::async_trait;
use futures::StreamExt;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::BINARY_NAME;

const RELEASE_API: &str = "https://api.github.com/repos/pocketbase/pocketbase/releases/latest";
const DOWNLOAD_BASE: &str = "https://github.com/pocketbase/pocketbase/releases/download";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared HTTP client: one connection pool for every download and release
/// check, with the 30-second per-request ceiling baked in.
fn shared_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent("pockestrator")
            .build()
            .expect("failed to build HTTP client")
    })
}

/// Upstream release asset suffix for the current machine.
fn release_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "arm" => "armv7",
        _ => "amd64",
    }
}

/// `pocketbase_<version>_linux_<arch>.zip`
pub fn archive_name(version: &str) -> String {
    format!("pocketbase_{}_linux_{}.zip", version, release_arch())
}

/// Pull `tag_name` out of a release-feed payload, stripping the leading `v`.
fn parse_latest_version(body: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| Error::Configuration(format!("unparseable release feed: {}", e)))?;
    let tag = value
        .get("tag_name")
        .and_then(|t| t.as_str())
        .ok_or_else(|| Error::Configuration("release feed has no tag_name".into()))?;
    Ok(tag.strip_prefix('v').unwrap_or(tag).to_string())
}

/// Capability for fetching and preparing instance binaries. The production
/// implementation talks to the upstream release feed; tests substitute one
/// that fabricates binaries locally.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Latest upstream release, semver without the `v` prefix.
    async fn latest_version(&self) -> Result<String>;

    /// Fetch the release archive into `service_dir`; returns the archive
    /// path.
    async fn download(&self, version: &str, service_dir: &Path) -> Result<PathBuf>;

    /// Extract the `pocketbase` entry from a downloaded archive, set the
    /// executable bit, and delete the archive. Returns the binary path.
    async fn extract(&self, service_dir: &Path, version: &str) -> Result<PathBuf>;

    /// One-shot `superuser upsert` against the instance. Callers treat
    /// failures as soft.
    async fn init_admin(&self, service_dir: &Path, email: &str, password: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct PocketBaseProvisioner;

#[async_trait]
impl Provisioner for PocketBaseProvisioner {
    async fn latest_version(&self) -> Result<String> {
        let body = shared_client()
            .get(RELEASE_API)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_latest_version(&body)
    }

    async fn download(&self, version: &str, service_dir: &Path) -> Result<PathBuf> {
        let url = format!(
            "{}/v{}/{}",
            DOWNLOAD_BASE,
            version,
            archive_name(version)
        );
        let archive_path = service_dir.join(archive_name(version));

        let response = shared_client().get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::DownloadStatus {
                code: response.status().as_u16(),
            });
        }

        let mut file = std::fs::File::create(&archive_path)?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?)?;
        }
        file.sync_all()?;

        Ok(archive_path)
    }

    async fn extract(&self, service_dir: &Path, version: &str) -> Result<PathBuf> {
        let archive_path = service_dir.join(archive_name(version));
        let service_dir = service_dir.to_path_buf();

        tokio::task::spawn_blocking(move || extract_binary(&archive_path, &service_dir))
            .await
            .map_err(|e| Error::System(format!("extract task failed: {}", e)))?
    }

    async fn init_admin(&self, service_dir: &Path, email: &str, password: &str) -> Result<()> {
        let binary = service_dir.join(BINARY_NAME);
        let output = tokio::process::Command::new(&binary)
            .args(["superuser", "upsert", email, password])
            .current_dir(service_dir)
            .output()
            .await
            .map_err(|e| Error::System(format!("failed to run {}: {}", binary.display(), e)))?;

        if !output.status.success() {
            return Err(Error::Supervisor {
                command: format!("{} superuser upsert", binary.display()),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                exit_code: output.status.code(),
            });
        }
        Ok(())
    }
}

/// Pull only the `pocketbase` entry out of the archive. Every entry name is
/// checked against the destination first; an entry that would land outside
/// `service_dir` fails the whole extraction.
fn extract_binary(archive_path: &Path, service_dir: &Path) -> Result<PathBuf> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut binary_path = None;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;

        let target = entry
            .enclosed_name()
            .map(|name| service_dir.join(name))
            .ok_or_else(|| {
                Error::System(format!(
                    "archive entry '{}' escapes the service directory",
                    entry.name()
                ))
            })?;

        if entry.name() != BINARY_NAME {
            continue;
        }

        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
        out.sync_all()?;
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))?;
        binary_path = Some(target);
    }

    let binary_path = binary_path.ok_or_else(|| {
        Error::System(format!(
            "no '{}' entry in {}",
            BINARY_NAME,
            archive_path.display()
        ))
    })?;

    std::fs::remove_file(archive_path)?;
    Ok(binary_path)
}
