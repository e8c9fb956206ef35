//! Unit manager: renders and writes systemd unit files and drives
//! `systemctl` for the managed instances.
//!
//! Unit files are per-service and written atomically; `daemon-reload` is
//! serialized process-wide because it acts on shared supervisor state.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::exec::{supervisor_error, CommandRunner};
use crate::fsutil;
use crate::model::ERROR_LOG_NAME;

/// Result of a unit-file parse check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitVerify {
    Valid,
    Invalid { reason: String },
}

fn exec_port_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"--http="?127\.0\.0\.1:(\d+)"?"#).expect("static regex"))
}

/// Unit file name for a project.
pub fn unit_name(project_name: &str) -> String {
    format!("{}-pocketbase.service", project_name)
}

pub struct SystemdManager {
    unit_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    // daemon-reload acts on the whole supervisor; one at a time.
    reload_lock: Mutex<()>,
}

impl SystemdManager {
    pub fn new(unit_dir: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            unit_dir,
            runner,
            reload_lock: Mutex::new(()),
        }
    }

    pub fn unit_path(&self, project_name: &str) -> PathBuf {
        self.unit_dir.join(unit_name(project_name))
    }

    /// Render the unit content for a service. Deterministic over
    /// `{project_name, service_dir, port}`.
    pub fn render_unit(&self, project_name: &str, service_dir: &Path, port: u16) -> String {
        let dir = service_dir.display();
        format!(
            r#"[Unit]
Description = {project_name} pocketbase

[Service]
Type             = simple
User             = root
Group            = root
LimitNOFILE      = 4096
Restart          = always
RestartSec       = 5s
StandardOutput   = append:{dir}/{log}
StandardError    = append:{dir}/{log}
WorkingDirectory = {dir}/
ExecStart        = {dir}/pocketbase serve --http="127.0.0.1:{port}"

[Install]
WantedBy = multi-user.target
"#,
            log = ERROR_LOG_NAME,
        )
    }

    /// Write (or overwrite) the unit file, mode 0644. Returns the content
    /// written so callers can digest it.
    pub fn write_unit(&self, project_name: &str, service_dir: &Path, port: u16) -> Result<String> {
        let content = self.render_unit(project_name, service_dir, port);
        fsutil::write_atomic(&self.unit_path(project_name), &content, 0o644)?;
        Ok(content)
    }

    /// Re-emit previously captured unit content (rollback path).
    pub fn write_unit_raw(&self, project_name: &str, content: &str) -> Result<()> {
        fsutil::write_atomic(&self.unit_path(project_name), content, 0o644)
    }

    /// Current unit-file content, for restore journaling before an edit.
    pub fn read_unit(&self, project_name: &str) -> Result<String> {
        match std::fs::read_to_string(self.unit_path(project_name)) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::UnitNotFound(project_name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// daemon-reload, then enable, then start. Safe on an already-enabled
    /// unit.
    pub async fn enable(&self, project_name: &str) -> Result<()> {
        self.daemon_reload().await?;
        self.systemctl("enable", project_name).await?;
        self.systemctl("start", project_name).await
    }

    pub async fn start(&self, project_name: &str) -> Result<()> {
        self.systemctl("start", project_name).await
    }

    pub async fn stop(&self, project_name: &str) -> Result<()> {
        self.systemctl("stop", project_name).await
    }

    pub async fn restart(&self, project_name: &str) -> Result<()> {
        self.systemctl("restart", project_name).await
    }

    pub async fn disable(&self, project_name: &str) -> Result<()> {
        self.systemctl("disable", project_name).await
    }

    /// Tear the unit down: stop and disable (both tolerated when the unit
    /// is already gone or stopped), delete the file (tolerated when
    /// missing), then daemon-reload. Safe to call repeatedly.
    pub async fn remove(&self, project_name: &str) -> Result<()> {
        if let Err(e) = self.stop(project_name).await {
            tracing::debug!("stop during remove ignored for '{}': {}", project_name, e);
        }
        if let Err(e) = self.disable(project_name).await {
            tracing::debug!("disable during remove ignored for '{}': {}", project_name, e);
        }

        match std::fs::remove_file(self.unit_path(project_name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.daemon_reload().await
    }

    /// `is-active` check. Anything but exit 0 + "active" is false; never
    /// raises.
    pub async fn is_active(&self, project_name: &str) -> bool {
        let unit = unit_name(project_name);
        match self.runner.run("systemctl", &["is-active", &unit]).await {
            Ok(out) => out.success() && out.stdout.trim() == "active",
            Err(_) => false,
        }
    }

    pub async fn is_enabled(&self, project_name: &str) -> bool {
        let unit = unit_name(project_name);
        match self.runner.run("systemctl", &["is-enabled", &unit]).await {
            Ok(out) => out.success() && out.stdout.trim() == "enabled",
            Err(_) => false,
        }
    }

    /// Extract the effective port from the unit file's ExecStart line.
    pub fn read_port(&self, project_name: &str) -> Result<u16> {
        let content = self.read_unit(project_name)?;
        let captures = exec_port_re().captures(&content).ok_or_else(|| {
            Error::MalformedUnit(format!(
                "no --http=127.0.0.1:<port> in ExecStart of {}",
                unit_name(project_name)
            ))
        })?;

        captures[1].parse::<u16>().map_err(|_| {
            Error::MalformedUnit(format!(
                "port out of range in ExecStart of {}",
                unit_name(project_name)
            ))
        })
    }

    /// Last `n` journal lines for the unit.
    pub async fn logs(&self, project_name: &str, n: usize) -> Result<String> {
        let unit = unit_name(project_name);
        let count = n.to_string();
        let args = ["-u", unit.as_str(), "-n", count.as_str(), "--no-pager"];
        let out = self.runner.run("journalctl", &args).await?;
        if !out.success() {
            return Err(supervisor_error("journalctl", &args, &out));
        }
        Ok(out.stdout)
    }

    /// Parse-check the unit file with systemd-analyze.
    pub async fn verify(&self, project_name: &str) -> Result<UnitVerify> {
        let path = self.unit_path(project_name);
        if !path.exists() {
            return Err(Error::UnitNotFound(project_name.to_string()));
        }

        let path_str = path.to_string_lossy().into_owned();
        let args = ["verify", path_str.as_str()];
        let out = self.runner.run("systemd-analyze", &args).await?;
        if out.success() {
            Ok(UnitVerify::Valid)
        } else {
            Ok(UnitVerify::Invalid {
                reason: if out.stderr.trim().is_empty() {
                    out.stdout.trim().to_string()
                } else {
                    out.stderr.trim().to_string()
                },
            })
        }
    }

    pub async fn daemon_reload(&self) -> Result<()> {
        let _guard = self.reload_lock.lock().await;
        let args = ["daemon-reload"];
        let out = self.runner.run("systemctl", &args).await?;
        if !out.success() {
            return Err(supervisor_error("systemctl", &args, &out));
        }
        Ok(())
    }

    /// Reload the gateway's own unit (`systemctl reload caddy`).
    pub async fn reload_unit(&self, unit: &str) -> Result<()> {
        let args = ["reload", unit];
        let out = self.runner.run("systemctl", &args).await?;
        if !out.success() {
            return Err(supervisor_error("systemctl", &args, &out));
        }
        Ok(())
    }

    async fn systemctl(&self, verb: &str, project_name: &str) -> Result<()> {
        let unit = unit_name(project_name);
        let args = [verb, unit.as_str()];
        let out = self.runner.run("systemctl", &args).await?;
        if !out.success() {
            return Err(supervisor_error("systemctl", &args, &out));
        }
        Ok(())
    }
}
