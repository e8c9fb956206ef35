//! Shared harness for the integration suite: a temp-dir file tree, a
//! scripted supervisor, and a provisioner that fabricates binaries locally.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pockestrator::exec::{CommandOutput, CommandRunner};
use pockestrator::provision::archive_name;
use pockestrator::{
    CaddyManager, Error, JsonFileRepository, Orchestrator, Provisioner, Result, ServiceRequest,
    Settings, SystemdManager, Validator,
};
use tempfile::TempDir;

fn ok() -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout: String::new(),
        stderr: String::new(),
    }
}

/// Stand-in for systemctl/caddy/journalctl. Tracks which units are
/// "running" so start/stop/is-active behave like a real supervisor, records
/// every invocation, and lets tests force specific commands to fail.
#[derive(Default)]
pub struct ScriptedRunner {
    pub calls: Mutex<Vec<String>>,
    pub active: Mutex<HashSet<String>>,
    pub enabled: Mutex<HashSet<String>>,
    responses: Mutex<HashMap<String, CommandOutput>>,
}

impl ScriptedRunner {
    pub fn force_response(&self, command: &str, output: CommandOutput) {
        self.responses.lock().insert(command.to_string(), output);
    }

    pub fn force_failure(&self, command: &str, stderr: &str) {
        self.force_response(
            command,
            CommandOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn is_unit_active(&self, unit: &str) -> bool {
        self.active.lock().contains(unit)
    }

    /// Simulate the unit dying (or being stopped) outside our control.
    pub fn kill_unit(&self, unit: &str) {
        self.active.lock().remove(unit);
    }

    /// Simulate an operator starting the unit by hand.
    pub fn raise_unit(&self, unit: &str) {
        self.active.lock().insert(unit.to_string());
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let line = format!("{} {}", program, args.join(" "));
        self.calls.lock().push(line.clone());

        if let Some(out) = self.responses.lock().get(&line) {
            return Ok(out.clone());
        }

        let out = match (program, args.first().copied()) {
            ("systemctl", Some("start")) | ("systemctl", Some("restart")) => {
                if let Some(unit) = args.get(1) {
                    self.active.lock().insert(unit.to_string());
                }
                ok()
            }
            ("systemctl", Some("stop")) => {
                if let Some(unit) = args.get(1) {
                    self.active.lock().remove(*unit);
                }
                ok()
            }
            ("systemctl", Some("enable")) => {
                if let Some(unit) = args.get(1) {
                    self.enabled.lock().insert(unit.to_string());
                }
                ok()
            }
            ("systemctl", Some("disable")) => {
                if let Some(unit) = args.get(1) {
                    self.enabled.lock().remove(*unit);
                }
                ok()
            }
            ("systemctl", Some("is-active")) => {
                let unit = args.get(1).copied().unwrap_or_default();
                if self.active.lock().contains(unit) {
                    CommandOutput {
                        exit_code: Some(0),
                        stdout: "active\n".into(),
                        stderr: String::new(),
                    }
                } else {
                    CommandOutput {
                        exit_code: Some(3),
                        stdout: "inactive\n".into(),
                        stderr: String::new(),
                    }
                }
            }
            ("systemctl", Some("is-enabled")) => {
                let unit = args.get(1).copied().unwrap_or_default();
                if self.enabled.lock().contains(unit) {
                    CommandOutput {
                        exit_code: Some(0),
                        stdout: "enabled\n".into(),
                        stderr: String::new(),
                    }
                } else {
                    CommandOutput {
                        exit_code: Some(1),
                        stdout: "disabled\n".into(),
                        stderr: String::new(),
                    }
                }
            }
            ("journalctl", _) => CommandOutput {
                exit_code: Some(0),
                stdout: "log line one\nlog line two\n".into(),
                stderr: String::new(),
            },
            _ => ok(),
        };
        Ok(out)
    }
}

/// Provisioner that fabricates a tiny executable instead of downloading.
pub struct MockProvisioner {
    pub fail_download: AtomicBool,
    pub fail_extract: AtomicBool,
    pub latest: String,
}

impl Default for MockProvisioner {
    fn default() -> Self {
        Self {
            fail_download: AtomicBool::new(false),
            fail_extract: AtomicBool::new(false),
            latest: "0.28.4".into(),
        }
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn latest_version(&self) -> Result<String> {
        Ok(self.latest.clone())
    }

    async fn download(&self, version: &str, service_dir: &Path) -> Result<PathBuf> {
        if self.fail_download.load(Ordering::SeqCst) {
            return Err(Error::DownloadStatus { code: 404 });
        }
        let archive = service_dir.join(archive_name(version));
        std::fs::write(&archive, b"stub archive")?;
        Ok(archive)
    }

    async fn extract(&self, service_dir: &Path, version: &str) -> Result<PathBuf> {
        if self.fail_extract.load(Ordering::SeqCst) {
            return Err(Error::System("corrupt archive".into()));
        }
        let archive = service_dir.join(archive_name(version));
        std::fs::remove_file(&archive)?;

        let binary = service_dir.join("pocketbase");
        std::fs::write(&binary, "#!/bin/sh\nexit 0\n")?;
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755))?;
        Ok(binary)
    }

    async fn init_admin(&self, _service_dir: &Path, _email: &str, _password: &str) -> Result<()> {
        Ok(())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub settings: Settings,
    pub runner: Arc<ScriptedRunner>,
    pub provisioner: Arc<MockProvisioner>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn unit_path(&self, project_name: &str) -> PathBuf {
        self.settings
            .unit_dir
            .join(format!("{}-pocketbase.service", project_name))
    }

    pub fn caddyfile(&self) -> String {
        std::fs::read_to_string(&self.settings.gateway_config).unwrap_or_default()
    }

    pub fn service_dir(&self, project_name: &str) -> PathBuf {
        self.settings.base_dir.join(project_name)
    }

    pub fn request(&self, name: &str, port: Option<u16>) -> ServiceRequest {
        ServiceRequest {
            project_name: name.into(),
            port,
            pocketbase_version: Some("0.28.4".into()),
            domain: Some("example.com".into()),
            ..Default::default()
        }
    }
}

/// Build a fully wired orchestrator over a temp-dir file tree. The port
/// probe always passes so assigned ports are deterministic regardless of
/// what the host has bound.
pub fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");

    let settings = Settings {
        base_dir: dir.path().join("services"),
        unit_dir: dir.path().join("systemd"),
        gateway_config: dir.path().join("caddy").join("Caddyfile"),
        default_domain: "example.com".into(),
        state_file: dir.path().join("state").join("services.json"),
        superuser_password: None,
        health_check_period_secs: 1,
        bind_grace_secs: 0,
        port_base: 8091,
    };

    std::fs::create_dir_all(&settings.base_dir).unwrap();
    std::fs::create_dir_all(&settings.unit_dir).unwrap();
    std::fs::create_dir_all(settings.gateway_config.parent().unwrap()).unwrap();
    std::fs::write(&settings.gateway_config, "").unwrap();

    let runner = Arc::new(ScriptedRunner::default());
    let systemd = Arc::new(SystemdManager::new(
        settings.unit_dir.clone(),
        runner.clone() as Arc<dyn CommandRunner>,
    ));
    let caddy = Arc::new(CaddyManager::new(
        settings.gateway_config.clone(),
        runner.clone() as Arc<dyn CommandRunner>,
    ));
    let repo = Arc::new(JsonFileRepository::open(settings.state_file.clone()).unwrap());
    let validator = Validator::new(&settings).with_port_probe(Box::new(|_| true));
    let provisioner = Arc::new(MockProvisioner::default());

    let orchestrator = Arc::new(Orchestrator::new(
        settings.clone(),
        repo,
        systemd,
        caddy,
        provisioner.clone(),
        validator,
    ));

    Harness {
        dir,
        settings,
        runner,
        provisioner,
        orchestrator,
    }
}
