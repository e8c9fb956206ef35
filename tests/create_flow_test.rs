//! End-to-end create scenarios: the happy path, validation rejections,
//! port auto-assignment, and rollback on mid-pipeline failures.

mod common;

use common::harness;
use pockestrator::model::config_hash;
use pockestrator::validate::code;
use pockestrator::ServiceStatus;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn create_happy_path_produces_all_artifacts() {
    let h = harness();

    let response = h
        .orchestrator
        .create_blocking(h.request("moots", Some(8094)))
        .await
        .unwrap();
    assert_eq!(response.status, "success", "{}", response.message);

    // Row reached `active`.
    let row = h.orchestrator.find_by_name("moots").await.unwrap();
    assert_eq!(row.status, ServiceStatus::Active);
    assert_eq!(row.port, 8094);

    // Unit file with the expected ExecStart.
    let unit = std::fs::read_to_string(h.unit_path("moots")).unwrap();
    assert!(unit.contains(r#"--http="127.0.0.1:8094""#));

    // Gateway block routing the subdomain to the port.
    let caddyfile = h.caddyfile();
    assert!(caddyfile.contains("moots.example.com {"));
    assert!(caddyfile.contains("reverse_proxy 127.0.0.1:8094"));

    // Binary extracted with the executable bit set.
    let binary = h.service_dir("moots").join("pocketbase");
    let mode = std::fs::metadata(&binary).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o755);

    // The service tree has its data/public/migrations/hooks subdirs.
    for sub in ["pb_data", "pb_public", "pb_migrations", "pb_hooks"] {
        assert!(h.service_dir("moots").join(sub).is_dir(), "missing {sub}");
    }

    // Supervisor was told to enable and start, and reports it active.
    assert!(h.runner.is_unit_active("moots-pocketbase.service"));

    // Stored digests match the artifacts on disk.
    assert_eq!(row.systemd_config_hash, config_hash(&unit));
    assert!(!row.caddy_config_hash.is_empty());
}

#[tokio::test]
async fn create_returns_deploying_then_row_activates() {
    let h = harness();

    let response = h
        .orchestrator
        .create(h.request("moots", Some(8094)))
        .await
        .unwrap();
    assert_eq!(response.status, "deploying");
    assert_eq!(response.message, "Service deployment started");
    let id = response.id.clone();

    // The pipeline runs on a detached task; poll the row until it lands.
    let mut status = ServiceStatus::Deploying;
    for _ in 0..200 {
        status = h.orchestrator.repository().get(&id).await.unwrap().status;
        if status != ServiceStatus::Deploying {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, ServiceStatus::Active);
}

#[tokio::test]
async fn create_after_create_reports_all_fields_synced() {
    let h = harness();
    let response = h
        .orchestrator
        .create_blocking(h.request("moots", Some(8094)))
        .await
        .unwrap();

    let verdict = h.orchestrator.classify(&response.id).await.unwrap();
    assert!(verdict.is_synced(), "unexpected drift: {verdict:?}");
}

#[tokio::test]
async fn duplicate_port_is_rejected_without_side_effects() {
    let h = harness();
    h.orchestrator
        .create_blocking(h.request("moots", Some(8094)))
        .await
        .unwrap();

    let response = h
        .orchestrator
        .create_blocking(h.request("other", Some(8094)))
        .await
        .unwrap();

    assert_eq!(response.status, "error");
    assert!(response
        .errors
        .iter()
        .any(|e| e.field == "port" && e.code == code::DUPLICATE_PORT));

    // No second row, no artifacts for the rejected request.
    assert_eq!(h.orchestrator.repository().list().await.unwrap().len(), 1);
    assert!(!h.unit_path("other").exists());
    assert!(!h.caddyfile().contains("other.example.com"));
    assert!(!h.service_dir("other").exists());
}

#[tokio::test]
async fn duplicate_name_is_rejected_case_insensitively() {
    let h = harness();
    h.orchestrator
        .create_blocking(h.request("moots", Some(8094)))
        .await
        .unwrap();

    let response = h
        .orchestrator
        .create_blocking(h.request("MOOTS", Some(8095)))
        .await
        .unwrap();
    assert_eq!(response.status, "error");
    assert!(response.errors.iter().any(|e| e.code == code::DUPLICATE_SERVICE));
}

#[tokio::test]
async fn auto_port_is_strict_max_plus_one() {
    let h = harness();
    for (name, port) in [("a1", 8091), ("a2", 8092), ("a3", 8094)] {
        h.orchestrator
            .create_blocking(h.request(name, Some(port)))
            .await
            .unwrap();
    }

    // {8091, 8092, 8094} -> 8095: the gap at 8093 is not refilled.
    let response = h
        .orchestrator
        .create_blocking(h.request("alpha", None))
        .await
        .unwrap();
    assert_eq!(response.service.unwrap().port, 8095);
}

#[tokio::test]
async fn auto_ports_are_monotone_from_the_floor() {
    let h = harness();
    let mut ports = Vec::new();
    for name in ["one", "two", "three"] {
        let response = h
            .orchestrator
            .create_blocking(h.request(name, None))
            .await
            .unwrap();
        assert_eq!(response.status, "success", "{}", response.message);
        ports.push(response.service.unwrap().port);
    }
    assert_eq!(ports, vec![8091, 8092, 8093]);
}

#[tokio::test]
async fn download_failure_rolls_back_and_marks_row_error() {
    let h = harness();
    h.provisioner.fail_download.store(true, Ordering::SeqCst);

    let response = h
        .orchestrator
        .create_blocking(h.request("moots", Some(8094)))
        .await
        .unwrap();

    assert_eq!(response.status, "error");
    assert!(
        response.message.contains("failed to download PocketBase"),
        "message was: {}",
        response.message
    );

    // The row persists in `error` so the operator can see and delete it.
    let row = h.orchestrator.find_by_name("moots").await.unwrap();
    assert_eq!(row.status, ServiceStatus::Error);

    // Nothing survived on disk.
    assert!(!h.service_dir("moots").exists());
    assert!(!h.unit_path("moots").exists());
    assert!(!h.caddyfile().contains("moots"));
}

#[tokio::test]
async fn gateway_failure_unwinds_every_earlier_step() {
    let h = harness();
    // Force `caddy validate` to fail so the pipeline dies after the unit
    // and gateway block were already written.
    h.runner.force_failure(
        &format!("caddy validate --config {}", h.settings.gateway_config.display()),
        "syntax error",
    );

    let response = h
        .orchestrator
        .create_blocking(h.request("moots", Some(8094)))
        .await
        .unwrap();
    assert_eq!(response.status, "error");
    assert!(
        response.message.contains("failed to reload gateway"),
        "message was: {}",
        response.message
    );

    let row = h.orchestrator.find_by_name("moots").await.unwrap();
    assert_eq!(row.status, ServiceStatus::Error);

    // Every artifact from steps 1..k-1 was compensated away.
    assert!(!h.service_dir("moots").exists());
    assert!(!h.unit_path("moots").exists());
    assert!(!h.caddyfile().contains("moots.example.com"));
}

#[tokio::test]
async fn extract_failure_removes_directory_and_archive() {
    let h = harness();
    h.provisioner.fail_extract.store(true, Ordering::SeqCst);

    let response = h
        .orchestrator
        .create_blocking(h.request("moots", Some(8094)))
        .await
        .unwrap();
    assert_eq!(response.status, "error");
    assert!(response.message.contains("failed to extract PocketBase"));
    assert!(!h.service_dir("moots").exists());
}

#[tokio::test]
async fn concurrent_creates_never_share_a_port() {
    let h = harness();
    let names = ["c1", "c2", "c3", "c4", "c5", "c6", "c7", "c8"];

    let tasks: Vec<_> = names
        .iter()
        .map(|name| {
            let orchestrator = h.orchestrator.clone();
            let request = h.request(name, None);
            tokio::spawn(async move { orchestrator.create_blocking(request).await })
        })
        .collect();

    let mut ports = Vec::new();
    for task in tasks {
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status, "success", "{}", response.message);
        ports.push(response.service.unwrap().port);
    }

    let mut deduped = ports.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(deduped.len(), names.len(), "ports collided: {ports:?}");

    // All committed rows hold pairwise-distinct names and in-range ports.
    let rows = h.orchestrator.repository().list().await.unwrap();
    assert_eq!(rows.len(), names.len());
    for row in &rows {
        assert!((1024..=65535).contains(&row.port));
    }
}
