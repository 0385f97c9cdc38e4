use chrono::Utc;
use fcspawn::state::{StateManager, VmPhase, VmRecord, VmStore};
use std::net::Ipv4Addr;
use tempfile::TempDir;

fn record(uid: &str, name: &str) -> VmRecord {
    serde_json::from_value(serde_json::json!({
        "metadata": {
            "uid": uid,
            "name": name,
            "annotations": {"fcspawn.io/interface/eth1": "tc-redirect"},
            "created": "2024-05-01T12:00:00Z"
        },
        "spec": {
            "image": {"oci": "weaveworks/ubuntu:latest"},
            "kernel": {"oci": "weaveworks/kernel:5.10", "cmd_line": "console=ttyS0"},
            "cpus": 2,
            "memory_mib": 1024,
            "disk_size_bytes": 4294967296u64,
            "network": {"ports": [{"host_port": 8080, "guest_port": 80, "proto": "tcp"}]}
        },
        "status": {
            "image": {"id": "sha256-img", "size_bytes": 1048576},
            "kernel": {"id": "sha256-kern", "size_bytes": 65536}
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn test_record_persistence() {
    let temp_dir = TempDir::new().unwrap();
    let manager = StateManager::new(temp_dir.path().to_path_buf());
    manager.init().await.unwrap();

    let mut vm = record("0a1b2c3d4e5f6789", "web");
    manager.save(&vm).await.unwrap();

    let loaded = manager.load("0a1b2c3d4e5f6789").await.unwrap();
    assert_eq!(loaded.name(), "web");
    assert_eq!(loaded.phase(), VmPhase::Created);
    assert_eq!(loaded.status.image.id, "sha256-img");

    vm.mark_running(vec![Ipv4Addr::new(172, 17, 0, 2)], Utc::now());
    manager.save(&vm).await.unwrap();

    let loaded = manager.load("0a1b2c3d4e5f6789").await.unwrap();
    assert_eq!(loaded.phase(), VmPhase::Running);
    assert_eq!(loaded.ip_addresses(), &[Ipv4Addr::new(172, 17, 0, 2)]);
    assert_eq!(loaded.runtime_ports().len(), 1);
}

#[tokio::test]
async fn test_load_by_name() {
    let temp_dir = TempDir::new().unwrap();
    let manager = StateManager::new(temp_dir.path().to_path_buf());
    manager.init().await.unwrap();

    manager.save(&record("1111111111111111", "alpha")).await.unwrap();
    manager.save(&record("2222222222222222", "beta")).await.unwrap();

    let beta = manager.load("beta").await.unwrap();
    assert_eq!(beta.uid(), "2222222222222222");

    let err = manager.load("gamma").await.unwrap_err();
    assert!(format!("{:#}", err).contains("VM not found: gamma"));
}

#[tokio::test]
async fn test_records_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let temp_dir = TempDir::new().unwrap();
    let manager = StateManager::new(temp_dir.path().to_path_buf());
    manager.init().await.unwrap();
    manager.save(&record("3333333333333333", "private")).await.unwrap();

    let meta = std::fs::metadata(temp_dir.path().join("3333333333333333.json")).unwrap();
    assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    // no temp file left behind
    assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 1);
}

#[tokio::test]
async fn test_list_skips_unreadable_records() {
    let temp_dir = TempDir::new().unwrap();
    let manager = StateManager::new(temp_dir.path().to_path_buf());
    manager.init().await.unwrap();

    manager.save(&record("4444444444444444", "good")).await.unwrap();
    std::fs::write(temp_dir.path().join("broken.json"), "{not json").unwrap();

    let records = manager.list_records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name(), "good");
}

#[tokio::test]
async fn test_load_stays_inside_state_dir() {
    let temp_dir = TempDir::new().unwrap();
    let manager = StateManager::new(temp_dir.path().join("state"));
    manager.init().await.unwrap();

    // a well-formed record sitting next to the state dir
    let outside = serde_json::to_string(&record("4444444444444444", "outside")).unwrap();
    std::fs::write(temp_dir.path().join("outside.json"), outside).unwrap();

    let err = manager.load("../outside").await.unwrap_err();
    assert!(format!("{:#}", err).contains("VM not found: ../outside"));

    let err = manager.load_record("../outside").await.unwrap_err();
    assert!(err.to_string().contains("VM uid"));

    let mut escaping = record("4444444444444444", "escaping");
    escaping.metadata.uid = "../escaping".to_string();
    assert!(manager.save(&escaping).await.is_err());
    assert!(!temp_dir.path().join("escaping.json").exists());
}
