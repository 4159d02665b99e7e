//! Tests for orchestrator configuration loading.

use nimrun::{Error, Indirection, OrchestratorConfig};
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_load_full_json_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("nimrun.json");
    std::fs::write(
        &path,
        r#"{
            "runtime": "docker",
            "indirection": {"kind": "wsl", "distro": "Ubuntu-22.04"},
            "base_port": 9100,
            "max_port": 9200,
            "shm_size": "32GB",
            "cache_root": "/data/nimcache",
            "ready_timeout_secs": 600,
            "poll_interval_ms": 500
        }"#,
    )
    .unwrap();

    let config = OrchestratorConfig::from_json_file(&path).unwrap();

    assert_eq!(config.runtime, "docker");
    assert_eq!(config.indirection, Some(Indirection::wsl("Ubuntu-22.04")));
    assert_eq!(config.base_port, 9100);
    assert_eq!(config.max_port, 9200);
    assert_eq!(config.shm_size, "32GB");
    assert_eq!(config.ready_timeout(), Duration::from_secs(600));
    assert_eq!(config.poll_interval(), Duration::from_millis(500));
    // Unspecified fields keep their defaults.
    assert_eq!(config.registry, "nvcr.io");
    assert_eq!(config.registry_username, "$oauthtoken");
}

#[test]
fn test_custom_indirection_from_json() {
    let config: OrchestratorConfig = serde_json::from_str(
        r#"{"indirection": {"kind": "custom", "prefix": "ssh gpu-box", "elevated_prefix": "ssh root@gpu-box"}}"#,
    )
    .unwrap();

    let indirection = config.indirection.unwrap();
    assert_eq!(indirection.prefix(), "ssh gpu-box");
    assert_eq!(indirection.elevated_prefix(), "ssh root@gpu-box");
    assert_eq!(indirection.distro(), None);
}

#[test]
fn test_missing_file_is_invalid_config() {
    let temp = TempDir::new().unwrap();
    let result = OrchestratorConfig::from_json_file(&temp.path().join("absent.json"));
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[test]
fn test_inverted_port_range_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("nimrun.json");
    std::fs::write(&path, r#"{"base_port": 9000, "max_port": 8000}"#).unwrap();

    let result = OrchestratorConfig::from_json_file(&path);
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[test]
fn test_overrides_apply_in_order() {
    let config = OrchestratorConfig::default()
        .with_overrides(|key| match key {
            "NIMRUN_WSL_DISTRO" => Some("Ubuntu".to_string()),
            "NIMRUN_SHM_SIZE" => Some("8GB".to_string()),
            "NIMRUN_CACHE_ROOT" => Some("/mnt/cache".to_string()),
            "NIMRUN_READY_TIMEOUT_SECS" => Some("120".to_string()),
            _ => None,
        })
        .unwrap();

    assert_eq!(config.indirection, Some(Indirection::wsl("Ubuntu")));
    assert_eq!(config.shm_size, "8GB");
    assert_eq!(
        config.cache_root.as_deref(),
        Some(std::path::Path::new("/mnt/cache"))
    );
    assert_eq!(config.ready_timeout(), Duration::from_secs(120));
}

#[test]
fn test_no_indirection_wins_over_distro() {
    let config = OrchestratorConfig::default()
        .with_overrides(|key| match key {
            "NIMRUN_WSL_DISTRO" => Some("Ubuntu".to_string()),
            "NIMRUN_NO_INDIRECTION" => Some("true".to_string()),
            _ => None,
        })
        .unwrap();

    assert!(config.indirection.is_none());
}
