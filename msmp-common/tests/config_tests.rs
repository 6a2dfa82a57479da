//! Tests for configuration loading, atomic write-back and store folder resolution
//!
//! Uses serial_test for the tests that manipulate MSMP_STORE_DIR so they do
//! not race each other.

use msmp_common::config::{
    load_toml_config, resolve_store_dir, write_toml_config, LoggingConfig, TomlConfig,
    STORE_DIR_ENV,
};
use msmp_common::PipelineParams;
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[test]
fn test_missing_file_yields_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config = load_toml_config(&temp_dir.path().join("absent.toml")).unwrap();

    assert_eq!(config, TomlConfig::default());
    assert_eq!(config.pipeline.kclusters, 2);
}

#[test]
fn test_roundtrip_preserves_fields() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("config.toml");

    let config = TomlConfig {
        store_dir: Some(PathBuf::from("/data/msmp")),
        logging: LoggingConfig {
            level: "debug".to_string(),
            file: Some(PathBuf::from("/var/log/msmp.log")),
        },
        pipeline: PipelineParams {
            lag: 10,
            ndims: Some(5),
            kclusters: 64,
            ..Default::default()
        },
    };

    write_toml_config(&config, &target).unwrap();
    let parsed = load_toml_config(&target).unwrap();

    assert_eq!(parsed, config);
}

#[test]
fn test_write_leaves_no_temp_file() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("config.toml");

    write_toml_config(&TomlConfig::default(), &target).unwrap();

    let names: Vec<String> = std::fs::read_dir(temp_dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec!["config.toml".to_string()]);
}

#[test]
fn test_invalid_pipeline_table_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("config.toml");
    std::fs::write(&target, "[pipeline]\nvar_cutoff = 2.0\n").unwrap();

    assert!(load_toml_config(&target).is_err());
}

#[test]
fn test_garbage_file_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("config.toml");
    std::fs::write(&target, "this is = = not toml").unwrap();

    let err = load_toml_config(&target).unwrap_err();
    assert!(err.to_string().contains("Configuration error"));
}

#[test]
#[serial]
fn test_env_var_beats_toml() {
    env::set_var(STORE_DIR_ENV, "/from/env");
    let config = TomlConfig {
        store_dir: Some(PathBuf::from("/from/toml")),
        ..Default::default()
    };

    let resolved = resolve_store_dir(None, &config);
    env::remove_var(STORE_DIR_ENV);

    assert_eq!(resolved, PathBuf::from("/from/env"));
}

#[test]
#[serial]
fn test_toml_used_without_env() {
    env::remove_var(STORE_DIR_ENV);
    let config = TomlConfig {
        store_dir: Some(PathBuf::from("/from/toml")),
        ..Default::default()
    };

    assert_eq!(resolve_store_dir(None, &config), PathBuf::from("/from/toml"));
}

#[test]
#[serial]
fn test_cli_beats_env() {
    env::set_var(STORE_DIR_ENV, "/from/env");
    let resolved = resolve_store_dir(Some(Path::new("/from/cli")), &TomlConfig::default());
    env::remove_var(STORE_DIR_ENV);

    assert_eq!(resolved, PathBuf::from("/from/cli"));
}
