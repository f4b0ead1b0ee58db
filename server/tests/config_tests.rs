//! Tests for server config module

use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use ttp_common::TtpError;
use ttp_server::config::ServerConfig;

#[test]
fn test_config_default() {
    let config = ServerConfig::default();

    assert_eq!(config.telemetry.data_dir, PathBuf::from("data"));
    assert!(config.telemetry.cc.is_none());
    assert_eq!(config.pipeline.models_root, PathBuf::from("models"));
    assert_eq!(config.pipeline.published_path(), PathBuf::from("models/published"));
    assert_eq!(config.pipeline.scheduled_hour_utc, 11);
    assert_eq!(config.pipeline.rotation_timeout(), Duration::from_secs(72_000));
    assert_eq!(config.pipeline.reload_grace(), Duration::from_secs(60));
    assert!(config.pipeline.reload_command.is_none());
    assert!(!config.pipeline.tune);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_model_defaults() {
    let model = ServerConfig::default().model;

    assert_eq!(model.past_chunks, 8);
    assert_eq!(model.future_chunks, 5);
    assert_eq!(model.dim_in(), 62);
    assert_eq!(model.dim_out(), 21);
    assert_eq!(model.num_epochs(false), 500);
    assert_eq!(model.num_epochs(true), 300);
    assert_eq!(model.cl_max_days, 14);
}

#[test]
fn test_config_partial_toml() {
    let config: ServerConfig = toml::from_str(
        r#"
        [model]
        future_chunks = 3
        cl_max_days = 2

        [telemetry]
        cc = "bbr"

        [pipeline]
        scheduled_hour_utc = 4
        reload_command = ["systemctl", "reload", "media-server"]
        "#,
    )
    .unwrap();

    assert_eq!(config.model.future_chunks, 3);
    assert_eq!(config.model.past_chunks, 8);
    assert_eq!(config.model.cl_max_days, 2);
    assert_eq!(config.telemetry.cc.as_deref(), Some("bbr"));
    assert_eq!(config.telemetry.data_dir, PathBuf::from("data"));
    assert_eq!(config.pipeline.scheduled_hour_utc, 4);
    assert_eq!(config.pipeline.reload_command.as_ref().map(Vec::len), Some(3));
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_save_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");

    let mut config = ServerConfig::default();
    config.model.seed = Some(42);
    config.pipeline.tune = true;
    config.pipeline.reload_command = Some(vec!["true".into()]);
    config.save(&path).unwrap();

    let loaded = ServerConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_config_invalid_toml_is_config_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[pipeline\nscheduled_hour_utc = ").unwrap();

    let err = ServerConfig::load(&path).unwrap_err();
    assert!(matches!(err, TtpError::Config(_)));
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn test_config_validation() {
    let mut config = ServerConfig::default();
    config.pipeline.scheduled_hour_utc = 24;
    assert!(config.validate().is_err());

    let mut config = ServerConfig::default();
    config.pipeline.rotation_timeout_secs = 0;
    assert!(config.validate().is_err());

    let mut config = ServerConfig::default();
    config.pipeline.published_link = "a/b".into();
    assert!(config.validate().is_err());

    let mut config = ServerConfig::default();
    config.pipeline.reload_command = Some(vec![]);
    assert!(config.validate().is_err());

    let mut config = ServerConfig::default();
    config.model.bin_size = 0.0;
    assert!(matches!(config.validate(), Err(TtpError::Config(_))));
}
