#![allow(clippy::expect_used, clippy::unwrap_used)]

use mdev_protocol::config::{ProtocolConfig, MEDIATOR_FRAME_MAX_LENGTH};
use mdev_protocol::ProtocolError;
use std::time::Duration;

fn errors_with(mutator: impl FnOnce(&mut ProtocolConfig)) -> Vec<String> {
    ProtocolConfig::default_with_overrides(mutator).validate()
}

#[test]
fn test_default_config_is_valid() {
    let config = ProtocolConfig::default();
    assert!(config.validate().is_empty(), "{:?}", config.validate());
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_frame_bounds() {
    let errors = errors_with(|c| c.framing.min_frame_length = 2);
    assert!(errors.iter().any(|e| e.contains("Min frame length too small")));

    let errors = errors_with(|c| c.framing.max_frame_length = MEDIATOR_FRAME_MAX_LENGTH + 1);
    assert!(errors.iter().any(|e| e.contains("Max frame length too large")));

    let errors = errors_with(|c| {
        c.framing.min_frame_length = 64;
        c.framing.max_frame_length = 32;
    });
    assert!(errors
        .iter()
        .any(|e| e.contains("cannot be smaller than min frame length")));
}

#[test]
fn test_zero_channel_capacity() {
    let errors = errors_with(|c| c.framing.channel_capacity = 0);
    assert!(errors
        .iter()
        .any(|e| e.contains("Channel capacity must be greater than 0")));
}

#[test]
fn test_server_idle_timeout_below_minimum() {
    let errors = errors_with(|c| c.session.server_idle_timeout = Duration::from_secs(29));
    assert!(errors
        .iter()
        .any(|e| e.contains("Server idle timeout too short")));
}

#[test]
fn test_server_idle_timeout_must_fit_u16() {
    let errors = errors_with(|c| {
        c.session.server_idle_timeout = Duration::from_secs(u64::from(u16::MAX) + 1)
    });
    assert!(errors.iter().any(|e| e.contains("Server idle timeout too long")));
}

#[test]
fn test_empty_client_info() {
    let errors = errors_with(|c| c.session.client_info = String::new());
    assert!(errors.iter().any(|e| e.contains("Client info cannot be empty")));
}

#[test]
fn test_retry_settings() {
    let errors = errors_with(|c| {
        c.tasks.retry_initial_delay = Duration::from_secs(10);
        c.tasks.retry_max_delay = Duration::from_secs(1);
    });
    assert!(errors
        .iter()
        .any(|e| e.contains("cannot be smaller than the initial delay")));

    let errors = errors_with(|c| c.tasks.retry_max_attempts = 0);
    assert!(errors
        .iter()
        .any(|e| e.contains("Retry max attempts must be greater than 0")));

    let errors = errors_with(|c| c.tasks.retry_multiplier = 0);
    assert!(errors.iter().any(|e| e.contains("Retry multiplier")));
}

#[test]
fn test_zero_edit_grace_period() {
    let errors = errors_with(|c| c.tasks.edit_grace_period = Duration::ZERO);
    assert!(errors.iter().any(|e| e.contains("Edit grace period")));
}

#[test]
fn test_empty_app_name() {
    let errors = errors_with(|c| c.logging.app_name = String::new());
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_validate_strict_collects_every_error() {
    let config = ProtocolConfig::default_with_overrides(|c| {
        c.framing.channel_capacity = 0;
        c.session.client_info = String::new();
        c.tasks.retry_max_attempts = 0;
    });
    assert_eq!(config.validate().len(), 3);

    match config.validate_strict() {
        Err(ProtocolError::ConfigError(message)) => {
            assert!(message.contains("Configuration validation failed"));
            assert!(message.contains("Channel capacity"));
        }
        other => panic!("expected a config error, got {other:?}"),
    }
}

#[test]
fn test_from_toml_with_partial_sections() {
    let toml = r#"
        [session]
        client_info = "desktop/2.0"
        device_id = 7
        csp_device_id = 9
        echo_interval = 5000
        client_idle_timeout = 15000
        server_idle_timeout = 60000
    "#;
    let config = ProtocolConfig::from_toml(toml).unwrap();
    assert_eq!(config.session.device_id, 7);
    assert_eq!(config.session.echo_interval, Duration::from_secs(5));
    assert_eq!(config.session.server_idle_timeout, Duration::from_secs(60));
    assert_eq!(config.framing.channel_capacity, 64);
    assert!(config.validate().is_empty());
}

#[test]
fn test_from_toml_rejects_garbage() {
    let result = ProtocolConfig::from_toml("[session\nclient_info = ");
    assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
}

#[test]
fn test_example_config_round_trips() {
    let example = ProtocolConfig::example_config();
    let parsed = ProtocolConfig::from_toml(&example).unwrap();
    assert_eq!(parsed.session.client_info, ProtocolConfig::default().session.client_info);
    assert!(parsed.validate().is_empty());
}
