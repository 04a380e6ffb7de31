use kiln_core::config::{ConfigError, EngineConfig};
use kiln_core::types::{BuildMode, PowerMode};
use std::io::Write;

#[test]
fn default_config() {
    let cfg = EngineConfig::default();
    assert_eq!(cfg.limits.full.max_agents, 8);
    assert_eq!(cfg.limits.fast.max_requests, 30);
    assert_eq!(cfg.scheduler.poll_interval_ms, 500);
    assert_eq!(cfg.scheduler.phase_timeout_secs, 300);
    assert_eq!(cfg.consensus.timeout_secs, 45);
    assert_eq!(cfg.consensus.max_tokens, 180);
    assert_eq!(cfg.recovery.max_error_history, 8);
    assert_eq!(cfg.recovery.max_fix_loops, 3);
    assert_eq!(cfg.timeouts.inactivity_threshold_ms, 120_000);
    assert!(cfg.consensus.enabled);
    cfg.validate().expect("default config validates");
}

#[test]
fn config_roundtrip() {
    let cfg = EngineConfig::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("[limits.full]"));

    let parsed = EngineConfig::from_toml_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.limits.full.max_requests, cfg.limits.full.max_requests);
    assert_eq!(parsed.tokens.frontend, cfg.tokens.frontend);
    assert_eq!(parsed.timeouts.build_full_secs, cfg.timeouts.build_full_secs);
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[limits.fast]
max_agents = 3
max_retries = 1
max_requests = 10
max_tokens_per_request = 900

[scheduler]
poll_interval_ms = 50
"#;
    let cfg = EngineConfig::from_toml_str(partial).expect("parse partial");
    assert_eq!(cfg.scheduler.poll_interval_ms, 50);
    // defaults fill in the rest
    assert_eq!(cfg.scheduler.phase_timeout_secs, 300);
    assert_eq!(cfg.limits.full.max_agents, 8);

    let limits = cfg.limits_for(BuildMode::Fast, PowerMode::Max);
    assert_eq!(limits.max_agents, 3);
    assert_eq!(limits.max_tokens_per_request, 900);
}

#[test]
fn retry_ceiling_fails_validation() {
    let text = r#"
[limits.full]
max_agents = 8
max_retries = 7
max_requests = 72
"#;
    let err = EngineConfig::from_toml_str(text).expect_err("validation should fail");
    assert!(matches!(err, ConfigError::Validation(_)));
    assert!(err.to_string().contains("max_retries"));
}

#[test]
fn zero_poll_interval_fails_validation() {
    let mut cfg = EngineConfig::default();
    cfg.scheduler.poll_interval_ms = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn load_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    writeln!(file, "[consensus]\nenabled = false\ntimeout_secs = 5").expect("write");
    let cfg = EngineConfig::load_from(file.path()).expect("load");
    assert!(!cfg.consensus.enabled);
    assert_eq!(cfg.consensus.timeout_secs, 5);
}

#[test]
fn load_from_missing_file_is_io_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = EngineConfig::load_from(dir.path().join("nope.toml")).expect_err("missing file");
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn garbage_toml_is_parse_error() {
    let err = EngineConfig::from_toml_str("limits = 5 = 6").expect_err("bad toml");
    assert!(matches!(err, ConfigError::Parse(_)));
}
