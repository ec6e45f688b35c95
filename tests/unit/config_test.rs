//! Tests for configuration validation

use std::collections::HashMap;

use commons_match::config::{
    EngineConfig, ENV_DEFAULT_K, ENV_DIMENSION, ENV_MAX_RETAINED_TERMINAL, ENV_MAX_WAITLIST_DEPTH,
    ENV_SCORER_TIMEOUT_MS,
};

#[test]
fn test_defaults_are_valid() {
    let cfg = EngineConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.scorer.timeout_ms, 500);
    assert_eq!(cfg.scorer.fallback_half_life_secs, 7 * 24 * 3600);
    assert_eq!(cfg.waitlist.max_wait_secs, 14 * 24 * 3600);
    assert_eq!(cfg.waitlist.max_depth, 1024);
    assert_eq!(cfg.waitlist.max_retained_terminal, 1024);
    assert_eq!(cfg.index.min_vectors_for_ann, 1000);
    assert_eq!(cfg.events.buffer, 4096);
}

#[test]
fn test_zero_dimension_rejected() {
    let cfg = EngineConfig {
        dimension: 0,
        ..EngineConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_nested_errors_name_section() {
    let mut cfg = EngineConfig::default();
    cfg.scorer.timeout_ms = 0;
    let err = cfg.validate().unwrap_err();
    assert!(err.starts_with("scorer invalid"), "{err}");

    let mut cfg = EngineConfig::default();
    cfg.waitlist.max_depth = 0;
    assert!(cfg.validate().unwrap_err().starts_with("waitlist invalid"));
}

#[test]
fn test_from_json_partial_uses_defaults() {
    let cfg = EngineConfig::from_json_str(
        r#"{ "dimension": 8, "scorer": { "timeout_ms": 250 }, "waitlist": { "max_depth": 3 } }"#,
    )
    .unwrap();
    assert_eq!(cfg.dimension, 8);
    assert_eq!(cfg.scorer.timeout_ms, 250);
    assert_eq!(cfg.scorer.failure_threshold, 5);
    assert_eq!(cfg.waitlist.max_depth, 3);
    assert_eq!(cfg.default_k, 10);
}

#[test]
fn test_from_json_invalid() {
    assert!(EngineConfig::from_json_str("{ not json").unwrap_err().starts_with("parse error"));
    assert!(EngineConfig::from_json_str(r#"{ "default_k": 0 }"#).is_err());
}

#[test]
fn test_from_file_reports_path() {
    let err = EngineConfig::from_file("/definitely/not/here.json").unwrap_err();
    assert!(format!("{err:#}").contains("/definitely/not/here.json"));
}

#[test]
fn test_from_file_roundtrip() {
    let path = std::env::temp_dir().join(format!("commons-match-{}.json", std::process::id()));
    let cfg = EngineConfig {
        dimension: 16,
        ..EngineConfig::default()
    };
    std::fs::write(&path, serde_json::to_string(&cfg).unwrap()).unwrap();
    let loaded = EngineConfig::from_file(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(loaded, cfg);
}

#[test]
fn test_overrides() {
    let vars: HashMap<&str, &str> = [
        (ENV_DIMENSION, "32"),
        (ENV_DEFAULT_K, " 4 "),
        (ENV_SCORER_TIMEOUT_MS, "100"),
        (ENV_MAX_WAITLIST_DEPTH, "64"),
        (ENV_MAX_RETAINED_TERMINAL, "16"),
    ]
    .into_iter()
    .collect();
    let mut cfg = EngineConfig::default();
    cfg.apply_overrides(|k| vars.get(k).map(|v| (*v).to_string()))
        .unwrap();
    assert_eq!(cfg.dimension, 32);
    assert_eq!(cfg.default_k, 4);
    assert_eq!(cfg.scorer.timeout_ms, 100);
    assert_eq!(cfg.waitlist.max_depth, 64);
    assert_eq!(cfg.waitlist.max_retained_terminal, 16);
}

#[test]
fn test_bad_override_names_variable() {
    let mut cfg = EngineConfig::default();
    let err = cfg
        .apply_overrides(|k| (k == ENV_DIMENSION).then(|| "many".to_string()))
        .unwrap_err();
    assert!(err.contains(ENV_DIMENSION));

    let mut cfg = EngineConfig::default();
    assert!(cfg
        .apply_overrides(|k| (k == ENV_DEFAULT_K).then(|| "0".to_string()))
        .is_err());
}
