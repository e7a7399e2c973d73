use std::io::Write;

use weft_core::config::{BindingPolicy, ErrorPolicy, WeftConfig};
use weft_core::error::WeftError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[orchestrator]
max_concurrency = 4
max_contexts = 2
error_policy = "fatal"
retries = 3
binding = "all_combinations"
lock_order = ["models", "store"]
validate_primitives = false

[log]
filter = "weft=debug"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = WeftConfig::load(tmp.path()).expect("load config");

    let orch = &config.orchestrator;
    assert_eq!(orch.max_concurrency, 4);
    assert_eq!(orch.max_contexts, Some(2));
    assert_eq!(orch.error_policy, ErrorPolicy::Fatal);
    assert_eq!(orch.retries, 3);
    assert_eq!(orch.binding, BindingPolicy::AllCombinations);
    assert_eq!(orch.lock_order, vec!["models", "store"]);
    assert!(!orch.validate_primitives);
    assert_eq!(config.log.filter, "weft=debug");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("WEFT_TEST_LOG_FILTER", "weft=trace");

    let toml_content = r#"
[log]
filter = "${WEFT_TEST_LOG_FILTER}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = WeftConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.log.filter, "weft=trace");
}

#[test]
fn test_partial_config_fills_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[orchestrator]\nretries = 1\n")
        .expect("write toml");

    let config = WeftConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.orchestrator.retries, 1);
    assert_eq!(config.orchestrator.max_concurrency, 16);
    assert_eq!(config.orchestrator.max_contexts, None);
    assert!(config.orchestrator.lock_order.is_empty());
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = WeftConfig::load(&dir.path().join("weft.toml")).unwrap_err();
    assert!(matches!(err, WeftError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_config_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[orchestrator]\nerror_policy = \"sometimes\"\n")
        .expect("write toml");
    assert!(matches!(
        WeftConfig::load(tmp.path()),
        Err(WeftError::Config(_))
    ));

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[orchestrator]\nmax_contexts = 0\n")
        .expect("write toml");
    assert!(matches!(
        WeftConfig::load(tmp.path()),
        Err(WeftError::Config(_))
    ));
}
