use std::io::Write;

use weft_core::config::{AppConfig, Settings};
use weft_core::node::ErrorPolicy;
use weft_core::WeftError;
use weft_engine::RunOptions;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_concurrency = 4
max_loop_iterations = 25
error_policy = "skip-dependents"

[log]
enabled = true
log_dir = "/tmp/weft-test-logs"
level = 3

[plugins.openai]
api_key = "sk-test-key"
organization = "acme"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrency, 4);
    assert_eq!(config.engine.max_loop_iterations, 25);
    assert_eq!(config.engine.error_policy, ErrorPolicy::SkipDependents);

    let log = config.log.as_ref().expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 3);
    assert_eq!(config.log_dir().to_str(), Some("/tmp/weft-test-logs"));

    let settings = Settings::from_config(&config);
    assert_eq!(settings.plugin_config("openai", "api_key").as_deref(), Some("sk-test-key"));
    assert_eq!(settings.plugin_config("openai", "organization").as_deref(), Some("acme"));

    let options = RunOptions::from(&config.engine);
    assert_eq!(options.max_concurrency, 4);
    assert_eq!(options.error_policy, ErrorPolicy::SkipDependents);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("WEFT_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[plugins.anthropic]
api_key = "${WEFT_TEST_API_KEY}"
region = "${WEFT_TEST_UNSET_VARIABLE}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    let plugin = &config.plugins["anthropic"];
    assert_eq!(plugin["api_key"], "expanded-key-value");
    assert_eq!(plugin["region"], "${WEFT_TEST_UNSET_VARIABLE}");

    std::env::remove_var("WEFT_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.engine.max_concurrency, 0);
    assert_eq!(config.engine.max_loop_iterations, 100);
    assert_eq!(config.engine.error_policy, ErrorPolicy::FailRun);
    assert!(config.log.is_none());
    assert!(config.plugins.is_empty());
}

#[test]
fn test_log_section_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[log]\n").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    let log = config.log.expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 2);
    assert!(log.log_dir.is_none());
}

#[test]
fn test_missing_config_file() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/weft.toml")).unwrap_err();
    assert!(matches!(err, WeftError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_error_policy_is_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\nerror_policy = \"ignore\"\n").expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, WeftError::Config(_)));
}
