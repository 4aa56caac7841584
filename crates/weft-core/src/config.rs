use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};
use crate::node::ErrorPolicy;

/// Contents of `weft.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    /// Per-plugin key/value settings, e.g. `[plugins.openai] api_key = "..."`.
    #[serde(default)]
    pub plugins: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum nodes running at once per graph (0 = unbounded).
    #[serde(default)]
    pub max_concurrency: usize,
    /// Default iteration limit for loop controllers.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: usize,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            max_loop_iterations: default_max_loop_iterations(),
            error_policy: ErrorPolicy::default(),
        }
    }
}

fn default_max_loop_iterations() -> usize { 100 }

/// JSONL run recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run recording (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for run logs. Default: ~/.weft/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary, 2 = node lifecycle, 3 = everything.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        toml::from_str(&expand_env_vars(&content)).map_err(|e| WeftError::Config(e.to_string()))
    }

    /// Resolve the run-log directory (expand ~).
    pub fn log_dir(&self) -> PathBuf {
        let dir = self
            .log
            .as_ref()
            .and_then(|l| l.log_dir.as_deref())
            .unwrap_or("~/.weft/logs");
        expand_home(dir)
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

/// Replace `${NAME}` with the environment variable's value. Unset variables
/// are left as written.
fn expand_env_vars(input: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid pattern"));
    pattern
        .replace_all(input, |caps: &Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// The per-run settings view handed to nodes.
#[derive(Debug, Clone)]
pub struct Settings {
    pub plugins: HashMap<String, HashMap<String, String>>,
    /// Look up `<PLUGIN>_<KEY>` in the environment when a key is not configured.
    pub env_fallback: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            plugins: HashMap::new(),
            env_fallback: true,
        }
    }
}

impl Settings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            plugins: config.plugins.clone(),
            env_fallback: true,
        }
    }

    pub fn plugin_config(&self, plugin: &str, key: &str) -> Option<String> {
        if let Some(value) = self.plugins.get(plugin).and_then(|p| p.get(key)) {
            return Some(value.clone());
        }
        if !self.env_fallback {
            return None;
        }
        let name = format!("{plugin}_{key}").to_uppercase().replace('-', "_");
        std::env::var(name).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_WEFT_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_WEFT_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_WEFT_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_WEFT_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_WEFT_VAR}\"");
    }

    #[test]
    fn test_engine_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_concurrency, 0);
        assert_eq!(config.engine.max_loop_iterations, 100);
        assert_eq!(config.engine.error_policy, ErrorPolicy::FailRun);
        assert!(config.log.is_none());
    }

    #[test]
    fn test_error_policy_kebab_case() {
        let config: AppConfig = toml::from_str(
            r#"
[engine]
error_policy = "skip-dependents"
max_concurrency = 4
"#,
        )
        .unwrap();
        assert_eq!(config.engine.error_policy, ErrorPolicy::SkipDependents);
        assert_eq!(config.engine.max_concurrency, 4);
    }

    #[test]
    fn test_log_section_defaults_enabled() {
        let config: AppConfig = toml::from_str("[log]\nlog_dir = \"/tmp/weft\"\n").unwrap();
        let log = config.log.as_ref().unwrap();
        assert!(log.enabled);
        assert_eq!(config.log_dir(), PathBuf::from("/tmp/weft"));
    }

    #[test]
    fn test_plugin_config_lookup() {
        let config: AppConfig = toml::from_str(
            r#"
[plugins.openai]
api_key = "sk-test"
"#,
        )
        .unwrap();
        let settings = Settings::from_config(&config);
        assert_eq!(settings.plugin_config("openai", "api_key").as_deref(), Some("sk-test"));
        assert!(settings.plugin_config("openai", "organization_missing").is_none());
    }

    #[test]
    fn test_plugin_config_env_fallback() {
        std::env::set_var("MY_PLUGIN_TOKEN", "from-env");
        let settings = Settings::default();
        assert_eq!(settings.plugin_config("my-plugin", "token").as_deref(), Some("from-env"));

        let strict = Settings {
            env_fallback: false,
            ..Settings::default()
        };
        assert!(strict.plugin_config("my-plugin", "token").is_none());
        std::env::remove_var("MY_PLUGIN_TOKEN");
    }
}
