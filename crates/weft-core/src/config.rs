use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Top-level Weft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeftConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// How a failing context affects the rest of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Mark the failing context failed; siblings continue.
    #[default]
    Context,
    /// Abort the whole run on the first context failure.
    Fatal,
}

/// How parameters bind when several Inputs exist for one definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingPolicy {
    /// Only the most recently added Input binds.
    #[default]
    MostRecent,
    /// One parameter set per combination of current Inputs.
    AllCombinations,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum invocations in flight across all contexts.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Maximum contexts running at once (unbounded if unset).
    #[serde(default)]
    pub max_contexts: Option<usize>,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    /// Retries for a failing invocation unless the operation overrides it.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub binding: BindingPolicy,
    /// Explicit acquisition order of lock resource keys. When empty, keys
    /// are ordered lexicographically.
    #[serde(default)]
    pub lock_order: Vec<String>,
    #[serde(default = "default_validate_primitives")]
    pub validate_primitives: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_contexts: None,
            error_policy: ErrorPolicy::default(),
            retries: 0,
            binding: BindingPolicy::default(),
            lock_order: vec![],
            validate_primitives: default_validate_primitives(),
        }
    }
}

fn default_max_concurrency() -> usize { 16 }
fn default_validate_primitives() -> bool { true }

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// tracing `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "weft=info,warn".to_string()
}

impl WeftConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.orchestrator.max_concurrency == 0 {
            return Err(WeftError::Config(
                "orchestrator.max_concurrency must be at least 1".into(),
            ));
        }
        if self.orchestrator.max_contexts == Some(0) {
            return Err(WeftError::Config(
                "orchestrator.max_contexts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string. Unset variables are left as-is.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(val) => result.push_str(&val),
                    Err(_) => {
                        result.push_str("${");
                        result.push_str(name);
                        result.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}
