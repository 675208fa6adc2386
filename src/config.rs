//! Configuration for the monitor.
//!
//! Runtime settings live in [`MonitorConfig`]; the watch targets come from a
//! config file read by [`load_records`] into raw key/value records that
//! [`crate::registry::TargetRegistry::resolve`] then validates.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::registry::RawRecord;

pub const DEFAULT_MAX_PARALLEL: usize = 200;

/// What the event loop does when the notification source reports an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Log the error and stop monitoring.
    #[default]
    Stop,
    /// Log the error, re-register the directories it names and keep going.
    Continue,
}

impl FromStr for ErrorPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stop" => Ok(ErrorPolicy::Stop),
            "continue" => Ok(ErrorPolicy::Continue),
            other => Err(ConfigError::Invalid(format!(
                "invalid error policy: {other} (expected \"stop\" or \"continue\")"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Upper bound on directory registrations running at once.
    pub max_parallel: usize,
    /// Append lines here instead of stdout.
    pub output: Option<PathBuf>,
    pub on_error: ErrorPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            output: None,
            on_error: ErrorPolicy::Stop,
        }
    }
}

impl MonitorConfig {
    /// Defaults overridden by `TREEWATCH_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TREEWATCH_MAX_PARALLEL") {
            match val.parse::<usize>() {
                Ok(n) => config.max_parallel = n,
                Err(_) => tracing::warn!("ignoring TREEWATCH_MAX_PARALLEL={:?}", val),
            }
        }

        if let Ok(val) = std::env::var("TREEWATCH_OUTPUT") {
            if !val.is_empty() {
                config.output = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = std::env::var("TREEWATCH_ON_ERROR") {
            match val.parse::<ErrorPolicy>() {
                Ok(policy) => config.on_error = policy,
                Err(err) => tracing::warn!("ignoring TREEWATCH_ON_ERROR: {}", err),
            }
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Yaml,
    Toml,
    Json,
}

impl ConfigFormat {
    fn for_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref()
        {
            Some("toml") => ConfigFormat::Toml,
            Some("json") => ConfigFormat::Json,
            _ => ConfigFormat::Yaml,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TomlTargets {
    #[serde(default)]
    target: Vec<toml::Table>,
}

/// Read a target list from `path`.
///
/// YAML (the default) and JSON files hold a top-level list of maps; TOML
/// files use `[[target]]` tables. Scalar values are turned into strings.
pub fn load_records(path: &Path) -> Result<Vec<RawRecord>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_records(&content, ConfigFormat::for_path(path)).map_err(|reason| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    })
}

fn parse_records(content: &str, format: ConfigFormat) -> Result<Vec<RawRecord>, String> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    match format {
        ConfigFormat::Yaml => {
            let items: Vec<serde_yaml::Mapping> =
                serde_yaml::from_str(content).map_err(|e| e.to_string())?;
            items
                .into_iter()
                .map(|item| to_record(item, yaml_scalar, yaml_scalar))
                .collect()
        }
        ConfigFormat::Json => {
            let items: Vec<serde_json::Map<String, serde_json::Value>> =
                serde_json::from_str(content).map_err(|e| e.to_string())?;
            items
                .into_iter()
                .map(|item| to_record(item, Ok, json_scalar))
                .collect()
        }
        ConfigFormat::Toml => {
            let doc: TomlTargets = toml::from_str(content).map_err(|e| e.to_string())?;
            doc.target
                .into_iter()
                .map(|item| to_record(item, Ok, toml_scalar))
                .collect()
        }
    }
}

fn to_record<K, V>(
    entries: impl IntoIterator<Item = (K, V)>,
    key: impl Fn(K) -> Result<String, String>,
    value: impl Fn(V) -> Result<String, String>,
) -> Result<RawRecord, String> {
    let mut record = RawRecord::new();
    for (k, v) in entries {
        record.insert(key(k)?, value(v)?);
    }
    Ok(record)
}

fn yaml_scalar(value: serde_yaml::Value) -> Result<String, String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Null => Ok(String::new()),
        other => Err(format!("expected a scalar value, found {:?}", other)),
    }
}

fn json_scalar(value: serde_json::Value) -> Result<String, String> {
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(format!("expected a scalar value, found {}", other)),
    }
}

fn toml_scalar(value: toml::Value) -> Result<String, String> {
    match value {
        toml::Value::String(s) => Ok(s),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        other => Err(format!("expected a scalar value, found {}", other)),
    }
}
