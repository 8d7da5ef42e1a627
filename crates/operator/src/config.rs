use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::PathBuf, str::FromStr};
use tracing::debug;

use crate::logging::LogFormat;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/app-operator/config.toml";

#[derive(Debug, Deserialize, Default)]
pub struct FileConfig {
    pub namespace: Option<String>,
    pub field_manager: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub requeue_secs: Option<u64>,
    pub error_backoff_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Watch only this namespace; all namespaces when unset.
    pub namespace: Option<String>,
    pub field_manager: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub requeue_secs: u64,
    pub error_backoff_secs: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            field_manager: "app-operator".into(),
            log_level: "info".into(),
            log_format: LogFormat::Compact,
            requeue_secs: 300,
            error_backoff_secs: 30,
        }
    }
}

impl OperatorConfig {
    /// File values over defaults, then `APP_OPERATOR_*` environment overrides.
    pub fn load() -> Result<Self> {
        let cfg_path = config_file_path();
        debug!(path=?cfg_path, exists=?cfg_path.exists(), "config.load.attempt");
        let file_cfg: FileConfig = if cfg_path.exists() {
            let content = fs::read_to_string(&cfg_path).with_context(|| format!("failed to read config {cfg_path:?}"))?;
            toml::from_str(&content).with_context(|| format!("failed to parse config {cfg_path:?}"))?
        } else {
            FileConfig::default()
        };

        let defaults = Self::default();
        let mut cfg = Self {
            namespace: file_cfg.namespace.filter(|ns| !ns.is_empty()),
            field_manager: file_cfg.field_manager.unwrap_or(defaults.field_manager),
            log_level: file_cfg.log_level.unwrap_or(defaults.log_level),
            log_format: file_cfg.log_format.unwrap_or(defaults.log_format),
            requeue_secs: file_cfg.requeue_secs.unwrap_or(defaults.requeue_secs),
            error_backoff_secs: file_cfg.error_backoff_secs.unwrap_or(defaults.error_backoff_secs),
        };

        if let Some(ns) = env("APP_OPERATOR_NAMESPACE") { cfg.namespace = Some(ns); }
        if let Some(fm) = env("APP_OPERATOR_FIELD_MANAGER") { cfg.field_manager = fm; }
        if let Some(level) = env("APP_OPERATOR_LOG_LEVEL") { cfg.log_level = level; }
        if let Some(format) = parsed_env("APP_OPERATOR_LOG_FORMAT")? { cfg.log_format = format; }
        if let Some(secs) = parsed_env("APP_OPERATOR_REQUEUE_SECS")? { cfg.requeue_secs = secs; }
        if let Some(secs) = parsed_env("APP_OPERATOR_ERROR_BACKOFF_SECS")? { cfg.error_backoff_secs = secs; }
        debug!(?cfg, "config.effective");
        Ok(cfg)
    }
}

fn env(key: &str) -> Option<String> { std::env::var(key).ok().filter(|v| !v.is_empty()) }

fn parsed_env<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env(key).map(|raw| raw.parse::<T>().with_context(|| format!("invalid {key}={raw:?}"))).transpose()
}

pub fn config_file_path() -> PathBuf {
    env("APP_OPERATOR_CONFIG").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
