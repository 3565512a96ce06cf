use crate::error::{DbError, Result};
use crate::protocol::bind::BindLayout;
use crate::versioning::ApiVersion;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const LIBRARY_PATH_ENV: &str = "SQLANY_API_DLL";
pub const APP_NAME_ENV: &str = "DBCAPI_APP_NAME";
pub const API_VERSION_ENV: &str = "DBCAPI_API_VERSION";
pub const WORKER_THREADS_ENV: &str = "DBCAPI_WORKER_THREADS";
pub const LOG_ENV: &str = "DBCAPI_LOG";
/// JSON file read before the individual variables, which override it.
pub const CONFIG_FILE_ENV: &str = "DBCAPI_ENGINE_CONFIG";

const DEFAULT_APP_NAME: &str = "dbcapi_engine";
const DEFAULT_WORKER_THREADS: usize = 4;

/// Process-wide engine settings, fixed when the driver context is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Application name reported to the client library at init.
    pub app_name: String,
    /// Protocol version requested at init.
    pub api_version: ApiVersion,
    /// Explicit client library to load before the environment and defaults.
    pub library_path: Option<PathBuf>,
    /// Background pool size for callback-style calls.
    pub worker_threads: usize,
    pub logging_enabled: bool,
    pub bind_layout: BindLayout,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            api_version: ApiVersion::V4,
            library_path: None,
            worker_threads: DEFAULT_WORKER_THREADS,
            logging_enabled: true,
            bind_layout: BindLayout::ColumnWise,
        }
    }
}

fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

impl EngineConfig {
    /// Defaults, then the JSON file named by `DBCAPI_ENGINE_CONFIG`, then
    /// individual environment variables. Unparseable values are logged and
    /// ignored.
    pub fn from_env() -> Self {
        #[cfg(feature = "test-helpers")]
        crate::test_helpers::load_dotenv();

        let mut config = match env_value(CONFIG_FILE_ENV) {
            Some(path) => Self::from_file(&path).unwrap_or_else(|_| {
                log::warn!("ignoring {}={:?}: unreadable or invalid", CONFIG_FILE_ENV, path);
                Self::default()
            }),
            None => Self::default(),
        };

        if let Some(path) = env_value(LIBRARY_PATH_ENV) {
            config.library_path = Some(PathBuf::from(path));
        }
        if let Some(name) = env_value(APP_NAME_ENV) {
            config.app_name = name;
        }
        if let Some(raw) = env_value(API_VERSION_ENV) {
            match raw.trim().parse::<u32>() {
                Ok(v) if (1..=5).contains(&v) => config.api_version = ApiVersion(v),
                _ => log::warn!("ignoring {}={:?}: expected 1..=5", API_VERSION_ENV, raw),
            }
        }
        if let Some(raw) = env_value(WORKER_THREADS_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.worker_threads = n,
                _ => log::warn!("ignoring {}={:?}: expected a positive integer", WORKER_THREADS_ENV, raw),
            }
        }
        if let Some(raw) = env_value(LOG_ENV) {
            match parse_bool_flag(&raw) {
                Some(flag) => config.logging_enabled = flag,
                None => log::warn!("ignoring {}={:?}: expected a boolean", LOG_ENV, raw),
            }
        }

        config
    }

    fn from_file(path: &str) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            log::warn!("cannot read engine config {}: {}", path, e);
            DbError::InvalidArguments
        })?;
        Self::from_json(&json)
    }

    /// Parses a JSON document; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            log::warn!("invalid engine config: {}", e);
            DbError::InvalidArguments
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 || !(1..=5).contains(&self.api_version.0) {
            return Err(DbError::InvalidArguments);
        }
        Ok(())
    }
}
