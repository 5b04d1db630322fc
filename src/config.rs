//! Checker configuration
//!
//! One `CheckerConfig` describes a single testcase run: the candidate, the
//! expected/actual layout, the jail and the execution limits. It is loaded
//! from a TOML file with a couple of environment overrides and passed
//! explicitly to the components that need it.

use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::engine::resolver::Layout;
use crate::runner::RunLimits;
use crate::sandbox::JailConfig;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "CHECKER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "./checker.toml";
const TIMEOUT_ENV: &str = "CHECKER_TIMEOUT_SECS";
const TARGET_ENV: &str = "CHECKER_TARGET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidOverride { key: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Expected and actual trees, as seen from the host
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayoutConfig {
    pub expected_root: PathBuf,
    pub actual_root: PathBuf,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            expected_root: PathBuf::from("/expected"),
            actual_root: PathBuf::from("/actual"),
        }
    }
}

/// Configuration of one testcase run
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckerConfig {
    /// Candidate executable, as seen inside the jail
    pub target: PathBuf,
    /// Extra arguments passed to the candidate
    pub args: Vec<String>,
    /// Extra environment for the candidate (key=value)
    pub env: Vec<String>,
    /// Wall-clock timeout in seconds
    pub timeout_secs: u64,
    /// Exit status counted as a successful run
    pub success_status: i32,
    /// Bytes kept per captured stream and per compared file
    pub max_output_bytes: usize,
    pub layout: LayoutConfig,
    pub jail: JailConfig,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            target: PathBuf::from("/home/user/a.out"),
            args: Vec::new(),
            env: Vec::new(),
            timeout_secs: 5,
            success_status: 0,
            max_output_bytes: 16 * 1024 * 1024,
            layout: LayoutConfig::default(),
            jail: JailConfig::default(),
        }
    }
}

impl CheckerConfig {
    /// Load from `$CHECKER_CONFIG` (or `./checker.toml`) and apply
    /// environment overrides. A missing default file means all defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var(CONFIG_PATH_ENV).ok();
        let path = PathBuf::from(explicit.as_deref().unwrap_or(DEFAULT_CONFIG_PATH));

        let mut config = match fs::read_to_string(&path) {
            Ok(content) => {
                info!("Loaded checker configuration from {:?}", path);
                toml::from_str(&content)?
            }
            Err(e) if explicit.is_none() && e.kind() == io::ErrorKind::NotFound => {
                debug!("No config file at {:?}, using defaults", path);
                Self::default()
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(TIMEOUT_ENV) {
            self.timeout_secs = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidOverride {
                    key: TIMEOUT_ENV,
                    value,
                })?;
        }
        if let Some(value) = lookup(TARGET_ENV) {
            self.target = PathBuf::from(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "timeout_secs must be greater than zero".into(),
            ));
        }
        let absolute = [
            ("layout.expected_root", &self.layout.expected_root),
            ("layout.actual_root", &self.layout.actual_root),
            ("jail.root", &self.jail.root),
            ("jail.work_dir", &self.jail.work_dir),
        ];
        for (key, path) in absolute {
            if !path.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "{} must be an absolute path, got {:?}",
                    key, path
                )));
            }
        }
        if self.target.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("target must not be empty".into()));
        }
        Ok(())
    }

    /// Host-side roots used to resolve comparison pairs
    pub fn layout(&self) -> Layout {
        Layout::new(
            &self.layout.expected_root,
            &self.layout.actual_root,
            self.jail.host_work_dir(),
        )
    }

    pub fn limits(&self) -> RunLimits {
        RunLimits::new(self.timeout_secs, self.max_output_bytes)
    }
}
