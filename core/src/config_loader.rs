//! Layered configuration for the severity service.
//!
//! Precedence, later layers override earlier ones:
//! 1. Defaults ([`ServiceConfig::default`])
//! 2. TOML file: an explicit path, or `config.toml` under the service home
//!    (`$SEVERITY_HOME`, defaulting to `~/.severity`)
//! 3. Environment overrides (`SEVERITY_*`)
//! 4. Caller overrides, typically parsed command-line flags
//!
//! ## Example
//!
//! ```no_run
//! use severity_core::config_loader::ConfigLoader;
//!
//! let config = ConfigLoader::new()
//!     .with_env_prefix("SEVERITY")
//!     .load()
//!     .expect("Failed to load config");
//! ```

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Errors that can occur during configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("I/O error loading config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parsing error in {}: {source}", path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Config validation error: {0}")]
    Validation(String),

    #[error("Invalid value for ${var}: '{value}' (expected: {expected})")]
    InvalidEnvValue {
        var: String,
        value: String,
        expected: String,
    },
}

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Directory holding both artifact bundles.
    pub model_dir: PathBuf,
    /// File name of the classifier + target encoder bundle.
    pub system_file: String,
    /// File name of the column encoders + feature schema bundle.
    pub artifacts_file: String,
    pub bind_addr: String,
    /// Append-only text log; relative paths resolve against the working directory.
    pub log_file: PathBuf,
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Whether the catch-all 500 response carries the failure text.
    pub expose_error_details: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            system_file: "crash_severity_system.json".to_string(),
            artifacts_file: "preprocessing_artifacts.json".to_string(),
            bind_addr: "127.0.0.1:5000".to_string(),
            log_file: PathBuf::from("severity_server.log"),
            log_filter: "info".to_string(),
            expose_error_details: true,
        }
    }
}

impl ServiceConfig {
    pub fn system_path(&self) -> PathBuf {
        self.model_dir.join(&self.system_file)
    }

    pub fn artifacts_path(&self) -> PathBuf {
        self.model_dir.join(&self.artifacts_file)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigLoadError> {
        self.bind_addr.parse().map_err(|e| {
            ConfigLoadError::Validation(format!("bind_addr '{}': {e}", self.bind_addr))
        })
    }

    fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.system_file.trim().is_empty() {
            return Err(ConfigLoadError::Validation(
                "system_file must not be empty".to_string(),
            ));
        }
        if self.artifacts_file.trim().is_empty() {
            return Err(ConfigLoadError::Validation(
                "artifacts_file must not be empty".to_string(),
            ));
        }
        self.socket_addr().map(|_| ())
    }
}

/// One configuration layer. Unset fields leave the layer below untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PartialConfig {
    pub model_dir: Option<PathBuf>,
    pub system_file: Option<String>,
    pub artifacts_file: Option<String>,
    pub bind_addr: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_filter: Option<String>,
    pub expose_error_details: Option<bool>,
}

impl PartialConfig {
    fn apply_to(self, config: &mut ServiceConfig) {
        if let Some(v) = self.model_dir {
            config.model_dir = v;
        }
        if let Some(v) = self.system_file {
            config.system_file = v;
        }
        if let Some(v) = self.artifacts_file {
            config.artifacts_file = v;
        }
        if let Some(v) = self.bind_addr {
            config.bind_addr = v;
        }
        if let Some(v) = self.log_file {
            config.log_file = v;
        }
        if let Some(v) = self.log_filter {
            config.log_filter = v;
        }
        if let Some(v) = self.expose_error_details {
            config.expose_error_details = v;
        }
    }
}

/// Builder for layered configuration loading.
pub struct ConfigLoader {
    home: Option<PathBuf>,
    config_file: Option<PathBuf>,
    env_prefix: String,
    overrides: PartialConfig,
    skip_file: bool,
    skip_env: bool,
    /// Stand-in for the process environment.
    env_vars: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            home: None,
            config_file: None,
            env_prefix: "SEVERITY".to_string(),
            overrides: PartialConfig::default(),
            skip_file: false,
            skip_env: false,
            env_vars: None,
        }
    }

    /// Set the service home explicitly instead of `$SEVERITY_HOME` / `~/.severity`.
    pub fn with_home(mut self, path: PathBuf) -> Self {
        self.home = Some(path);
        self
    }

    /// Read this file instead of `<home>/config.toml`. Unlike the default
    /// location, an explicit file must exist.
    pub fn with_config_file(mut self, path: PathBuf) -> Self {
        self.config_file = Some(path);
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Final layer, applied after the environment.
    pub fn with_overrides(mut self, overrides: PartialConfig) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn skip_file_layer(mut self) -> Self {
        self.skip_file = true;
        self
    }

    pub fn skip_env_layer(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Resolve `{PREFIX}_*` variables from `vars` instead of the process
    /// environment.
    pub fn with_env_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.env_vars = Some(vars);
        self
    }

    fn env_var(&self, key: &str) -> Option<String> {
        match &self.env_vars {
            Some(vars) => vars.get(key).cloned(),
            None => env::var(key).ok(),
        }
    }

    /// Load configuration with all enabled layers.
    pub fn load(self) -> Result<ServiceConfig, ConfigLoadError> {
        let mut config = ServiceConfig::default();

        if !self.skip_file {
            let file_layer = match &self.config_file {
                Some(path) => Self::load_from_file(path, true)?,
                None => Self::load_from_file(&self.resolve_home()?.join("config.toml"), false)?,
            };
            file_layer.apply_to(&mut config);
        }

        if !self.skip_env {
            Self::overrides_from(&self.env_prefix, |key| self.env_var(key))?
                .apply_to(&mut config);
        }

        self.overrides.apply_to(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn resolve_home(&self) -> Result<PathBuf, ConfigLoadError> {
        if let Some(path) = &self.home {
            return Ok(path.clone());
        }
        if let Some(path) = self.env_var(&format!("{}_HOME", self.env_prefix))
            && !path.trim().is_empty()
        {
            return Ok(PathBuf::from(path));
        }
        dirs::home_dir()
            .map(|home| home.join(".severity"))
            .ok_or_else(|| {
                ConfigLoadError::Validation("Cannot determine home directory".to_string())
            })
    }

    /// Parse a TOML layer. A missing file yields an empty layer unless `required`.
    pub fn load_from_file(path: &Path, required: bool) -> Result<PartialConfig, ConfigLoadError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!("{} not found, using defaults", path.display());
                return Ok(PartialConfig::default());
            }
            Err(source) => {
                return Err(ConfigLoadError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigLoadError::TomlParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read `{PREFIX}_*` overrides from the environment.
    pub fn env_overrides(prefix: &str) -> Result<PartialConfig, ConfigLoadError> {
        Self::overrides_from(prefix, |key| env::var(key).ok())
    }

    fn overrides_from(
        prefix: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<PartialConfig, ConfigLoadError> {
        let var = |name: &str| {
            let key = format!("{prefix}_{name}");
            lookup(&key)
                .filter(|value| !value.trim().is_empty())
                .inspect(|value| tracing::debug!("Applying env override: {key}={value}"))
        };

        let expose_var = format!("{prefix}_EXPOSE_ERROR_DETAILS");
        let expose_error_details = match var("EXPOSE_ERROR_DETAILS") {
            Some(value) => Some(parse_bool(&value).ok_or_else(|| {
                ConfigLoadError::InvalidEnvValue {
                    var: expose_var,
                    value,
                    expected: "true/false, 1/0, yes/no, on/off".to_string(),
                }
            })?),
            None => None,
        };

        Ok(PartialConfig {
            model_dir: var("MODEL_DIR").map(PathBuf::from),
            system_file: var("SYSTEM_FILE"),
            artifacts_file: var("ARTIFACTS_FILE"),
            bind_addr: var("BIND_ADDR"),
            log_file: var("LOG_FILE").map(PathBuf::from),
            log_filter: var("LOG_FILTER"),
            expose_error_details,
        })
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
