//! Configuration management

use clap::Args;
use config::{Config as ConfigBuilder, ConfigError as BuilderError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::extension::backend::BackendKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid http configuration: {0}")]
    InvalidHttp(String),

    #[error("Invalid engine configuration: {0}")]
    InvalidEngine(String),

    #[error("Invalid registry configuration: {0}")]
    InvalidRegistry(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Invalid storage configuration: {0}")]
    InvalidStorage(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

impl From<ConfigError> for crate::core::error::ConsumetError {
    fn from(err: ConfigError) -> Self {
        crate::core::error::ConsumetError::ConfigError(err.to_string())
    }
}

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub http: HttpConfig,
    pub engine: EngineConfig,
    pub registry: RegistryConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration with precedence: CLI args > Environment variables > Config file > Defaults
    pub fn load(cli_args: &CliArgs) -> Result<Self, ConfigError> {
        // 1. Start with defaults (lowest priority)
        let mut builder = Self::defaults(ConfigBuilder::builder())?;

        // 2. Load from config file if specified (medium priority)
        if let Some(config_path) = &cli_args.config {
            if !config_path.exists() {
                return Err(ConfigError::FileNotFound(
                    config_path.display().to_string()
                ));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        }

        // 3. Override with environment variables (higher priority)
        // Example: CONSUMET_ENGINE__BACKEND=node
        builder = builder.add_source(
            Environment::with_prefix("CONSUMET")
                .separator("__")
                .try_parsing(true)
        );

        // 4. Override with CLI arguments (highest priority)
        if let Some(backend) = &cli_args.backend {
            builder = builder.set_override("engine.backend", backend.clone())?;
        }
        if let Some(node_binary) = &cli_args.node_binary {
            builder = builder.set_override("engine.node_binary", node_binary.display().to_string())?;
        }
        if !cli_args.registry.is_empty() {
            builder = builder.set_override("registry.sources", cli_args.registry.clone())?;
        }
        if let Some(data_dir) = &cli_args.data_dir {
            builder = builder.set_override("storage.data_dir", data_dir.display().to_string())?;
        }
        if let Some(log_level) = &cli_args.log_level {
            builder = builder.set_override("logging.level", log_level.clone())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file path, on top of the defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: Config = Self::defaults(ConfigBuilder::builder())?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults only
    pub fn from_defaults() -> Result<Self, ConfigError> {
        let config: Config = Self::defaults(ConfigBuilder::builder())?
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let data_dir = dirs::data_local_dir()
            .map(|d| d.join("consumet"))
            .unwrap_or_else(|| PathBuf::from("./data"));

        Ok(builder
            .set_default("http.user_agent", DEFAULT_USER_AGENT)?
            .set_default("http.timeout_secs", 30)?
            .set_default("http.connect_timeout_secs", 10)?
            .set_default("engine.backend", "in_process")?
            .set_default("engine.load_timeout_secs", 30)?
            .set_default("engine.execute_timeout_secs", 60)?
            .set_default("engine.node_binary", "node")?
            .set_default("engine.node_ready_timeout_secs", 10)?
            .set_default("registry.sources", Vec::<String>::new())?
            .set_default("storage.data_dir", data_dir.display().to_string())?
            .set_default("storage.state_file", "installed.json")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "text")?
            .set_default("logging.output", "stderr")?
            .set_default("logging.max_file_size", 10485760)? // 10 MB
            .set_default("logging.max_backups", 5)?)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.http.validate()?;
        self.engine.validate()?;
        self.registry.validate()?;
        self.storage.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Command-line arguments for configuration override
#[derive(Debug, Default, Clone, Args)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Execution backend (in_process, webview, node)
    #[arg(short, long, value_name = "BACKEND", global = true)]
    pub backend: Option<String>,

    /// Node binary used by the node backend
    #[arg(long, value_name = "PATH", global = true)]
    pub node_binary: Option<PathBuf>,

    /// Registry document URL or path (repeatable)
    #[arg(short, long, value_name = "SOURCE", global = true)]
    pub registry: Vec<String>,

    /// Data directory for installed state
    #[arg(long, value_name = "DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl HttpConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::InvalidHttp("user_agent cannot be empty".to_string()));
        }

        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidHttp("timeout_secs must be greater than 0".to_string()));
        }

        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidHttp("connect_timeout_secs must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub backend: String,
    pub load_timeout_secs: u64,
    pub execute_timeout_secs: u64,
    pub node_binary: PathBuf,
    pub node_ready_timeout_secs: u64,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backend_kind()?;

        if self.load_timeout_secs == 0 {
            return Err(ConfigError::InvalidEngine("load_timeout_secs must be greater than 0".to_string()));
        }

        if self.execute_timeout_secs == 0 {
            return Err(ConfigError::InvalidEngine("execute_timeout_secs must be greater than 0".to_string()));
        }

        if self.node_binary.as_os_str().is_empty() {
            return Err(ConfigError::InvalidEngine("node_binary cannot be empty".to_string()));
        }

        if self.node_ready_timeout_secs == 0 {
            return Err(ConfigError::InvalidEngine("node_ready_timeout_secs must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn backend_kind(&self) -> Result<BackendKind, ConfigError> {
        self.backend
            .parse::<BackendKind>()
            .map_err(ConfigError::InvalidEngine)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn execute_timeout(&self) -> Duration {
        Duration::from_secs(self.execute_timeout_secs)
    }

    pub fn node_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.node_ready_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: "in_process".to_string(),
            load_timeout_secs: 30,
            execute_timeout_secs: 60,
            node_binary: PathBuf::from("node"),
            node_ready_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    /// Registry documents, as http(s) URLs, file:// URLs or local paths
    pub sources: Vec<String>,
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(blank) = self.sources.iter().find(|s| s.trim().is_empty()) {
            return Err(ConfigError::InvalidRegistry(format!(
                "registry source cannot be empty: {:?}",
                blank
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Installed-set file, relative to data_dir unless absolute
    pub state_file: Option<PathBuf>,
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidStorage("data_dir cannot be empty".to_string()));
        }

        if let Some(state_file) = &self.state_file {
            if state_file.as_os_str().is_empty() {
                return Err(ConfigError::InvalidStorage("state_file cannot be empty".to_string()));
            }
        }

        Ok(())
    }

    pub fn state_path(&self) -> Option<PathBuf> {
        self.state_file.as_ref().map(|file| {
            if file.is_absolute() {
                file.clone()
            } else {
                self.data_dir.join(file)
            }
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub log_file: Option<PathBuf>,
    pub max_file_size: usize, // bytes
    pub max_backups: usize,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("level must be one of: {:?}", valid_levels)
            ));
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("format must be one of: {:?}", valid_formats)
            ));
        }

        let valid_outputs = ["stdout", "stderr", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("output must be one of: {:?}", valid_outputs)
            ));
        }

        if self.output == "file" && self.log_file.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_file must be specified when output is 'file'".to_string()
            ));
        }

        if self.max_file_size == 0 {
            return Err(ConfigError::InvalidLogging("max_file_size must be greater than 0".to_string()));
        }

        if self.max_backups == 0 {
            return Err(ConfigError::InvalidLogging("max_backups must be greater than 0".to_string()));
        }

        Ok(())
    }
}
