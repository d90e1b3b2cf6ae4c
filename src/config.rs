// src/config.rs
//
// Configuration for a parallel workload run.
// Priority order (highest to lowest):
// 1. Command-line arguments (applied by the binary after load())
// 2. Environment variables (PW__* prefix)
// 3. Config file (YAML/TOML/JSON)
// 4. Built-in defaults

use crate::client::{ConnectTarget, ConnectionTargets};
use crate::settings::{Complexity, Scenario};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ============================================================================
// Main Configuration Structure
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Workload shape: seed, runtime, complexity, scenario, pool size
    pub run: RunSection,

    /// Where the database under test listens
    pub connection: ConnectionConfig,

    /// Process control for the kill and backup-restore scenarios
    pub process: ProcessConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Report output
    pub output: OutputConfig,
}

// ============================================================================
// Run Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSection {
    /// Top-level seed; defaults to the current unix time
    pub seed: Option<u64>,

    /// Runtime in seconds
    pub runtime_secs: u64,

    pub complexity: Complexity,

    pub scenario: Scenario,

    /// Worker threads; defaults to the number of logical CPUs
    pub threads: Option<usize>,

    /// Number of databases to create and run against
    pub databases: usize,

    /// Use hostile strings in identifiers (makes the queries unreadable)
    pub naughty_identifiers: bool,

    /// Seconds between throughput reports and liveness checks
    pub report_interval_secs: u64,

    /// `ALTER SYSTEM SET key = 'value'` pairs applied before the built-in
    /// capacity settings
    pub system_parameters: BTreeMap<String, String>,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            seed: None,
            runtime_secs: 600,
            complexity: Complexity::Full,
            scenario: Scenario::Regression,
            threads: None,
            databases: 2,
            naughty_identifiers: false,
            report_interval_secs: 10,
            system_parameters: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Connection Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    pub host: String,

    /// Port for regular (non-privileged) sessions
    pub port: u16,

    /// Port for the privileged system user
    pub system_port: u16,

    pub user: String,

    pub system_user: String,

    pub password: Option<String>,

    /// Database every session initially connects to
    pub database: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6875,
            system_port: 6877,
            user: "materialize".to_string(),
            system_user: "mz_system".to_string(),
            password: None,
            database: "materialize".to_string(),
        }
    }
}

// ============================================================================
// Process Control Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessConfig {
    /// docker compose file that runs the service under test
    pub compose_file: Option<PathBuf>,

    /// Compose service name of the database under test
    pub service: String,

    /// Shell command performing a full backup
    pub backup_command: Option<String>,

    /// Shell command restoring the last backup
    pub restore_command: Option<String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            compose_file: None,
            service: "materialized".to_string(),
            backup_command: None,
            restore_command: None,
        }
    }
}

// ============================================================================
// Logging Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: LogLevel,

    pub format: LogFormat,

    /// Log to file (path, or None for stdout only)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON format (for log aggregation)
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

// ============================================================================
// Output Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    /// Write the final report as JSON to this path
    pub report_json: Option<PathBuf>,
}

// ============================================================================
// Resolved Run Parameters
// ============================================================================

/// Immutable parameters of one run, resolved from [`HarnessConfig`].
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub seed: u64,
    pub runtime: Duration,
    pub complexity: Complexity,
    pub scenario: Scenario,
    pub threads: usize,
    pub databases: usize,
    pub naughty_identifiers: bool,
    pub report_interval: Duration,
    pub system_parameters: BTreeMap<String, String>,
    pub targets: ConnectionTargets,
}

impl RunConfig {
    /// The invocation line printed at startup, enough to reproduce the run.
    pub fn describe(&self) -> String {
        format!(
            "--seed={} --threads={} --runtime={} --complexity={} --scenario={} {}--databases={} (--host={})",
            self.seed,
            self.threads,
            self.runtime.as_secs(),
            self.complexity,
            self.scenario,
            if self.naughty_identifiers {
                "--naughty-identifiers "
            } else {
                ""
            },
            self.databases,
            self.targets.regular.host,
        )
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl HarnessConfig {
    /// Load configuration with priority chain:
    /// 1. Environment variables (PW__*)
    /// 2. Config file (if provided)
    /// 3. Built-in defaults
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        let defaults = Self::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize defaults")?;
        builder = builder.add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build().context("Failed to build config")?;

        let config: Self = settings
            .try_deserialize()
            .context("Failed to deserialize config")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.run.runtime_secs > 0,
            "run.runtime_secs must be > 0, got {}",
            self.run.runtime_secs
        );
        anyhow::ensure!(
            self.run.databases > 0,
            "run.databases must be > 0, got {}",
            self.run.databases
        );
        if let Some(threads) = self.run.threads {
            anyhow::ensure!(threads > 0, "run.threads must be > 0, got {}", threads);
        }
        anyhow::ensure!(
            self.run.report_interval_secs > 0,
            "run.report_interval_secs must be > 0, got {}",
            self.run.report_interval_secs
        );

        for key in self.run.system_parameters.keys() {
            anyhow::ensure!(
                is_parameter_name(key),
                "run.system_parameters: invalid parameter name '{}'",
                key
            );
        }

        anyhow::ensure!(
            !self.connection.host.trim().is_empty(),
            "connection.host cannot be empty"
        );
        anyhow::ensure!(self.connection.port > 0, "connection.port must be > 0");
        anyhow::ensure!(
            self.connection.system_port > 0,
            "connection.system_port must be > 0"
        );
        anyhow::ensure!(
            !self.connection.user.is_empty() && !self.connection.system_user.is_empty(),
            "connection users cannot be empty"
        );

        anyhow::ensure!(
            !self.process.service.trim().is_empty(),
            "process.service cannot be empty"
        );

        Ok(())
    }

    /// Resolve defaults that depend on the host (seed, thread count).
    pub fn run_config(&self) -> RunConfig {
        let seed = self.run.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        });
        let threads = self.run.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(10)
        });

        RunConfig {
            seed,
            runtime: Duration::from_secs(self.run.runtime_secs),
            complexity: self.run.complexity,
            scenario: self.run.scenario,
            threads,
            databases: self.run.databases,
            naughty_identifiers: self.run.naughty_identifiers,
            report_interval: Duration::from_secs(self.run.report_interval_secs),
            system_parameters: self.run.system_parameters.clone(),
            targets: self.connection.targets(),
        }
    }
}

/// System parameters are spliced into `ALTER SYSTEM` unquoted.
fn is_parameter_name(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl ConnectionConfig {
    pub fn targets(&self) -> ConnectionTargets {
        ConnectionTargets {
            regular: ConnectTarget {
                host: self.host.clone(),
                port: self.port,
                user: self.user.clone(),
                password: self.password.clone(),
                database: self.database.clone(),
            },
            system: ConnectTarget {
                host: self.host.clone(),
                port: self.system_port,
                user: self.system_user.clone(),
                password: self.password.clone(),
                database: self.database.clone(),
            },
        }
    }
}

/// Generate YAML config with default values.
///
/// # Example
/// ```bash
/// parallel-workload --generate-config yaml > workload.yaml
/// ```
pub fn generate_example_yaml() -> String {
    let config = HarnessConfig::default();
    match serde_yaml::to_string(&config) {
        Ok(serialized) => serialized,
        Err(error) => format!("# failed to serialize default config to YAML: {error}\n"),
    }
}

/// Generate TOML config with default values.
pub fn generate_example_toml() -> String {
    let config = HarnessConfig::default();
    match toml::to_string_pretty(&config) {
        Ok(serialized) => serialized,
        Err(error) => format!("# failed to serialize default config to TOML: {error}\n"),
    }
}
