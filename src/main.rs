use anyhow::{Context, Result};
use clap::Parser;
use parallel_workload::config::{
    generate_example_toml, generate_example_yaml, HarnessConfig, LogFormat, LogLevel,
};
use parallel_workload::shutdown::{forward_signals, INTERRUPTED_EXIT_CODE};
use parallel_workload::workload::ComposeController;
use parallel_workload::{
    Complexity, HarnessError, Orchestrator, PgConnector, ResultsReporter, RunOutcome, Scenario,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Run randomized concurrent SQL workloads against a pg-wire database
#[derive(Parser, Debug)]
#[command(name = "parallel-workload")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Parallel randomized SQL workload harness", long_about = None)]
struct CliArgs {
    /// Path to configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "PW_CONFIG")]
    config: Option<String>,

    /// Top-level random seed (defaults to the current unix time)
    #[arg(long)]
    seed: Option<u64>,

    /// Runtime in seconds
    #[arg(long)]
    runtime: Option<u64>,

    /// full, reduced or read-only
    #[arg(long)]
    complexity: Option<Complexity>,

    /// regression, rename, cancel, kill or backup-restore
    #[arg(long)]
    scenario: Option<Scenario>,

    /// Worker threads (defaults to the number of logical CPUs)
    #[arg(long)]
    threads: Option<usize>,

    /// Number of databases
    #[arg(long)]
    databases: Option<usize>,

    /// Mix hostile strings into generated identifiers and values
    #[arg(long)]
    naughty_identifiers: bool,

    #[arg(long)]
    host: Option<String>,

    /// Port for regular sessions
    #[arg(long)]
    port: Option<u16>,

    /// Port for privileged sessions
    #[arg(long)]
    system_port: Option<u16>,

    /// Seconds between throughput reports
    #[arg(long)]
    report_interval: Option<u64>,

    /// Extra system parameter applied before the run (repeatable)
    #[arg(long = "system-parameter", value_name = "KEY=VALUE")]
    system_parameters: Vec<String>,

    /// Also write the final report as JSON
    #[arg(long, value_name = "PATH")]
    report_json: Option<PathBuf>,

    /// Compose file for the kill scenario
    #[arg(long, value_name = "PATH")]
    compose_file: Option<PathBuf>,

    /// Compose service to kill and restart
    #[arg(long)]
    service: Option<String>,

    /// Shell command taking a full backup
    #[arg(long)]
    backup_command: Option<String>,

    /// Shell command restoring the latest backup
    #[arg(long)]
    restore_command: Option<String>,

    #[arg(long)]
    log_level: Option<LogLevel>,

    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Generate example config file (yaml or toml) and exit
    #[arg(long, value_name = "FORMAT")]
    generate_config: Option<String>,
}

impl CliArgs {
    /// CLI flags take priority over file and environment.
    fn apply(self, config: &mut HarnessConfig) -> Result<()> {
        let run = &mut config.run;
        if self.seed.is_some() {
            run.seed = self.seed;
        }
        if let Some(runtime) = self.runtime {
            run.runtime_secs = runtime;
        }
        if let Some(complexity) = self.complexity {
            run.complexity = complexity;
        }
        if let Some(scenario) = self.scenario {
            run.scenario = scenario;
        }
        if self.threads.is_some() {
            run.threads = self.threads;
        }
        if let Some(databases) = self.databases {
            run.databases = databases;
        }
        if self.naughty_identifiers {
            run.naughty_identifiers = true;
        }
        if let Some(interval) = self.report_interval {
            run.report_interval_secs = interval;
        }
        for parameter in &self.system_parameters {
            let (key, value) = parameter
                .split_once('=')
                .with_context(|| format!("--system-parameter '{parameter}' is not KEY=VALUE"))?;
            run.system_parameters
                .insert(key.trim().to_string(), value.trim().to_string());
        }

        let conn = &mut config.connection;
        if let Some(host) = self.host {
            conn.host = host;
        }
        if let Some(port) = self.port {
            conn.port = port;
        }
        if let Some(port) = self.system_port {
            conn.system_port = port;
        }

        let process = &mut config.process;
        if self.compose_file.is_some() {
            process.compose_file = self.compose_file;
        }
        if let Some(service) = self.service {
            process.service = service;
        }
        if self.backup_command.is_some() {
            process.backup_command = self.backup_command;
        }
        if self.restore_command.is_some() {
            process.restore_command = self.restore_command;
        }

        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if self.report_json.is_some() {
            config.output.report_json = self.report_json;
        }
        Ok(())
    }
}

fn init_logging(config: &HarnessConfig) -> tracing_appender::non_blocking::WorkerGuard {
    let (non_blocking, guard) = if let Some(log_file) = &config.logging.file {
        match std::fs::File::create(log_file) {
            Ok(file) => tracing_appender::non_blocking(file),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to create log file {:?}: {}. Falling back to stdout.",
                    log_file, e
                );
                tracing_appender::non_blocking(std::io::stdout())
            }
        }
    } else {
        tracing_appender::non_blocking(std::io::stdout())
    };

    let log_level = config.logging.level.as_str();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("parallel_workload={log_level}").into()
    });

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .json()
                        .with_target(true)
                        .with_thread_names(true),
                )
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_target(true)
                        .with_thread_names(true),
                )
                .init();
        }
    }
    guard
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    if let Some(format) = &cli_args.generate_config {
        match format.to_lowercase().as_str() {
            "yaml" | "yml" => {
                println!("{}", generate_example_yaml());
                return Ok(());
            }
            "toml" => {
                println!("{}", generate_example_toml());
                return Ok(());
            }
            _ => anyhow::bail!("invalid format '{format}', use 'yaml' or 'toml'"),
        }
    }

    let mut config = HarnessConfig::load(cli_args.config.as_deref())?;
    cli_args.apply(&mut config)?;
    config.validate()?;

    let _guard = init_logging(&config);
    let run_config = config.run_config();
    info!(
        seed = run_config.seed,
        threads = run_config.threads,
        databases = run_config.databases,
        complexity = %run_config.complexity,
        scenario = %run_config.scenario,
        "configuration loaded"
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("pw-runtime")
        .build()
        .context("failed to build tokio runtime")?;

    let connector = Arc::new(PgConnector::new(rt.handle().clone()));
    let mut orchestrator = Orchestrator::new(run_config, connector);
    if config.run.scenario.needs_process_controller() {
        let mut controller = ComposeController::new(config.process.compose_file.clone());
        if let Some(command) = &config.process.backup_command {
            controller = controller.with_backup_command(command);
        }
        if let Some(command) = &config.process.restore_command {
            controller = controller.with_restore_command(command);
        }
        orchestrator =
            orchestrator.with_process_controller(Arc::new(controller), &config.process.service);
    }

    let interrupt = forward_signals(rt.handle(), || {
        eprintln!("Interrupted again, exiting");
        std::process::exit(INTERRUPTED_EXIT_CODE);
    });
    let report = orchestrator.run(rt.handle(), interrupt)?;
    ResultsReporter::print_summary(&report);
    if let Some(path) = &config.output.report_json {
        ResultsReporter::write_json(&report, path)?;
        info!(path = %path.display(), "report written");
    }

    if let RunOutcome::Failed { thread, error } = report.outcome {
        error!(%thread, "run failed");
        return Err(HarnessError::WorkerFailed {
            thread,
            message: error,
        }
        .into());
    }
    Ok(())
}
