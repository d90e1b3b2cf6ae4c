//! Run orchestration: bootstrap, provisioning, the worker pool, progress
//! monitoring, teardown and the final report.

pub mod deadline;
pub mod worker;

pub use deadline::Deadline;
pub use worker::{Worker, WorkerOutcome, WorkerStats};

use crate::client::{quote_literal, ConnectTarget, Connector, Executor};
use crate::config::RunConfig;
use crate::error::HarnessError;
use crate::metrics::{
    failure_percentage, ErrorHistogram, LatencyCollector, ResultsReporter, RunOutcome, RunReport,
};
use crate::settings::Scenario;
use crate::workload::database::{
    MAX_CLUSTERS, MAX_CLUSTER_REPLICAS, MAX_KAFKA_SINKS, MAX_KAFKA_SOURCES, MAX_POSTGRES_SOURCES,
    MAX_ROLES, MAX_SCHEMAS, MAX_TABLES, MAX_VIEWS, MAX_WEBHOOK_SOURCES,
};
use crate::workload::{
    child_rng, Action, ActionEnv, BackupRestoreAction, CancelAction, CategorySelector, Database,
    KillAction, ProcessController,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

/// Capacity settings and default grants applied before provisioning.
///
/// Limits are sized for every database at its per-database maximum, then
/// doubled since renames and drops race with creates.
pub fn bootstrap_statements(databases: usize) -> Vec<String> {
    let mut statements = vec![
        "ALTER SYSTEM SET enable_webhook_sources TO true".to_string(),
        format!("ALTER SYSTEM SET max_schemas_per_database = {}", MAX_SCHEMAS * 2),
        format!("ALTER SYSTEM SET max_tables = {}", databases * MAX_TABLES * 2),
        format!(
            "ALTER SYSTEM SET max_materialized_views = {}",
            databases * MAX_VIEWS * 2
        ),
        format!(
            "ALTER SYSTEM SET max_sources = {}",
            databases * (MAX_WEBHOOK_SOURCES + MAX_KAFKA_SOURCES + MAX_POSTGRES_SOURCES) * 2
        ),
        format!("ALTER SYSTEM SET max_sinks = {}", databases * MAX_KAFKA_SINKS * 2),
        format!("ALTER SYSTEM SET max_roles = {}", databases * MAX_ROLES * 2),
        format!("ALTER SYSTEM SET max_clusters = {}", databases * MAX_CLUSTERS * 2),
        format!(
            "ALTER SYSTEM SET max_replicas_per_cluster = {}",
            MAX_CLUSTER_REPLICAS * 2
        ),
    ];
    for object in [
        "TABLES",
        "TYPES",
        "SECRETS",
        "CONNECTIONS",
        "DATABASES",
        "SCHEMAS",
        "CLUSTERS",
    ] {
        statements.push(format!(
            "ALTER DEFAULT PRIVILEGES FOR ALL ROLES GRANT ALL PRIVILEGES ON {object} TO PUBLIC"
        ));
    }
    statements
}

/// Operator-supplied `ALTER SYSTEM` settings, in key order.
pub fn system_parameter_statements(parameters: &BTreeMap<String, String>) -> Vec<String> {
    parameters
        .iter()
        .map(|(key, value)| format!("ALTER SYSTEM SET {key} = {}", quote_literal(value)))
        .collect()
}

/// A spawned worker thread and its live stats.
struct WorkerHandle {
    name: String,
    stats: Arc<WorkerStats>,
    handle: Option<JoinHandle<Result<WorkerOutcome, HarnessError>>>,
    result: Option<Result<WorkerOutcome, HarnessError>>,
}

impl WorkerHandle {
    fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Block until the thread exits and keep its result.
    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.result = Some(handle.join().unwrap_or_else(|_| {
                Err(HarnessError::WorkerPanicked {
                    thread: self.name.clone(),
                })
            }));
        }
    }

    fn failure(&self) -> Option<&HarnessError> {
        self.result.as_ref().and_then(|r| r.as_ref().err())
    }
}

enum MonitorExit {
    Completed,
    Interrupted,
    Failed { thread: String, error: String },
}

/// Drives one run from bootstrap to report.
pub struct Orchestrator {
    config: RunConfig,
    connector: Arc<dyn Connector>,
    controller: Option<Arc<dyn ProcessController>>,
    service: String,
}

impl Orchestrator {
    pub fn new(config: RunConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            controller: None,
            service: "materialized".to_string(),
        }
    }

    /// Needed by the kill and backup-restore scenarios.
    pub fn with_process_controller(
        mut self,
        controller: Arc<dyn ProcessController>,
        service: impl Into<String>,
    ) -> Self {
        self.controller = Some(controller);
        self.service = service.into();
        self
    }

    fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn Executor>, HarnessError> {
        let mut exe = self.connector.connect(target)?;
        exe.set_autocommit(true);
        Ok(exe)
    }

    /// Run to completion. `interrupt` resolving forces the deadline and
    /// shuts down gracefully. The monitor's timers run on `rt`.
    ///
    /// A crashed worker does not produce an `Err`: the run stops without
    /// joining the remaining threads or tearing down, and the report's
    /// outcome names the thread.
    pub fn run<F>(&self, rt: &Handle, interrupt: F) -> Result<RunReport, HarnessError>
    where
        F: Future<Output = ()>,
    {
        let config = &self.config;
        if config.threads == 0 || config.databases == 0 {
            return Err(HarnessError::Config(
                "threads and databases must both be at least 1".to_string(),
            ));
        }
        if config.scenario.needs_process_controller() && self.controller.is_none() {
            return Err(HarnessError::MissingProcessController(
                config.scenario.to_string(),
            ));
        }

        println!("--- Running with: {}", config.describe());
        let started = Instant::now();
        let deadline = Deadline::after(config.runtime);

        let mut root = StdRng::seed_from_u64(config.seed);
        let mut rng = child_rng(&mut root);
        let databases: Vec<Arc<Database>> = (0..config.databases)
            .map(|i| {
                Arc::new(Database::new(
                    i,
                    config.seed,
                    &mut rng,
                    config.naughty_identifiers,
                ))
            })
            .collect();

        self.bootstrap(databases.len())?;
        self.provision(&databases)?;

        let workers = self.populate(&databases, &mut rng, &deadline)?;
        let mut handles = self.spawn(workers, &deadline)?;

        let (exit, reported) = rt.block_on(self.monitor(&mut handles, &deadline, interrupt));
        let interrupted = matches!(exit, MonitorExit::Interrupted);

        let failure = match exit {
            MonitorExit::Failed { thread, error } => Some((thread, error)),
            MonitorExit::Completed | MonitorExit::Interrupted => {
                info!("joining workers");
                for handle in &mut handles {
                    handle.join();
                }
                handles
                    .iter()
                    .find_map(|h| Some((h.name.clone(), h.failure()?.to_string())))
            }
        };

        if let Some((thread, error)) = failure {
            error!(%thread, %error, "worker failed, stopping run");
            let leftover: u64 = handles.iter().map(|h| h.stats.take_queries()).sum();
            let (_, errors, latency) = aggregate(&handles)?;
            return Ok(self.report(
                started,
                handles.len(),
                reported + leftover,
                errors,
                &latency,
                RunOutcome::Failed { thread, error },
            ));
        }

        self.teardown(&databases)?;

        let (queries, errors, latency) = aggregate(&handles)?;
        let outcome = if interrupted {
            RunOutcome::Interrupted
        } else {
            RunOutcome::Completed
        };
        info!(queries, failures = errors.total(), "run finished");
        Ok(self.report(started, handles.len(), queries, errors, &latency, outcome))
    }

    fn bootstrap(&self, databases: usize) -> Result<(), HarnessError> {
        info!(databases, "bootstrapping system settings");
        let mut exe = self.connect(&self.config.targets.system)?;
        let statements = system_parameter_statements(&self.config.system_parameters)
            .into_iter()
            .chain(bootstrap_statements(databases));
        for statement in statements {
            exe.execute(&statement).map_err(HarnessError::Bootstrap)?;
        }
        Ok(())
    }

    fn provision(&self, databases: &[Arc<Database>]) -> Result<(), HarnessError> {
        let mut system = self.connect(&self.config.targets.system)?;
        for db in databases {
            info!(database = %db, "provisioning");
            let provision_err = |source| HarnessError::Provision {
                database: db.name().to_string(),
                source,
            };
            db.create(system.as_mut()).map_err(provision_err)?;

            let target = ConnectTarget {
                database: db.name().to_string(),
                ..self.config.targets.regular.clone()
            };
            let mut exe = self.connect(&target)?;
            db.create_relations(exe.as_mut()).map_err(provision_err)?;
        }
        Ok(())
    }

    fn populate(
        &self,
        databases: &[Arc<Database>],
        rng: &mut StdRng,
        deadline: &Deadline,
    ) -> Result<Vec<Worker>, HarnessError> {
        let config = &self.config;
        let mut worker_rng = child_rng(rng);
        let selector = CategorySelector::new(config.complexity)?;
        let env = ActionEnv::new(databases.to_vec(), config.naughty_identifiers);

        let mut workers = Vec::with_capacity(config.threads + 1);
        for i in 0..config.threads {
            let category = selector.select(&mut worker_rng);
            let actions = category.instantiate(&env, &mut worker_rng)?;
            let worker = Worker::new(
                format!("worker_{i}"),
                child_rng(&mut worker_rng),
                actions,
                category.weights,
                deadline.clone(),
                category.autocommit,
                false,
                config.scenario,
            )?;
            println!("{}: {}", worker.name(), category.describe());
            workers.push(worker);
        }

        let controller = || {
            self.controller
                .clone()
                .ok_or_else(|| HarnessError::MissingProcessController(config.scenario.to_string()))
        };
        let scenario_worker: Option<(Box<dyn Action>, bool)> = match config.scenario {
            Scenario::Regression | Scenario::Rename => None,
            Scenario::Cancel => {
                let peers = workers.iter().map(Worker::stats).collect();
                let action = CancelAction::new(child_rng(&mut worker_rng), peers, deadline.clone());
                Some((Box::new(action) as Box<dyn Action>, true))
            }
            Scenario::Kill => {
                let action = KillAction::new(
                    child_rng(&mut worker_rng),
                    controller()?,
                    self.service.clone(),
                    deadline.clone(),
                );
                Some((Box::new(action) as Box<dyn Action>, false))
            }
            Scenario::BackupRestore => {
                let action = BackupRestoreAction::new(
                    child_rng(&mut worker_rng),
                    controller()?,
                    deadline.clone(),
                );
                Some((Box::new(action) as Box<dyn Action>, false))
            }
        };

        if let Some((action, system)) = scenario_worker {
            workers.push(Worker::new(
                config.scenario.as_str(),
                child_rng(&mut worker_rng),
                vec![action],
                &[1.0],
                deadline.clone(),
                false,
                system,
                config.scenario,
            )?);
        }
        Ok(workers)
    }

    fn spawn(
        &self,
        workers: Vec<Worker>,
        deadline: &Deadline,
    ) -> Result<Vec<WorkerHandle>, HarnessError> {
        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            let name = worker.name().to_string();
            let stats = worker.stats();
            let connector = Arc::clone(&self.connector);
            let targets = self.config.targets.clone();
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker.run(connector.as_ref(), &targets));
            match spawned {
                Ok(handle) => handles.push(WorkerHandle {
                    name,
                    stats,
                    handle: Some(handle),
                    result: None,
                }),
                Err(source) => {
                    deadline.force_now();
                    return Err(HarnessError::Spawn {
                        thread: name,
                        source,
                    });
                }
            }
        }
        info!(workers = handles.len(), "workers started");
        Ok(handles)
    }

    /// Poll liveness and print throughput each period until the deadline,
    /// a crashed worker, or an interrupt. Returns the queries reported.
    async fn monitor<F>(
        &self,
        handles: &mut [WorkerHandle],
        deadline: &Deadline,
        interrupt: F,
    ) -> (MonitorExit, u64)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(interrupt);
        let mut reported = 0u64;
        loop {
            if deadline.expired() {
                return (MonitorExit::Completed, reported);
            }
            for handle in handles.iter_mut().filter(|h| h.is_finished()) {
                handle.join();
                if let Some(failure) = handle.failure() {
                    deadline.force_now();
                    let exit = MonitorExit::Failed {
                        thread: handle.name.clone(),
                        error: failure.to_string(),
                    };
                    return (exit, reported);
                }
            }

            let period = Instant::now();
            let wait = self.config.report_interval.min(deadline.remaining());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = &mut interrupt => {
                    warn!("interrupt received, stopping workers");
                    println!("Interrupted, exiting");
                    deadline.force_now();
                    return (MonitorExit::Interrupted, reported);
                }
            }

            let counts: Vec<u64> = handles.iter().map(|h| h.stats.take_queries()).collect();
            println!("{}", ResultsReporter::qps_line(&counts, period.elapsed()));
            reported += counts.iter().sum::<u64>();
        }
    }

    fn teardown(&self, databases: &[Arc<Database>]) -> Result<(), HarnessError> {
        let mut exe = self.connect(&self.config.targets.regular)?;
        for db in databases {
            println!("Dropping database {db}");
            db.drop_database(exe.as_mut()).map_err(|source| HarnessError::Teardown {
                database: db.name().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    fn report(
        &self,
        started: Instant,
        workers: usize,
        queries: u64,
        errors: ErrorHistogram,
        latency: &LatencyCollector,
        outcome: RunOutcome,
    ) -> RunReport {
        let failures = errors.total();
        RunReport {
            seed: self.config.seed,
            complexity: self.config.complexity,
            scenario: self.config.scenario,
            workers,
            duration_secs: started.elapsed().as_secs_f64(),
            queries_executed: queries,
            failures,
            failure_percentage: failure_percentage(failures, queries),
            errors,
            latency: latency.summary(),
            outcome,
        }
    }
}

/// Executed queries, benign errors and latency over every worker that
/// finished cleanly.
fn aggregate(
    handles: &[WorkerHandle],
) -> Result<(u64, ErrorHistogram, LatencyCollector), HarnessError> {
    let mut queries = 0;
    let mut errors = ErrorHistogram::new();
    let mut latency = LatencyCollector::new()?;
    for outcome in handles
        .iter()
        .filter_map(|h| h.result.as_ref()?.as_ref().ok())
    {
        queries += outcome.queries;
        errors.merge(&outcome.errors);
        latency.merge(&outcome.latency)?;
    }
    Ok((queries, errors, latency))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_parameters_are_quoted_literals() {
        let parameters = BTreeMap::from([
            ("max_connections".to_string(), "5000".to_string()),
            ("default_cluster".to_string(), "it's".to_string()),
        ]);
        assert_eq!(
            system_parameter_statements(&parameters),
            vec![
                "ALTER SYSTEM SET default_cluster = 'it''s'".to_string(),
                "ALTER SYSTEM SET max_connections = '5000'".to_string(),
            ]
        );
    }

    #[test]
    fn bootstrap_limits_scale_with_databases() {
        let statements = bootstrap_statements(3);
        assert!(statements.contains(&"ALTER SYSTEM SET max_tables = 30".to_string()));
        assert!(statements.contains(&"ALTER SYSTEM SET max_roles = 90".to_string()));
        assert!(statements.contains(&"ALTER SYSTEM SET max_sources = 90".to_string()));
        assert!(statements
            .contains(&"ALTER SYSTEM SET max_replicas_per_cluster = 4".to_string()));
        assert_eq!(
            statements
                .iter()
                .filter(|s| s.starts_with("ALTER DEFAULT PRIVILEGES"))
                .count(),
            7
        );
    }
}
