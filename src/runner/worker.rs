use super::deadline::Deadline;
use crate::client::{ConnectionTargets, Connector};
use crate::error::HarnessError;
use crate::metrics::{ErrorHistogram, LatencyCollector};
use crate::settings::Scenario;
use crate::workload::Action;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

const UNKNOWN_CONNECTION: i64 = -1;

/// Live view of one worker, shared with the monitor and the cancel action.
///
/// All fields are relaxed atomics. The query counter is read and reset by
/// the monitor while the owner increments it, so per-period counts are
/// approximate.
#[derive(Debug)]
pub struct WorkerStats {
    queries: AtomicU64,
    running: AtomicBool,
    connection_id: AtomicI64,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerStats {
    pub fn new() -> Self {
        Self {
            queries: AtomicU64::new(0),
            running: AtomicBool::new(false),
            connection_id: AtomicI64::new(UNKNOWN_CONNECTION),
        }
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Read the period count and start a new period.
    pub fn take_queries(&self) -> u64 {
        let count = self.queries.load(Ordering::Relaxed);
        self.queries.store(0, Ordering::Relaxed);
        count
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn publish_connection_id(&self, id: Option<i64>) {
        self.connection_id
            .store(id.unwrap_or(UNKNOWN_CONNECTION), Ordering::Relaxed);
    }

    pub fn connection_id(&self) -> Option<i64> {
        match self.connection_id.load(Ordering::Relaxed) {
            UNKNOWN_CONNECTION => None,
            id => Some(id),
        }
    }
}

struct RunningGuard<'a>(&'a WorkerStats);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set_running(false);
    }
}

/// What a worker hands back when it reaches the deadline.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    /// Exact count of executed queries.
    pub queries: u64,
    pub errors: ErrorHistogram,
    pub latency: LatencyCollector,
}

impl WorkerOutcome {
    pub fn new() -> Result<Self, HarnessError> {
        Ok(Self {
            queries: 0,
            errors: ErrorHistogram::new(),
            latency: LatencyCollector::new()?,
        })
    }
}

/// Runs weighted random actions on one session until the deadline.
pub struct Worker {
    name: String,
    rng: StdRng,
    actions: Vec<Box<dyn Action>>,
    index: WeightedIndex<f64>,
    deadline: Deadline,
    autocommit: bool,
    system: bool,
    scenario: Scenario,
    stats: Arc<WorkerStats>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        rng: StdRng,
        actions: Vec<Box<dyn Action>>,
        weights: &[f64],
        deadline: Deadline,
        autocommit: bool,
        system: bool,
        scenario: Scenario,
    ) -> Result<Self, HarnessError> {
        let name = name.into();
        if actions.len() != weights.len() {
            return Err(HarnessError::Config(format!(
                "{name}: {} actions but {} weights",
                actions.len(),
                weights.len()
            )));
        }
        let index = WeightedIndex::new(weights.iter().copied())
            .map_err(|e| HarnessError::Config(format!("{name}: invalid action weights: {e}")))?;
        Ok(Self {
            name,
            rng,
            actions,
            index,
            deadline,
            autocommit,
            system,
            scenario,
            stats: Arc::new(WorkerStats::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Connect and loop until the deadline. An error no action accepts
    /// ends the worker with [`HarnessError::WorkerFailed`].
    pub fn run(
        mut self,
        connector: &dyn Connector,
        targets: &ConnectionTargets,
    ) -> Result<WorkerOutcome, HarnessError> {
        let stats = Arc::clone(&self.stats);
        let _running = RunningGuard(&stats);

        let mut exe = connector.connect(targets.for_privilege(self.system))?;
        exe.set_autocommit(self.autocommit);
        stats.publish_connection_id(exe.connection_id());
        stats.set_running(true);
        debug!(worker = %self.name, connection_id = ?exe.connection_id(), "worker started");

        let mut outcome = WorkerOutcome::new()?;
        while !self.deadline.expired() {
            let action = &mut self.actions[self.index.sample(&mut self.rng)];
            let started = Instant::now();
            match action.run(exe.as_mut()) {
                Ok(true) => {
                    stats.record_query();
                    outcome.queries += 1;
                    outcome.latency.record(started.elapsed());
                }
                Ok(false) => {}
                Err(err) => {
                    let ignored = action.errors_to_ignore(self.scenario);
                    let Some(kind) = ignored.iter().find(|e| err.message.contains(**e)) else {
                        warn!(worker = %self.name, action = %action.kind(), error = %err, "unexpected error");
                        return Err(HarnessError::WorkerFailed {
                            thread: self.name,
                            message: err.to_string(),
                        });
                    };
                    outcome.errors.record(kind, action.kind());
                    if err.connection_lost {
                        debug!(worker = %self.name, error = %err, "session lost, reconnecting on next statement");
                    } else if !exe.autocommit() {
                        let _ = exe.rollback();
                    }
                }
            }
            stats.publish_connection_id(exe.connection_id());
        }

        debug!(worker = %self.name, queries = outcome.queries, "worker reached deadline");
        Ok(outcome)
    }
}
