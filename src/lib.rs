//! Parallel workload harness
//!
//! Stress-tests a pg-wire database by running many worker threads, each
//! repeatedly executing randomly chosen SQL actions against a small set of
//! randomly generated databases until a shared deadline, while optionally
//! injecting faults (query cancellation, process kills, backup/restore).
//!
//! # Architecture
//!
//! ```text
//! parallel_workload
//! ├── config      # Layered configuration (defaults, file, PW__ env)
//! ├── client/     # Executor/Connector traits, sqlx pg-wire sessions
//! ├── workload/   # Action catalog, database object model, scenarios
//! ├── runner/     # Orchestrator, workers, shared deadline
//! └── metrics/    # Error and latency histograms, run report
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use parallel_workload::{HarnessConfig, Orchestrator, PgConnector};
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let rt = tokio::runtime::Runtime::new()?;
//!     let config = HarnessConfig::load(None)?.run_config();
//!     let connector = Arc::new(PgConnector::new(rt.handle().clone()));
//!     let report = Orchestrator::new(config, connector)
//!         .run(rt.handle(), parallel_workload::shutdown::shutdown_signal())?;
//!     parallel_workload::ResultsReporter::print_summary(&report);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod runner;
pub mod settings;
pub mod shutdown;
pub mod workload;

pub use client::{ConnectTarget, ConnectionTargets, Connector, Executor, PgConnector};
pub use config::{HarnessConfig, RunConfig};
pub use error::{HarnessError, QueryError};
pub use metrics::{ErrorHistogram, ResultsReporter, RunOutcome, RunReport};
pub use runner::{Deadline, Orchestrator};
pub use settings::{Complexity, Scenario};
