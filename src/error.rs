use thiserror::Error;

/// Errors that end a run.
///
/// Every variant is fatal: bootstrap, provisioning and teardown have no
/// partial recovery, and a worker failure stops the whole pool.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to connect to {target}: {message}")]
    Connect { target: String, message: String },

    #[error("bootstrap failed: {0}")]
    Bootstrap(#[source] QueryError),

    #[error("provisioning database {database} failed: {source}")]
    Provision {
        database: String,
        #[source]
        source: QueryError,
    },

    #[error("dropping database {database} failed: {source}")]
    Teardown {
        database: String,
        #[source]
        source: QueryError,
    },

    #[error("scenario {0} requires a process controller")]
    MissingProcessController(String),

    #[error("thread {thread} failed, exiting: {message}")]
    WorkerFailed { thread: String, message: String },

    #[error("thread {thread} panicked, exiting")]
    WorkerPanicked { thread: String },

    #[error("failed to spawn thread {thread}: {source}")]
    Spawn {
        thread: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write report: {0}")]
    Report(String),

    #[error("metrics error: {0}")]
    Metrics(String),
}

/// A statement failed on the database under test.
///
/// Whether it is benign is decided by the worker against the failing
/// action's ignore list; the executor only reports what happened.
#[derive(Debug, Clone, Error)]
#[error("{message} (query: {query})")]
pub struct QueryError {
    pub query: String,
    pub message: String,
    /// The session is gone; the next statement needs a new connection.
    pub connection_lost: bool,
}

impl QueryError {
    pub fn new(query: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            message: message.into(),
            connection_lost: false,
        }
    }

    pub fn connection_lost(query: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            message: message.into(),
            connection_lost: true,
        }
    }
}

/// An external process-control command failed.
#[derive(Debug, Clone, Error)]
#[error("`{command}` failed: {message}")]
pub struct ControlError {
    pub command: String,
    pub message: String,
}

impl From<ControlError> for QueryError {
    fn from(err: ControlError) -> Self {
        QueryError::new(err.command, err.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_failure_names_the_thread() {
        let failed = HarnessError::WorkerFailed {
            thread: "worker_3".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(failed.to_string(), "thread worker_3 failed, exiting: boom");
    }

    #[test]
    fn query_error_display_includes_query() {
        let err = QueryError::new("SELECT 1", "relation does not exist");
        assert_eq!(err.to_string(), "relation does not exist (query: SELECT 1)");
        assert!(!err.connection_lost);
        assert!(QueryError::connection_lost("SELECT 1", "closed").connection_lost);
    }

    #[test]
    fn control_error_becomes_fatal_query_error() {
        let err: QueryError = ControlError {
            command: "docker compose kill materialized".to_string(),
            message: "exited with status 1".to_string(),
        }
        .into();
        assert_eq!(err.query, "docker compose kill materialized");
        assert!(!err.connection_lost);
    }
}
