use crate::error::{HarnessError, QueryError};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod postgres;

pub use postgres::{PgConnector, PgExecutor};

/// One endpoint/user pair sessions are opened against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

/// Regular sessions for the workload, a privileged one for system settings
/// and cross-session operations such as cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTargets {
    pub regular: ConnectTarget,
    pub system: ConnectTarget,
}

impl ConnectionTargets {
    pub fn for_privilege(&self, system: bool) -> &ConnectTarget {
        if system {
            &self.system
        } else {
            &self.regular
        }
    }
}

/// One live session on the database under test.
///
/// Statements run strictly in order on the owning thread. Without
/// autocommit the executor opens a transaction before the first statement
/// and keeps it open until `commit` or `rollback`.
pub trait Executor: Send {
    fn execute(&mut self, sql: &str) -> Result<(), QueryError>;

    /// `false` when no transaction was open and nothing was sent.
    fn commit(&mut self) -> Result<bool, QueryError>;

    /// `false` when no transaction was open and nothing was sent.
    fn rollback(&mut self) -> Result<bool, QueryError>;

    fn set_autocommit(&mut self, autocommit: bool);

    fn autocommit(&self) -> bool;

    /// Server-side id of the session, usable with `pg_cancel_backend`.
    fn connection_id(&self) -> Option<i64>;
}

/// Opens sessions. Shared by every worker thread.
pub trait Connector: Send + Sync {
    fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn Executor>, HarnessError>;
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted_and_escaped() {
        assert_eq!(quote_identifier("t1"), "\"t1\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn literals_are_quoted_and_escaped() {
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn privilege_selects_target() {
        let regular = ConnectTarget {
            host: "localhost".into(),
            port: 6875,
            user: "materialize".into(),
            password: None,
            database: "materialize".into(),
        };
        let system = ConnectTarget {
            port: 6877,
            user: "mz_system".into(),
            ..regular.clone()
        };
        let targets = ConnectionTargets { regular, system };
        assert_eq!(targets.for_privilege(true).port, 6877);
        assert_eq!(targets.for_privilege(false).port, 6875);
        assert_eq!(
            targets.for_privilege(false).to_string(),
            "materialize@localhost:6875/materialize"
        );
    }
}
