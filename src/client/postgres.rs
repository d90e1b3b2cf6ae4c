//! sqlx-backed sessions for the pg-wire database under test.
//!
//! Workers are plain OS threads, so every call is driven to completion on
//! the shared tokio runtime through its [`Handle`].

use super::{ConnectTarget, Connector, Executor};
use crate::error::{HarnessError, QueryError};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use std::future::Future;
use tokio::runtime::Handle;
use tracing::{debug, warn};

pub fn block_on_runtime<F, T>(rt: &Handle, f: F) -> T
where
    F: Future<Output = T>,
{
    match Handle::try_current() {
        Ok(_) => tokio::task::block_in_place(|| rt.block_on(f)),
        Err(_) => rt.block_on(f),
    }
}

fn connect_options(target: &ConnectTarget) -> PgConnectOptions {
    let mut options = PgConnectOptions::new()
        .host(&target.host)
        .port(target.port)
        .username(&target.user)
        .database(&target.database)
        .application_name("parallel-workload");
    if let Some(password) = &target.password {
        options = options.password(password);
    }
    options
}

async fn open_session(options: &PgConnectOptions) -> Result<(PgConnection, Option<i64>), sqlx::Error> {
    let mut conn = PgConnection::connect_with(options).await?;
    let pid = sqlx::query_scalar::<_, i32>("SELECT pg_backend_pid()")
        .fetch_one(&mut conn)
        .await
        .ok()
        .map(i64::from);
    Ok((conn, pid))
}

/// Opens [`PgExecutor`] sessions on a shared runtime.
#[derive(Debug, Clone)]
pub struct PgConnector {
    rt: Handle,
}

impl PgConnector {
    pub fn new(rt: Handle) -> Self {
        Self { rt }
    }
}

impl Connector for PgConnector {
    fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn Executor>, HarnessError> {
        let options = connect_options(target);
        let (conn, connection_id) = block_on_runtime(&self.rt, open_session(&options))
            .map_err(|e| HarnessError::Connect {
                target: target.to_string(),
                message: e.to_string(),
            })?;
        debug!(target = %target, ?connection_id, "session opened");

        Ok(Box::new(PgExecutor {
            rt: self.rt.clone(),
            options,
            conn: Some(conn),
            connection_id,
            autocommit: true,
            in_transaction: false,
        }))
    }
}

/// One pg-wire session.
///
/// After a connection-level failure the session is discarded and reopened
/// lazily by the next `execute`; callers never reconnect themselves.
pub struct PgExecutor {
    rt: Handle,
    options: PgConnectOptions,
    conn: Option<PgConnection>,
    connection_id: Option<i64>,
    autocommit: bool,
    in_transaction: bool,
}

impl PgExecutor {
    fn ensure_connected(&mut self, sql: &str) -> Result<(), QueryError> {
        if self.conn.is_some() {
            return Ok(());
        }
        match block_on_runtime(&self.rt, open_session(&self.options)) {
            Ok((conn, pid)) => {
                debug!(connection_id = ?pid, "session reopened");
                self.conn = Some(conn);
                self.connection_id = pid;
                Ok(())
            }
            Err(e) => Err(QueryError::connection_lost(sql, e.to_string())),
        }
    }

    fn run_raw(&mut self, sql: &str) -> Result<(), QueryError> {
        self.ensure_connected(sql)?;
        let Some(conn) = self.conn.as_mut() else {
            return Err(QueryError::connection_lost(sql, "no session"));
        };
        match block_on_runtime(&self.rt, sqlx::raw_sql(sql).execute(&mut *conn)) {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) => Err(QueryError::new(sql, db.message())),
            Err(e) => {
                warn!(error = %e, "session lost");
                self.conn = None;
                self.connection_id = None;
                self.in_transaction = false;
                Err(QueryError::connection_lost(sql, e.to_string()))
            }
        }
    }

    fn end_transaction(&mut self, statement: &str) -> Result<bool, QueryError> {
        if !self.in_transaction {
            return Ok(false);
        }
        self.in_transaction = false;
        self.run_raw(statement)?;
        Ok(true)
    }
}

impl Executor for PgExecutor {
    fn execute(&mut self, sql: &str) -> Result<(), QueryError> {
        if !self.autocommit && !self.in_transaction {
            self.run_raw("BEGIN")?;
            self.in_transaction = true;
        }
        self.run_raw(sql)
    }

    fn commit(&mut self) -> Result<bool, QueryError> {
        self.end_transaction("COMMIT")
    }

    fn rollback(&mut self) -> Result<bool, QueryError> {
        self.end_transaction("ROLLBACK")
    }

    fn set_autocommit(&mut self, autocommit: bool) {
        self.autocommit = autocommit;
    }

    fn autocommit(&self) -> bool {
        self.autocommit
    }

    fn connection_id(&self) -> Option<i64> {
        self.connection_id
    }
}
