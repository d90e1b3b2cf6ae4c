//! Data and schema actions.
//!
//! Every action picks a random database, picks its target from the shared
//! object model, renders one statement, and records the effect in the model
//! only after the statement succeeded.

use super::database::{Column, Database, MAX_ROWS};
use crate::client::{quote_identifier, quote_literal, Executor};
use crate::error::{HarnessError, QueryError};
use crate::settings::Scenario;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Closed set of operations a worker can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Select,
    SelectOne,
    Fetch,
    Insert,
    CommitRollback,
    Update,
    Delete,
    Comment,
    InsertReturning,
    CreateTable,
    DropTable,
    RenameTable,
    CreateView,
    DropView,
    CreateRole,
    DropRole,
    Cancel,
    Kill,
    BackupRestore,
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Select => "SelectAction",
            ActionKind::SelectOne => "SelectOneAction",
            ActionKind::Fetch => "FetchAction",
            ActionKind::Insert => "InsertAction",
            ActionKind::CommitRollback => "CommitRollbackAction",
            ActionKind::Update => "UpdateAction",
            ActionKind::Delete => "DeleteAction",
            ActionKind::Comment => "CommentAction",
            ActionKind::InsertReturning => "InsertReturningAction",
            ActionKind::CreateTable => "CreateTableAction",
            ActionKind::DropTable => "DropTableAction",
            ActionKind::RenameTable => "RenameTableAction",
            ActionKind::CreateView => "CreateViewAction",
            ActionKind::DropView => "DropViewAction",
            ActionKind::CreateRole => "CreateRoleAction",
            ActionKind::DropRole => "DropRoleAction",
            ActionKind::Cancel => "CancelAction",
            ActionKind::Kill => "KillAction",
            ActionKind::BackupRestore => "BackupRestoreAction",
        }
    }

    /// Scenario actions need collaborators beyond the databases and are
    /// built by the orchestrator directly.
    pub fn is_scenario(&self) -> bool {
        matches!(
            self,
            ActionKind::Cancel | ActionKind::Kill | ActionKind::BackupRestore
        )
    }

    /// Registry entry point: build the action bound to its own stream.
    pub fn instantiate(
        self,
        env: &ActionEnv,
        rng: StdRng,
    ) -> Result<Box<dyn Action>, HarnessError> {
        if self.is_scenario() {
            return Err(HarnessError::Config(format!(
                "{} cannot be built from the action registry",
                self.name()
            )));
        }
        if env.databases.is_empty() {
            return Err(HarnessError::Config(
                "actions need at least one database".to_string(),
            ));
        }
        Ok(Box::new(DataAction {
            kind: self,
            rng,
            env: env.clone(),
        }))
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared inputs every data action is built from.
#[derive(Debug, Clone)]
pub struct ActionEnv {
    pub databases: Arc<[Arc<Database>]>,
    pub naughty: bool,
}

impl ActionEnv {
    pub fn new(databases: Vec<Arc<Database>>, naughty: bool) -> Self {
        Self {
            databases: databases.into(),
            naughty,
        }
    }
}

/// One executable operation.
pub trait Action: Send {
    fn kind(&self) -> ActionKind;

    /// Run once. `Ok(true)` when a statement was executed and counts as a
    /// query, `Ok(false)` when there was nothing to do.
    fn run(&mut self, exe: &mut dyn Executor) -> Result<bool, QueryError>;

    /// Message fragments marking an error as an accepted outcome. The
    /// matching fragment is the error kind reported at the end of the run.
    fn errors_to_ignore(&self, scenario: Scenario) -> Vec<&'static str> {
        common_ignored_errors(scenario)
    }
}

const CONNECTION_ERRORS: &[&str] = &[
    "error communicating with database",
    "server closed the connection unexpectedly",
    "terminating connection",
    "Connection refused",
    "connection closed",
    "Connection reset",
    "Broken pipe",
    "network error",
];

/// Errors every action accepts in `scenario`.
pub fn common_ignored_errors(scenario: Scenario) -> Vec<&'static str> {
    let mut errors = vec![
        "could not serialize access",
        "does not exist",
        "unknown catalog item",
        "unknown schema",
        "unknown database",
        "was concurrently dropped",
        "in the same timedomain",
    ];
    if scenario == Scenario::Cancel {
        errors.push("canceling statement due to user request");
    }
    if scenario.disrupts_connections() {
        errors.extend_from_slice(CONNECTION_ERRORS);
    }
    errors
}

/// A data or schema action, dispatched on its kind.
struct DataAction {
    kind: ActionKind,
    rng: StdRng,
    env: ActionEnv,
}

impl DataAction {
    fn database(&mut self) -> Arc<Database> {
        let index = self.rng.gen_range(0..self.env.databases.len());
        Arc::clone(&self.env.databases[index])
    }
}

impl Action for DataAction {
    fn kind(&self) -> ActionKind {
        self.kind
    }

    fn run(&mut self, exe: &mut dyn Executor) -> Result<bool, QueryError> {
        let db = self.database();
        let naughty = self.env.naughty;
        let rng = &mut self.rng;
        match self.kind {
            ActionKind::Select => select(&db, rng, exe),
            ActionKind::SelectOne => exe.execute("SELECT 1").map(|_| true),
            ActionKind::Fetch => fetch(&db, rng, exe),
            ActionKind::Insert => insert(&db, rng, exe, naughty, false),
            ActionKind::InsertReturning => insert(&db, rng, exe, naughty, true),
            ActionKind::CommitRollback => commit_rollback(rng, exe),
            ActionKind::Update => update(&db, rng, exe, naughty),
            ActionKind::Delete => delete(&db, rng, exe, naughty),
            ActionKind::Comment => comment(&db, rng, exe),
            ActionKind::CreateTable => create_table(&db, rng, exe),
            ActionKind::DropTable => drop_table(&db, rng, exe),
            ActionKind::RenameTable => rename_table(&db, rng, exe),
            ActionKind::CreateView => create_view(&db, rng, exe),
            ActionKind::DropView => drop_view(&db, rng, exe),
            ActionKind::CreateRole => create_role(&db, rng, exe),
            ActionKind::DropRole => drop_role(&db, rng, exe),
            ActionKind::Cancel | ActionKind::Kill | ActionKind::BackupRestore => Ok(false),
        }
    }

    fn errors_to_ignore(&self, scenario: Scenario) -> Vec<&'static str> {
        let mut errors = common_ignored_errors(scenario);
        match self.kind {
            ActionKind::Select | ActionKind::SelectOne => {
                errors.push("transaction in write-only mode");
            }
            ActionKind::Fetch => {
                errors.extend_from_slice(&["already exists", "transaction in write-only mode"]);
            }
            ActionKind::Insert | ActionKind::InsertReturning | ActionKind::Update => {
                errors.extend_from_slice(&[
                    "transaction in read-only mode",
                    "transaction in write-only mode",
                    "out of range",
                ]);
            }
            ActionKind::CreateTable
            | ActionKind::CreateView
            | ActionKind::CreateRole
            | ActionKind::RenameTable => {
                errors.extend_from_slice(&["already exists", "would violate", "exceeds"]);
            }
            ActionKind::DropTable | ActionKind::DropView | ActionKind::DropRole => {
                errors.push("depend on it");
            }
            _ => {}
        }
        errors
    }
}

fn column_list(columns: &[Column]) -> String {
    columns
        .iter()
        .map(Column::quoted)
        .collect::<Vec<_>>()
        .join(", ")
}

fn select(db: &Database, rng: &mut StdRng, exe: &mut dyn Executor) -> Result<bool, QueryError> {
    let Some(relation) = db.random_relation(rng) else {
        return Ok(false);
    };
    let columns = relation.columns();
    let projection = if rng.gen_bool(0.5) {
        "*".to_string()
    } else {
        let count = rng.gen_range(1..=columns.len());
        let picked: Vec<Column> = columns.choose_multiple(rng, count).cloned().collect();
        column_list(&picked)
    };

    let mut sql = format!("SELECT {projection} FROM {}", db.qualified(relation.name()));
    if let Some(column) = columns.choose(rng).filter(|_| rng.gen_bool(0.3)) {
        sql.push_str(&format!(" WHERE {} IS NOT NULL", column.quoted()));
    }
    if rng.gen_bool(0.5) {
        sql.push_str(&format!(" LIMIT {}", rng.gen_range(1..=MAX_ROWS)));
    }
    exe.execute(&sql)?;
    Ok(true)
}

fn fetch(db: &Database, rng: &mut StdRng, exe: &mut dyn Executor) -> Result<bool, QueryError> {
    let Some(relation) = db.random_relation(rng) else {
        return Ok(false);
    };
    exe.execute(&format!(
        "DECLARE c CURSOR FOR SELECT * FROM {}",
        db.qualified(relation.name())
    ))?;
    for _ in 0..rng.gen_range(1..=3) {
        exe.execute(&format!("FETCH {} c", rng.gen_range(1..=MAX_ROWS)))?;
    }
    exe.commit()?;
    Ok(true)
}

fn insert(
    db: &Database,
    rng: &mut StdRng,
    exe: &mut dyn Executor,
    naughty: bool,
    returning: bool,
) -> Result<bool, QueryError> {
    let Some(table) = db.random_table(rng) else {
        return Ok(false);
    };
    let rows: Vec<String> = (0..rng.gen_range(1..=MAX_ROWS / 10))
        .map(|_| {
            let values: Vec<String> = table
                .columns
                .iter()
                .map(|c| c.data_type.random_value(rng, naughty))
                .collect();
            format!("({})", values.join(", "))
        })
        .collect();

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        db.qualified(&table.name),
        column_list(&table.columns),
        rows.join(", ")
    );
    if returning {
        sql.push_str(" RETURNING *");
    }
    exe.execute(&sql)?;
    Ok(true)
}

/// Counts only when a transaction was actually open.
fn commit_rollback(rng: &mut StdRng, exe: &mut dyn Executor) -> Result<bool, QueryError> {
    if rng.gen_bool(0.7) {
        exe.commit()
    } else {
        exe.rollback()
    }
}

fn update(
    db: &Database,
    rng: &mut StdRng,
    exe: &mut dyn Executor,
    naughty: bool,
) -> Result<bool, QueryError> {
    let Some(table) = db.random_table(rng) else {
        return Ok(false);
    };
    let Some(target) = table.columns.choose(rng) else {
        return Ok(false);
    };
    let mut sql = format!(
        "UPDATE {} SET {} = {}",
        db.qualified(&table.name),
        target.quoted(),
        target.data_type.random_value(rng, naughty)
    );
    if let Some(filter) = table.columns.choose(rng).filter(|_| rng.gen_bool(0.8)) {
        sql.push_str(&format!(
            " WHERE {} = {}",
            filter.quoted(),
            filter.data_type.random_value(rng, naughty)
        ));
    }
    exe.execute(&sql)?;
    Ok(true)
}

fn delete(
    db: &Database,
    rng: &mut StdRng,
    exe: &mut dyn Executor,
    naughty: bool,
) -> Result<bool, QueryError> {
    let Some(table) = db.random_table(rng) else {
        return Ok(false);
    };
    let mut sql = format!("DELETE FROM {}", db.qualified(&table.name));
    if let Some(filter) = table.columns.choose(rng).filter(|_| rng.gen_bool(0.9)) {
        sql.push_str(&format!(
            " WHERE {} = {}",
            filter.quoted(),
            filter.data_type.random_value(rng, naughty)
        ));
    }
    exe.execute(&sql)?;
    Ok(true)
}

fn comment(db: &Database, rng: &mut StdRng, exe: &mut dyn Executor) -> Result<bool, QueryError> {
    let Some(table) = db.random_table(rng) else {
        return Ok(false);
    };
    let text = format!("comment {}", rng.gen_range(0..10_000u32));
    exe.execute(&format!(
        "COMMENT ON TABLE {} IS {}",
        db.qualified(&table.name),
        quote_literal(&text)
    ))?;
    Ok(true)
}

fn create_table(
    db: &Database,
    rng: &mut StdRng,
    exe: &mut dyn Executor,
) -> Result<bool, QueryError> {
    let Some(table) = db.plan_new_table(rng) else {
        return Ok(false);
    };
    exe.execute(&db.create_table_sql(&table))?;
    db.add_table(table);
    Ok(true)
}

fn drop_table(db: &Database, rng: &mut StdRng, exe: &mut dyn Executor) -> Result<bool, QueryError> {
    // Keep one table around so reads and writes have a target.
    if db.table_count() <= 1 {
        return Ok(false);
    }
    let Some(table) = db.random_table(rng) else {
        return Ok(false);
    };
    exe.execute(&format!("DROP TABLE {} CASCADE", db.qualified(&table.name)))?;
    db.remove_table(table.id);
    Ok(true)
}

fn rename_table(
    db: &Database,
    rng: &mut StdRng,
    exe: &mut dyn Executor,
) -> Result<bool, QueryError> {
    let Some(table) = db.random_table(rng) else {
        return Ok(false);
    };
    let new_name = db.plan_rename(&table, rng);
    exe.execute(&format!(
        "ALTER TABLE {} RENAME TO {}",
        db.qualified(&table.name),
        quote_identifier(&new_name)
    ))?;
    db.rename_table(table.id, new_name);
    Ok(true)
}

fn create_view(db: &Database, rng: &mut StdRng, exe: &mut dyn Executor) -> Result<bool, QueryError> {
    let Some(base) = db.random_table(rng) else {
        return Ok(false);
    };
    let Some(view) = db.plan_new_view(&base, rng) else {
        return Ok(false);
    };
    exe.execute(&db.create_view_sql(&view, &base))?;
    db.add_view(view);
    Ok(true)
}

fn drop_view(db: &Database, rng: &mut StdRng, exe: &mut dyn Executor) -> Result<bool, QueryError> {
    let Some(view) = db.random_view(rng) else {
        return Ok(false);
    };
    exe.execute(&format!("DROP VIEW {}", db.qualified(&view.name)))?;
    db.remove_view(view.id);
    Ok(true)
}

fn create_role(db: &Database, rng: &mut StdRng, exe: &mut dyn Executor) -> Result<bool, QueryError> {
    let Some(role) = db.plan_new_role(rng) else {
        return Ok(false);
    };
    exe.execute(&format!("CREATE ROLE {}", quote_identifier(&role)))?;
    db.add_role(role);
    Ok(true)
}

fn drop_role(db: &Database, rng: &mut StdRng, exe: &mut dyn Executor) -> Result<bool, QueryError> {
    let Some(role) = db.random_role(rng) else {
        return Ok(false);
    };
    exe.execute(&format!("DROP ROLE {}", quote_identifier(&role)))?;
    db.remove_role(&role);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    /// Opens a transaction on the first statement unless autocommit is set.
    #[derive(Default)]
    struct Recorder {
        statements: Vec<String>,
        autocommit: bool,
        in_transaction: bool,
    }

    impl Recorder {
        fn end(&mut self, statement: &str) -> bool {
            if !std::mem::take(&mut self.in_transaction) {
                return false;
            }
            self.statements.push(statement.to_string());
            true
        }
    }

    impl Executor for Recorder {
        fn execute(&mut self, sql: &str) -> Result<(), QueryError> {
            self.in_transaction |= !self.autocommit;
            self.statements.push(sql.to_string());
            Ok(())
        }
        fn commit(&mut self) -> Result<bool, QueryError> {
            Ok(self.end("COMMIT"))
        }
        fn rollback(&mut self) -> Result<bool, QueryError> {
            Ok(self.end("ROLLBACK"))
        }
        fn set_autocommit(&mut self, autocommit: bool) {
            self.autocommit = autocommit;
        }
        fn autocommit(&self) -> bool {
            self.autocommit
        }
        fn connection_id(&self) -> Option<i64> {
            Some(1)
        }
    }

    fn env(seed: u64) -> ActionEnv {
        let mut rng = StdRng::seed_from_u64(seed);
        let dbs = (0..2)
            .map(|i| Arc::new(Database::new(i, seed, &mut rng, false)))
            .collect();
        ActionEnv::new(dbs, false)
    }

    #[test]
    fn scenario_kinds_are_not_in_the_registry() {
        let env = env(1);
        for kind in [ActionKind::Cancel, ActionKind::Kill, ActionKind::BackupRestore] {
            assert!(kind.instantiate(&env, StdRng::seed_from_u64(0)).is_err());
        }
    }

    #[test]
    fn select_reads_from_a_known_relation() {
        let env = env(2);
        let mut action = ActionKind::Select
            .instantiate(&env, StdRng::seed_from_u64(3))
            .unwrap();
        let mut exe = Recorder::default();
        assert!(action.run(&mut exe).unwrap());
        assert_eq!(exe.statements.len(), 1);
        assert!(exe.statements[0].starts_with("SELECT "));
        assert!(exe.statements[0].contains("\"db-pw-2-"));
    }

    #[test]
    fn fetch_declares_fetches_and_commits() {
        let env = env(4);
        let mut action = ActionKind::Fetch
            .instantiate(&env, StdRng::seed_from_u64(5))
            .unwrap();
        let mut exe = Recorder::default();
        assert!(action.run(&mut exe).unwrap());
        assert!(exe.statements[0].starts_with("DECLARE c CURSOR FOR SELECT"));
        assert!(exe.statements[1].starts_with("FETCH "));
        assert_eq!(exe.statements.last().map(String::as_str), Some("COMMIT"));
    }

    #[test]
    fn create_then_drop_table_updates_model() {
        let env = env(6);
        let db = Arc::clone(&env.databases[0]);
        let mut rng = StdRng::seed_from_u64(8);
        let mut exe = Recorder::default();

        let before = db.table_count();
        assert!(create_table(&db, &mut rng, &mut exe).unwrap());
        assert_eq!(db.table_count(), before + 1);
        assert!(exe.statements[0].starts_with("CREATE TABLE"));

        assert!(drop_table(&db, &mut rng, &mut exe).unwrap());
        assert_eq!(db.table_count(), before);
        assert!(exe.statements[1].starts_with("DROP TABLE"));
    }

    #[test]
    fn failed_statement_leaves_model_untouched() {
        struct Failing;
        impl Executor for Failing {
            fn execute(&mut self, sql: &str) -> Result<(), QueryError> {
                Err(QueryError::new(sql, "already exists"))
            }
            fn commit(&mut self) -> Result<bool, QueryError> {
                Ok(false)
            }
            fn rollback(&mut self) -> Result<bool, QueryError> {
                Ok(false)
            }
            fn set_autocommit(&mut self, _: bool) {}
            fn autocommit(&self) -> bool {
                true
            }
            fn connection_id(&self) -> Option<i64> {
                None
            }
        }

        let env = env(7);
        let db = Arc::clone(&env.databases[0]);
        let before = db.table_count();
        let err = create_table(&db, &mut StdRng::seed_from_u64(1), &mut Failing).unwrap_err();
        assert!(err.message.contains("already exists"));
        assert_eq!(db.table_count(), before);
    }

    #[test]
    fn cancel_errors_only_ignored_in_cancel_scenario() {
        let cancel = "canceling statement due to user request";
        assert!(common_ignored_errors(Scenario::Cancel).contains(&cancel));
        assert!(!common_ignored_errors(Scenario::Regression).contains(&cancel));
        assert!(common_ignored_errors(Scenario::Kill).contains(&"Connection refused"));
    }

    #[test]
    fn commit_rollback_without_open_transaction_is_not_counted() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut exe = Recorder {
            autocommit: true,
            ..Recorder::default()
        };
        exe.execute("SELECT 1").unwrap();
        assert!(!commit_rollback(&mut rng, &mut exe).unwrap());
        assert_eq!(exe.statements, vec!["SELECT 1"]);

        exe.autocommit = false;
        exe.execute("SELECT 2").unwrap();
        assert!(commit_rollback(&mut rng, &mut exe).unwrap());
        assert!(matches!(
            exe.statements.last().map(String::as_str),
            Some("COMMIT" | "ROLLBACK")
        ));
    }

    #[test]
    fn transactional_categories_end_their_transactions() {
        use rand::distributions::{Distribution, WeightedIndex};

        for category in super::super::CATEGORIES.iter().filter(|c| !c.autocommit) {
            let env = env(10);
            let mut rng = StdRng::seed_from_u64(11);
            let mut actions = category.instantiate(&env, &mut rng).unwrap();
            let index = WeightedIndex::new(category.weights.iter().copied()).unwrap();
            let mut exe = Recorder::default();
            for _ in 0..2_000 {
                let action = &mut actions[index.sample(&mut rng)];
                action.run(&mut exe).unwrap();
            }
            let ended = exe
                .statements
                .iter()
                .filter(|s| *s == "COMMIT" || *s == "ROLLBACK")
                .count();
            assert!(ended > 0, "{} never ends its transaction", category.name);
        }
    }
}
