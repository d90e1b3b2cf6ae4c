//! Object model of one database under test.
//!
//! Workers race each other on the same objects, so the model is only a
//! best guess of what exists server-side: actions pick targets from it,
//! run their statement, and record the effect only when it succeeded.

use crate::client::{quote_identifier, quote_literal, Executor};
use crate::error::QueryError;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_COLUMNS: usize = 5;
pub const MAX_ROWS: usize = 50;
pub const MAX_CLUSTERS: usize = 4;
pub const MAX_CLUSTER_REPLICAS: usize = 2;
pub const MAX_SCHEMAS: usize = 5;
pub const MAX_TABLES: usize = 5;
pub const MAX_VIEWS: usize = 15;
pub const MAX_ROLES: usize = 15;
pub const MAX_WEBHOOK_SOURCES: usize = 5;
pub const MAX_KAFKA_SOURCES: usize = 5;
pub const MAX_POSTGRES_SOURCES: usize = 5;
pub const MAX_KAFKA_SINKS: usize = 5;

/// Appended to identifiers when naughty identifiers are enabled.
const NAUGHTY_STRINGS: &[&str] = &[
    "'",
    "\"",
    "\\",
    "''; DROP TABLE x; --",
    "NULL",
    "undefined",
    " ",
    "\t",
    "%s%s%s",
    "$1",
    "ñ",
    "ÅÍÎÏ",
    "∑∂ƒ",
    "🙂",
    "<script>alert(1)</script>",
    "0xffffffff",
    "-1e309",
    "表ポあA鷗",
];

/// Give `name` a hostile suffix when `naughty` is set.
pub fn naughtify(name: &str, naughty: bool, rng: &mut StdRng) -> String {
    if !naughty {
        return name.to_string();
    }
    let suffix = NAUGHTY_STRINGS.choose(rng).copied().unwrap_or("");
    format!("{name}{suffix}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int,
    BigInt,
    Double,
    Boolean,
    Text,
}

impl DataType {
    const ALL: [DataType; 5] = [
        DataType::Int,
        DataType::BigInt,
        DataType::Double,
        DataType::Boolean,
        DataType::Text,
    ];

    pub fn random(rng: &mut StdRng) -> Self {
        Self::ALL[rng.gen_range(0..Self::ALL.len())]
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            DataType::Int => "int",
            DataType::BigInt => "bigint",
            DataType::Double => "double precision",
            DataType::Boolean => "boolean",
            DataType::Text => "text",
        }
    }

    /// A literal of this type, occasionally NULL.
    pub fn random_value(&self, rng: &mut StdRng, naughty: bool) -> String {
        if rng.gen_ratio(1, 20) {
            return "NULL".to_string();
        }
        match self {
            DataType::Int => rng.gen_range(-1_000..1_000i32).to_string(),
            DataType::BigInt => rng.gen_range(-1_000_000..1_000_000i64).to_string(),
            DataType::Double => format!("{:.3}", rng.gen_range(-1_000.0..1_000.0f64)),
            DataType::Boolean => rng.gen_bool(0.5).to_string(),
            DataType::Text => {
                let base = format!("v{}", rng.gen_range(0..10_000u32));
                quote_literal(&naughtify(&base, naughty, rng))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
}

impl Column {
    pub fn quoted(&self) -> String {
        quote_identifier(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub id: u64,
    pub name: String,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub id: u64,
    pub name: String,
    pub base_table: u64,
    pub columns: Vec<Column>,
}

/// Something a query can read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    Table(Table),
    View(View),
}

impl Relation {
    pub fn name(&self) -> &str {
        match self {
            Relation::Table(t) => &t.name,
            Relation::View(v) => &v.name,
        }
    }

    pub fn columns(&self) -> &[Column] {
        match self {
            Relation::Table(t) => &t.columns,
            Relation::View(v) => &v.columns,
        }
    }
}

#[derive(Debug, Default)]
struct Objects {
    tables: Vec<Table>,
    views: Vec<View>,
    roles: Vec<String>,
    next_id: u64,
}

impl Objects {
    fn reserve_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// One schema namespace under test.
#[derive(Debug)]
pub struct Database {
    index: usize,
    name: String,
    naughty: bool,
    objects: Mutex<Objects>,
}

impl Database {
    /// Plan a database and its initial tables from `rng`.
    pub fn new(index: usize, seed: u64, rng: &mut StdRng, naughty: bool) -> Self {
        let name = naughtify(&format!("db-pw-{seed}-{index}"), naughty, rng);
        let mut objects = Objects::default();
        let initial_tables = rng.gen_range(1..=MAX_TABLES / 2 + 1);
        for _ in 0..initial_tables {
            let id = objects.reserve_id();
            let table = plan_table(id, rng, naughty);
            objects.tables.push(table);
        }
        let planned: Vec<(u64, Vec<Column>)> = objects
            .tables
            .iter()
            .map(|t| (t.id, t.columns.clone()))
            .collect();
        for (base_table, columns) in planned {
            let id = objects.reserve_id();
            objects.views.push(View {
                id,
                name: naughtify(&format!("v-{id}"), naughty, rng),
                base_table,
                columns,
            });
        }

        Self {
            index,
            name,
            naughty,
            objects: Mutex::new(objects),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `"db"."public"."object"`
    pub fn qualified(&self, object: &str) -> String {
        format!(
            "{}.{}.{}",
            quote_identifier(&self.name),
            quote_identifier("public"),
            quote_identifier(object)
        )
    }

    pub fn create(&self, exe: &mut dyn Executor) -> Result<(), QueryError> {
        exe.execute(&format!(
            "DROP DATABASE IF EXISTS {} CASCADE",
            quote_identifier(&self.name)
        ))?;
        exe.execute(&format!("CREATE DATABASE {}", quote_identifier(&self.name)))?;
        Ok(())
    }

    pub fn create_relations(&self, exe: &mut dyn Executor) -> Result<(), QueryError> {
        let (tables, views) = {
            let objects = self.objects.lock();
            (objects.tables.clone(), objects.views.clone())
        };
        for table in &tables {
            exe.execute(&self.create_table_sql(table))?;
        }
        for view in &views {
            if let Some(base) = tables.iter().find(|t| t.id == view.base_table) {
                exe.execute(&self.create_view_sql(view, base))?;
            }
        }
        Ok(())
    }

    pub fn drop_database(&self, exe: &mut dyn Executor) -> Result<(), QueryError> {
        exe.execute(&format!(
            "DROP DATABASE IF EXISTS {} CASCADE",
            quote_identifier(&self.name)
        ))?;
        let roles = std::mem::take(&mut self.objects.lock().roles);
        for role in roles {
            exe.execute(&format!("DROP ROLE IF EXISTS {}", quote_identifier(&role)))?;
        }
        Ok(())
    }

    pub fn create_table_sql(&self, table: &Table) -> String {
        let columns: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("{} {}", c.quoted(), c.data_type.sql_name()))
            .collect();
        format!(
            "CREATE TABLE {} ({})",
            self.qualified(&table.name),
            columns.join(", ")
        )
    }

    pub fn create_view_sql(&self, view: &View, base: &Table) -> String {
        let columns: Vec<String> = view.columns.iter().map(Column::quoted).collect();
        format!(
            "CREATE VIEW {} AS SELECT {} FROM {}",
            self.qualified(&view.name),
            columns.join(", "),
            self.qualified(&base.name)
        )
    }

    // ---- model queries and updates used by actions ----

    pub fn random_table(&self, rng: &mut StdRng) -> Option<Table> {
        self.objects.lock().tables.choose(rng).cloned()
    }

    pub fn random_view(&self, rng: &mut StdRng) -> Option<View> {
        self.objects.lock().views.choose(rng).cloned()
    }

    pub fn random_relation(&self, rng: &mut StdRng) -> Option<Relation> {
        let objects = self.objects.lock();
        let total = objects.tables.len() + objects.views.len();
        if total == 0 {
            return None;
        }
        let pick = rng.gen_range(0..total);
        if pick < objects.tables.len() {
            Some(Relation::Table(objects.tables[pick].clone()))
        } else {
            Some(Relation::View(objects.views[pick - objects.tables.len()].clone()))
        }
    }

    pub fn random_role(&self, rng: &mut StdRng) -> Option<String> {
        self.objects.lock().roles.choose(rng).cloned()
    }

    /// Plan a new table, or `None` at capacity.
    pub fn plan_new_table(&self, rng: &mut StdRng) -> Option<Table> {
        let mut objects = self.objects.lock();
        if objects.tables.len() >= MAX_TABLES {
            return None;
        }
        let id = objects.reserve_id();
        drop(objects);
        Some(plan_table(id, rng, self.naughty))
    }

    /// Plan a view over `base`, or `None` at capacity.
    pub fn plan_new_view(&self, base: &Table, rng: &mut StdRng) -> Option<View> {
        let mut objects = self.objects.lock();
        if objects.views.len() >= MAX_VIEWS {
            return None;
        }
        let id = objects.reserve_id();
        drop(objects);
        let mut columns: Vec<Column> = base
            .columns
            .iter()
            .filter(|_| rng.gen_bool(0.7))
            .cloned()
            .collect();
        if columns.is_empty() {
            columns.push(base.columns[0].clone());
        }
        Some(View {
            id,
            name: naughtify(&format!("v-{id}"), self.naughty, rng),
            base_table: base.id,
            columns,
        })
    }

    /// Plan a new role name, or `None` at capacity.
    pub fn plan_new_role(&self, rng: &mut StdRng) -> Option<String> {
        let mut objects = self.objects.lock();
        if objects.roles.len() >= MAX_ROLES {
            return None;
        }
        let id = objects.reserve_id();
        drop(objects);
        Some(naughtify(
            &format!("role-pw-{}-{id}", self.index),
            self.naughty,
            rng,
        ))
    }

    pub fn plan_rename(&self, table: &Table, rng: &mut StdRng) -> String {
        let id = self.objects.lock().reserve_id();
        naughtify(&format!("t-{}-{id}", table.id), self.naughty, rng)
    }

    pub fn add_table(&self, table: Table) {
        self.objects.lock().tables.push(table);
    }

    /// Forget a dropped table and the views built on it.
    pub fn remove_table(&self, id: u64) {
        let mut objects = self.objects.lock();
        objects.tables.retain(|t| t.id != id);
        objects.views.retain(|v| v.base_table != id);
    }

    pub fn rename_table(&self, id: u64, new_name: String) {
        if let Some(table) = self.objects.lock().tables.iter_mut().find(|t| t.id == id) {
            table.name = new_name;
        }
    }

    pub fn add_view(&self, view: View) {
        let mut objects = self.objects.lock();
        // The base table may have been dropped while the view was created.
        if objects.tables.iter().any(|t| t.id == view.base_table) {
            objects.views.push(view);
        }
    }

    pub fn remove_view(&self, id: u64) {
        self.objects.lock().views.retain(|v| v.id != id);
    }

    pub fn add_role(&self, role: String) {
        self.objects.lock().roles.push(role);
    }

    pub fn remove_role(&self, role: &str) {
        self.objects.lock().roles.retain(|r| r != role);
    }

    pub fn table_count(&self) -> usize {
        self.objects.lock().tables.len()
    }

    pub fn view_count(&self) -> usize {
        self.objects.lock().views.len()
    }
}

impl fmt::Display for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn plan_table(id: u64, rng: &mut StdRng, naughty: bool) -> Table {
    let column_count = rng.gen_range(1..=MAX_COLUMNS);
    let columns = (0..column_count)
        .map(|i| Column {
            name: naughtify(&format!("c-{i}"), naughty, rng),
            data_type: DataType::random(rng),
        })
        .collect();
    Table {
        id,
        name: naughtify(&format!("t-{id}"), naughty, rng),
        columns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn planning_is_deterministic_per_seed() {
        let a = Database::new(0, 42, &mut StdRng::seed_from_u64(7), false);
        let b = Database::new(0, 42, &mut StdRng::seed_from_u64(7), false);
        assert_eq!(a.name(), "db-pw-42-0");
        assert_eq!(a.name(), b.name());
        assert_eq!(a.table_count(), b.table_count());
        let table_a = a.random_table(&mut StdRng::seed_from_u64(1)).unwrap();
        let table_b = b.random_table(&mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(a.create_table_sql(&table_a), b.create_table_sql(&table_b));
    }

    #[test]
    fn initial_plan_respects_capacity() {
        let mut rng = StdRng::seed_from_u64(3);
        for index in 0..20 {
            let db = Database::new(index, 1, &mut rng, false);
            assert!(db.table_count() >= 1 && db.table_count() <= MAX_TABLES);
            assert_eq!(db.view_count(), db.table_count());
        }
    }

    #[test]
    fn new_tables_stop_at_capacity() {
        let mut rng = StdRng::seed_from_u64(11);
        let db = Database::new(0, 1, &mut rng, false);
        while let Some(table) = db.plan_new_table(&mut rng) {
            db.add_table(table);
        }
        assert_eq!(db.table_count(), MAX_TABLES);
    }

    #[test]
    fn removing_a_table_forgets_its_views() {
        let mut rng = StdRng::seed_from_u64(5);
        let db = Database::new(0, 1, &mut rng, false);
        let table = db.random_table(&mut rng).unwrap();
        let views_before = db.view_count();
        db.remove_table(table.id);
        assert_eq!(db.view_count(), views_before - 1);
    }

    #[test]
    fn qualified_names_are_quoted() {
        let mut rng = StdRng::seed_from_u64(5);
        let db = Database::new(1, 9, &mut rng, false);
        assert_eq!(db.qualified("t-1"), "\"db-pw-9-1\".\"public\".\"t-1\"");
    }

    #[test]
    fn naughty_names_stay_quotable() {
        let mut rng = StdRng::seed_from_u64(5);
        let db = Database::new(0, 9, &mut rng, true);
        assert!(db.name().starts_with("db-pw-9-0"));
        let table = db.random_table(&mut rng).unwrap();
        let sql = db.create_table_sql(&table);
        assert!(sql.starts_with("CREATE TABLE \""));
    }
}
