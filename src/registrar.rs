//! Realm schema declarations and idempotent table creation
//!
//! Each realm declares one base table. The registrar derives the
//! `<realm>_custom` and `<realm>_change` companions from the key columns.

use crate::db::{execute, quote_ident, table_readable, Database};
use crate::error::{Error, Result};
use crate::provider::ClassProvider;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;

/// Storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Int64,
}

impl ColumnType {
    fn sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Int64 => "INTEGER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn text(name: &str) -> Self {
        Self {
            name: name.to_string(),
            column_type: ColumnType::Text,
        }
    }

    pub fn int64(name: &str) -> Self {
        Self {
            name: name.to_string(),
            column_type: ColumnType::Int64,
        }
    }
}

/// Timestamp columns every base table carries
pub const SYSTEM_COLUMNS: [&str; 2] = ["time", "changetime"];

/// Physical layout of one realm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealmSchema {
    pub realm: String,
    pub key: Vec<String>,
    pub columns: Vec<Column>,
    pub has_custom: bool,
    pub has_change: bool,
}

impl RealmSchema {
    /// Declare a realm. Key columns missing from `columns` are added as text;
    /// the `time`/`changetime` columns are added when not declared.
    pub fn declare(realm: &str, key: &[&str], columns: Vec<Column>, has_custom: bool, has_change: bool) -> Self {
        let mut all = columns;
        for k in key.iter().rev() {
            if !all.iter().any(|c| c.name == *k) {
                all.insert(0, Column::text(k));
            }
        }
        for system in SYSTEM_COLUMNS {
            if !all.iter().any(|c| c.name == system) {
                all.push(Column::int64(system));
            }
        }
        Self {
            realm: realm.to_string(),
            key: key.iter().map(|k| k.to_string()).collect(),
            columns: all,
            has_custom,
            has_change,
        }
    }

    pub fn custom_table(&self) -> String {
        format!("{}_custom", self.realm)
    }

    pub fn change_table(&self) -> String {
        format!("{}_change", self.realm)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    fn key_columns(&self) -> Vec<Column> {
        self.key
            .iter()
            .map(|k| {
                self.columns
                    .iter()
                    .find(|c| c.name == *k)
                    .cloned()
                    .unwrap_or_else(|| Column::text(k))
            })
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::Config(format!("realm '{}' declares no key columns", self.realm)));
        }
        Ok(())
    }

    pub fn base_ddl(&self) -> Vec<String> {
        vec![create_table(&self.realm, &self.columns, &self.key)]
    }

    pub fn custom_ddl(&self) -> Vec<String> {
        let mut columns = self.key_columns();
        columns.push(Column::text("name"));
        columns.push(Column::text("value"));
        let mut key = self.key.clone();
        key.push("name".to_string());
        vec![create_table(&self.custom_table(), &columns, &key)]
    }

    pub fn change_ddl(&self) -> Vec<String> {
        let mut columns = self.key_columns();
        columns.push(Column::int64("time"));
        columns.push(Column::text("author"));
        columns.push(Column::text("field"));
        columns.push(Column::text("oldvalue"));
        columns.push(Column::text("newvalue"));
        let mut key = self.key.clone();
        key.push("time".to_string());
        key.push("field".to_string());

        let table = self.change_table();
        let index_columns: Vec<String> = self.key.iter().map(|k| quote_ident(k)).collect();
        vec![
            create_table(&table, &columns, &key),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_ident(&format!("{}_{}_idx", table, self.key.join("_"))),
                quote_ident(&table),
                index_columns.join(", ")
            ),
        ]
    }
}

fn create_table(name: &str, columns: &[Column], key: &[String]) -> String {
    let mut defs: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.column_type.sql()))
        .collect();
    let key: Vec<String> = key.iter().map(|k| quote_ident(k)).collect();
    defs.push(format!("PRIMARY KEY ({})", key.join(", ")));
    format!("CREATE TABLE IF NOT EXISTS {} (\n    {}\n)", quote_ident(name), defs.join(",\n    "))
}

/// What [`SchemaRegistrar::ensure_schema`] created
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchemaReport {
    pub created_tables: Vec<String>,
}

impl SchemaReport {
    pub fn is_empty(&self) -> bool {
        self.created_tables.is_empty()
    }
}

/// Collects realm declarations and creates their tables
#[derive(Default)]
pub struct SchemaRegistrar {
    declarations: Vec<(RealmSchema, Option<Arc<dyn ClassProvider>>)>,
}

impl SchemaRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every schema of a provider; the provider seeds its realms
    pub fn declare_provider(&mut self, provider: &Arc<dyn ClassProvider>) {
        for schema in provider.schemas() {
            self.declarations.push((schema, Some(provider.clone())));
        }
    }

    pub fn declare(&mut self, schema: RealmSchema) {
        self.declarations.push((schema, None));
    }

    pub fn declarations(&self) -> impl Iterator<Item = &RealmSchema> {
        self.declarations.iter().map(|(s, _)| s)
    }

    pub fn schema(&self, realm: &str) -> Option<&RealmSchema> {
        self.declarations().find(|s| s.realm == realm)
    }

    /// Create whatever tables are missing. Detection is a trivial read per
    /// expected table; creation and seeding run in a single transaction.
    pub fn ensure_schema(&self, db: &Database) -> Result<SchemaReport> {
        for (schema, _) in &self.declarations {
            schema.validate()?;
        }

        let mut missing: Vec<(usize, Vec<&'static str>)> = Vec::new();
        {
            let mut conn = db.get_conn()?;
            for (i, (schema, _)) in self.declarations.iter().enumerate() {
                let mut parts = Vec::new();
                if !table_readable(&mut conn, &schema.realm) {
                    parts.push("base");
                }
                if schema.has_custom && !table_readable(&mut conn, &schema.custom_table()) {
                    parts.push("custom");
                }
                if schema.has_change && !table_readable(&mut conn, &schema.change_table()) {
                    parts.push("change");
                }
                if !parts.is_empty() {
                    tracing::info!("Need to create db tables for class '{}'", schema.realm);
                    missing.push((i, parts));
                }
            }
        }

        if missing.is_empty() {
            return Ok(SchemaReport::default());
        }

        let result = db.transaction(|conn| {
            let mut report = SchemaReport::default();
            for (i, parts) in &missing {
                let (schema, provider) = &self.declarations[*i];
                for part in parts {
                    let (table, statements) = match *part {
                        "base" => (schema.realm.clone(), schema.base_ddl()),
                        "custom" => (schema.custom_table(), schema.custom_ddl()),
                        _ => (schema.change_table(), schema.change_ddl()),
                    };
                    tracing::debug!("Creating table {}...", table);
                    run_all(conn, &statements)?;
                    report.created_tables.push(table);
                }
                if parts.contains(&"base") {
                    if let Some(provider) = provider {
                        provider.seed(&schema.realm, conn)?;
                    }
                }
            }
            Ok(report)
        });

        if let Err(e) = &result {
            tracing::error!("Exception during database creation: {}", e);
        }
        result
    }
}

fn run_all(conn: &mut SqliteConnection, statements: &[String]) -> Result<()> {
    for stmt in statements {
        tracing::debug!("{}", stmt);
        execute(conn, stmt, vec![])?;
    }
    Ok(())
}
