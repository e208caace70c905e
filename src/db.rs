//! SQLite database with Diesel ORM
//!
//! Realm tables are declared at runtime, so most statements here are built
//! as text and bound value by value through a boxed `sql_query`. Rows of
//! unknown shape are read back as a single `json_object(...)` column.

use crate::error::{Error, Result};
use crate::value::{to_timestamp, FieldValue};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sql_types::{BigInt, Nullable, Text};
use diesel::sqlite::{Sqlite, SqliteConnection};
use std::path::Path;

/// Walk up directory tree to find .testman folder (like git finds .git)
/// Can be overridden with TESTMAN_DB_PATH env var
fn get_db_path() -> std::path::PathBuf {
    // Check env var first - always takes priority
    if let Ok(path) = std::env::var("TESTMAN_DB_PATH") {
        return std::path::PathBuf::from(path);
    }

    if let Ok(current_dir) = std::env::current_dir() {
        let mut dir = current_dir.as_path();
        loop {
            let testman_dir = dir.join(".testman");
            if testman_dir.exists() && testman_dir.is_dir() {
                return testman_dir.join("testman.db");
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    // No .testman found - default to current directory
    std::path::PathBuf::from(".testman/testman.db")
}

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

#[derive(Debug)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        // Several sessions may share one file; wait for writers instead of failing
        conn.batch_execute("PRAGMA busy_timeout = 5000;")
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Database connection wrapper with connection pool
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Get the database path that will be used
    pub fn db_path() -> std::path::PathBuf {
        get_db_path()
    }

    /// Create a new database at a custom path
    pub fn new(path: &str) -> Result<Self> {
        Self::open_at(path)
    }

    /// Open database at default path (respects TESTMAN_DB_PATH env var)
    pub fn open() -> Result<Self> {
        let path = get_db_path();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Connection(format!("{}: {}", parent.display(), e)))?;
            }
        }
        Self::open_at(&path)
    }

    /// Open database at specified path
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(&path_str);
        let pool = Pool::builder()
            .max_size(5)
            .connection_customizer(Box::new(ConnectionOptions))
            .build(manager)
            .map_err(|e| Error::Connection(e.to_string()))?;
        tracing::debug!("opened database {}", path_str);
        Ok(Self { pool })
    }

    pub fn get_conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| Error::Connection(e.to_string()))
    }

    /// Run `f` in one transaction: committed when it returns `Ok`, rolled
    /// back when it returns an error.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T>,
    {
        let mut conn = self.get_conn()?;
        let conn: &mut SqliteConnection = &mut conn;
        conn.transaction::<T, Error, _>(f)
    }
}

// ============================================================================
// Dynamic statements
// ============================================================================

/// One bound statement parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(Option<String>),
    BigInt(Option<i64>),
}

impl SqlParam {
    pub fn text(s: impl Into<String>) -> Self {
        SqlParam::Text(Some(s.into()))
    }
}

impl From<&FieldValue> for SqlParam {
    fn from(v: &FieldValue) -> Self {
        match v {
            FieldValue::Time(t) => SqlParam::BigInt(Some(to_timestamp(t))),
            other => SqlParam::Text(other.to_stored()),
        }
    }
}

/// Quote an identifier for use in generated SQL
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"a"=? AND "b"=?` over the given columns; `1=1` when there are none
pub fn where_equal<'a, I>(columns: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let clauses: Vec<String> = columns
        .into_iter()
        .map(|c| format!("{}=?", quote_ident(c)))
        .collect();
    if clauses.is_empty() {
        "1=1".to_string()
    } else {
        clauses.join(" AND ")
    }
}

/// `json_object('a', "a", ...)` selecting the given columns
pub fn json_columns<'a, I>(columns: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let parts: Vec<String> = columns
        .into_iter()
        .map(|c| format!("'{}', {}", c.replace('\'', "''"), quote_ident(c)))
        .collect();
    format!("json_object({})", parts.join(", "))
}

fn bind_all<'f>(sql: &str, params: Vec<SqlParam>) -> BoxedSqlQuery<'f, Sqlite, SqlQuery> {
    let mut query = diesel::sql_query(sql).into_boxed::<Sqlite>();
    for param in params {
        query = match param {
            SqlParam::Text(v) => query.bind::<Nullable<Text>, _>(v),
            SqlParam::BigInt(v) => query.bind::<Nullable<BigInt>, _>(v),
        };
    }
    query
}

/// Execute a statement, returning the number of affected rows
pub fn execute(conn: &mut SqliteConnection, sql: &str, params: Vec<SqlParam>) -> Result<usize> {
    tracing::trace!("{}", sql);
    Ok(bind_all(sql, params).execute(conn)?)
}

#[derive(QueryableByName, Debug)]
struct JsonRow {
    #[diesel(sql_type = Text)]
    row_json: String,
}

/// Load rows of a query whose only column is a `json_object(...)` aliased
/// as `row_json`
pub fn load_json_rows(
    conn: &mut SqliteConnection,
    sql: &str,
    params: Vec<SqlParam>,
) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
    tracing::trace!("{}", sql);
    let rows: Vec<JsonRow> = bind_all(sql, params).load(conn)?;
    rows.into_iter()
        .map(|r| serde_json::from_str(&r.row_json).map_err(Error::from))
        .collect()
}

#[derive(QueryableByName, Debug)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    n: i64,
}

/// Trivial read against a table. Any failure means the table is unusable.
pub fn table_readable(conn: &mut SqliteConnection, table: &str) -> bool {
    diesel::sql_query(format!("SELECT COUNT(*) AS n FROM {}", quote_ident(table)))
        .get_result::<CountRow>(conn)
        .map(|r| r.n >= 0)
        .unwrap_or(false)
}
