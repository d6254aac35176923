//! Local stand-in for the warehouse: a SQLite file with a `query_history` table shaped like
//! the account-usage view. Used for development and tests.

use super::{Dialect, Row, Warehouse, WarehouseSession};
use crate::errors::{AppError, AppResult};
use crate::models::UserCredential;
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS query_history (
    query_id TEXT PRIMARY KEY,
    start_time TEXT NOT NULL,
    total_elapsed_time REAL
);
CREATE INDEX IF NOT EXISTS idx_query_history_start_time ON query_history(start_time);";

#[derive(Debug, Clone)]
pub struct SqliteWarehouse {
    path: PathBuf,
}

impl SqliteWarehouse {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Creates the `query_history` table if the file does not have it yet.
    pub fn initialize(path: &Path) -> AppResult<()> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn connect(&self, credential: &UserCredential) -> AppResult<Box<dyn WarehouseSession>> {
        let path = self.path.clone();
        let conn = tokio::task::spawn_blocking(move || {
            Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
        })
        .await
        .map_err(|error| AppError::Internal(error.to_string()))?
        .map_err(|error| AppError::connection("Failed to open the local warehouse.", error))?;

        tracing::debug!(user_id = %credential.user_id, path = %self.path.display(), "sqlite session opened");
        Ok(Box::new(SqliteSession {
            id: Uuid::new_v4().to_string(),
            conn: Some(conn),
        }))
    }
}

pub struct SqliteSession {
    id: String,
    conn: Option<Connection>,
}

fn run_query(conn: &Connection, sql: &str) -> rusqlite::Result<Vec<Row>> {
    let mut statement = conn.prepare(sql)?;
    let columns = statement
        .column_names()
        .into_iter()
        .map(|name| name.to_ascii_uppercase())
        .collect::<Vec<_>>();

    let mut rows = statement.query([])?;
    let mut collected = Vec::new();
    while let Some(row) = rows.next()? {
        let mut mapped = Row::new();
        for (index, column) in columns.iter().enumerate() {
            let value = match row.get_ref(index)? {
                ValueRef::Null | ValueRef::Blob(_) => serde_json::Value::Null,
                ValueRef::Integer(value) => serde_json::Value::from(value),
                ValueRef::Real(value) => serde_json::Number::from_f64(value)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null),
                ValueRef::Text(text) => serde_json::Value::String(String::from_utf8_lossy(text).to_string()),
            };
            mapped.insert(column.clone(), value);
        }
        collected.push(mapped);
    }
    Ok(collected)
}

#[async_trait]
impl WarehouseSession for SqliteSession {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn execute(&mut self, sql: &str) -> AppResult<Vec<Row>> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| AppError::Query("session is closed".to_string()))?;
        let sql = sql.to_string();
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = run_query(&conn, &sql);
            (conn, result)
        })
        .await
        .map_err(|error| AppError::Internal(error.to_string()))?;
        self.conn = Some(conn);
        Ok(result?)
    }

    async fn close(self: Box<Self>) -> AppResult<()> {
        let mut session = self;
        if let Some(conn) = session.conn.take() {
            conn.close().map_err(|(_, error)| AppError::from(error))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::SqliteWarehouse;
    use crate::models::UserCredential;
    use crate::warehouse::{numeric_column, Warehouse};
    use rusqlite::Connection;

    fn credential() -> UserCredential {
        UserCredential {
            user_id: "u1".to_string(),
            host_account: "local".to_string(),
            username: "dev".to_string(),
            password: "dev".to_string(),
        }
    }

    #[tokio::test]
    async fn executes_against_local_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("warehouse.sqlite");
        SqliteWarehouse::initialize(&path).expect("initialize");
        let conn = Connection::open(&path).expect("open");
        conn.execute(
            "INSERT INTO query_history (query_id, start_time, total_elapsed_time) VALUES ('q1', datetime('now'), 120.0), ('q2', datetime('now'), 80.0)",
            [],
        )
        .expect("seed rows");
        drop(conn);

        let warehouse = SqliteWarehouse::new(&path);
        let mut session = warehouse.connect(&credential()).await.expect("connect");
        let rows = session
            .execute("SELECT COUNT(*) AS query_count, SUM(total_elapsed_time) AS total_time FROM query_history")
            .await
            .expect("execute");
        session.close().await.expect("close");

        assert_eq!(rows.len(), 1);
        assert_eq!(numeric_column(&rows[0], "QUERY_COUNT"), Some(2.0));
        assert_eq!(numeric_column(&rows[0], "TOTAL_TIME"), Some(200.0));
    }

    #[tokio::test]
    async fn missing_file_fails_to_connect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let warehouse = SqliteWarehouse::new(dir.path().join("absent.sqlite"));
        assert!(warehouse.connect(&credential()).await.is_err());
    }

    #[tokio::test]
    async fn bad_sql_is_a_query_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("warehouse.sqlite");
        SqliteWarehouse::initialize(&path).expect("initialize");

        let warehouse = SqliteWarehouse::new(&path);
        let mut session = warehouse.connect(&credential()).await.expect("connect");
        let error = session.execute("SELECT * FROM nowhere").await.expect_err("unknown table");
        assert!(matches!(error, crate::errors::AppError::Query(_)));
        session.close().await.expect("close");
    }
}
