pub mod snowflake;
pub mod sqlite;

use crate::errors::{AppError, AppResult};
use crate::models::{UserCredential, WarehouseBackend, WarehouseSettings};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One result row keyed by upper-cased column name.
pub type Row = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Snowflake,
    Sqlite,
}

/// Opens sessions against the external warehouse on behalf of one user.
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn name(&self) -> &'static str;
    fn dialect(&self) -> Dialect;
    async fn connect(&self, credential: &UserCredential) -> AppResult<Box<dyn WarehouseSession>>;
}

#[async_trait]
pub trait WarehouseSession: Send {
    fn id(&self) -> String;
    async fn execute(&mut self, sql: &str) -> AppResult<Vec<Row>>;
    async fn close(self: Box<Self>) -> AppResult<()>;
}

pub fn build_warehouse(settings: &WarehouseSettings) -> AppResult<Arc<dyn Warehouse>> {
    match settings.backend {
        WarehouseBackend::Snowflake => Ok(Arc::new(snowflake::SnowflakeWarehouse::new(
            &settings.host_suffix,
            &settings.application_name,
        )?)),
        WarehouseBackend::Sqlite => {
            let path = settings
                .sqlite_path
                .clone()
                .ok_or_else(|| AppError::Config("warehouse.sqlitePath is required for the sqlite backend".to_string()))?;
            Ok(Arc::new(sqlite::SqliteWarehouse::new(path)))
        }
    }
}

/// Reads a numeric column, accepting JSON numbers and numeric strings. Null, missing
/// and unparsable values read as `None`.
pub fn numeric_column(row: &Row, column: &str) -> Option<f64> {
    let value = match row.get(column)? {
        serde_json::Value::Number(number) => number.as_f64(),
        serde_json::Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|value| value.is_finite())
}

#[cfg(test)]
mod tests {
    use super::{numeric_column, Row};
    use serde_json::json;

    #[test]
    fn numeric_column_accepts_strings_and_numbers() {
        let mut row = Row::new();
        row.insert("QUERY_COUNT".to_string(), json!("42"));
        row.insert("TOTAL_TIME".to_string(), json!(1250.5));
        row.insert("AVG_TIME".to_string(), serde_json::Value::Null);
        row.insert("BROKEN".to_string(), json!("n/a"));

        assert_eq!(numeric_column(&row, "QUERY_COUNT"), Some(42.0));
        assert_eq!(numeric_column(&row, "TOTAL_TIME"), Some(1250.5));
        assert_eq!(numeric_column(&row, "AVG_TIME"), None);
        assert_eq!(numeric_column(&row, "BROKEN"), None);
        assert_eq!(numeric_column(&row, "MISSING"), None);
    }
}
