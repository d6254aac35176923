//! Snowflake client speaking the session REST protocol used by the official drivers:
//! password login, synchronous statement execution and logout.

use super::{Dialect, Row, Warehouse, WarehouseSession};
use crate::errors::{AppError, AppResult};
use crate::models::UserCredential;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

const SNOWFLAKE_ACCEPT: &str = "application/snowflake";

#[derive(Debug, Clone)]
pub struct SnowflakeWarehouse {
    client: reqwest::Client,
    host_suffix: String,
    application_name: String,
}

impl SnowflakeWarehouse {
    pub fn new(host_suffix: &str, application_name: &str) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("{}/{}", application_name, env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| AppError::Config(error.to_string()))?;
        Ok(Self {
            client,
            host_suffix: host_suffix.trim_start_matches('.').to_string(),
            application_name: application_name.to_string(),
        })
    }

    pub fn base_url(&self, host_account: &str) -> String {
        format!("https://{}.{}", host_account, self.host_suffix)
    }
}

/// The account locator is the first label of the account identifier.
fn account_name(host_account: &str) -> String {
    host_account
        .split('.')
        .next()
        .unwrap_or(host_account)
        .to_ascii_uppercase()
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    message: Option<String>,
    code: Option<String>,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn failure_text(&self) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => format!("{} ({})", message, code),
            (None, Some(message)) => message.clone(),
            (Some(code), None) => format!("error code {}", code),
            (None, None) => "request was not successful".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginData {
    token: Option<String>,
    session_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RowType {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    #[serde(default)]
    rowtype: Vec<RowType>,
    #[serde(default)]
    rowset: Vec<Vec<serde_json::Value>>,
    query_id: Option<String>,
}

fn rows_from_rowset(rowtype: &[RowType], rowset: Vec<Vec<serde_json::Value>>) -> Vec<Row> {
    rowset
        .into_iter()
        .map(|values| {
            rowtype
                .iter()
                .map(|column| column.name.to_ascii_uppercase())
                .zip(values)
                .collect::<Row>()
        })
        .collect()
}

#[async_trait]
impl Warehouse for SnowflakeWarehouse {
    fn name(&self) -> &'static str {
        "snowflake"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Snowflake
    }

    async fn connect(&self, credential: &UserCredential) -> AppResult<Box<dyn WarehouseSession>> {
        let base_url = self.base_url(&credential.host_account);
        let request_id = Uuid::new_v4();
        let body = json!({
            "data": {
                "CLIENT_APP_ID": self.application_name,
                "CLIENT_APP_VERSION": env!("CARGO_PKG_VERSION"),
                "ACCOUNT_NAME": account_name(&credential.host_account),
                "LOGIN_NAME": credential.username,
                "PASSWORD": credential.password,
                "CLIENT_ENVIRONMENT": { "APPLICATION": self.application_name },
            }
        });

        let response = self
            .client
            .post(format!("{}/session/v1/login-request", base_url))
            .query(&[("requestId", request_id.to_string()), ("request_guid", Uuid::new_v4().to_string())])
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::connection(
                "Failed to connect to Snowflake.",
                format!("login request returned HTTP {}", status),
            ));
        }

        let envelope: Envelope<LoginData> = response.json().await?;
        if !envelope.success {
            return Err(AppError::connection("Failed to connect to Snowflake.", envelope.failure_text()));
        }
        let data = envelope.data.ok_or_else(|| {
            AppError::connection("Failed to connect to Snowflake.", "login response had no session data")
        })?;
        let token = data.token.ok_or_else(|| {
            AppError::connection("Failed to connect to Snowflake.", "login response had no session token")
        })?;

        let session_id = data
            .session_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| request_id.to_string());
        tracing::debug!(account = %credential.host_account, session_id = %session_id, "snowflake session opened");

        Ok(Box::new(SnowflakeSession {
            client: self.client.clone(),
            base_url,
            token,
            session_id,
            sequence: 0,
        }))
    }
}

pub struct SnowflakeSession {
    client: reqwest::Client,
    base_url: String,
    token: String,
    session_id: String,
    sequence: u64,
}

impl SnowflakeSession {
    fn authorization(&self) -> String {
        format!("Snowflake Token=\"{}\"", self.token)
    }
}

#[async_trait]
impl WarehouseSession for SnowflakeSession {
    fn id(&self) -> String {
        self.session_id.clone()
    }

    async fn execute(&mut self, sql: &str) -> AppResult<Vec<Row>> {
        self.sequence += 1;
        let body = json!({
            "sqlText": sql,
            "asyncExec": false,
            "sequenceId": self.sequence,
            "querySubmissionTime": Utc::now().timestamp_millis(),
        });

        let response = self
            .client
            .post(format!("{}/queries/v1/query-request", self.base_url))
            .query(&[("requestId", Uuid::new_v4().to_string())])
            .header(ACCEPT, SNOWFLAKE_ACCEPT)
            .header(AUTHORIZATION, self.authorization())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Query(format!("query request returned HTTP {}", status)));
        }

        let envelope: Envelope<QueryData> = response.json().await?;
        if !envelope.success {
            return Err(AppError::Query(envelope.failure_text()));
        }
        let data = envelope
            .data
            .ok_or_else(|| AppError::Query("query response had no data".to_string()))?;
        if let Some(query_id) = data.query_id.as_deref() {
            tracing::debug!(session_id = %self.session_id, query_id, rows = data.rowset.len(), "snowflake query completed");
        }

        Ok(rows_from_rowset(&data.rowtype, data.rowset))
    }

    async fn close(self: Box<Self>) -> AppResult<()> {
        let response = self
            .client
            .post(format!("{}/session", self.base_url))
            .query(&[("delete", "true".to_string()), ("requestId", Uuid::new_v4().to_string())])
            .header(ACCEPT, SNOWFLAKE_ACCEPT)
            .header(AUTHORIZATION, self.authorization())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::Io(format!(
                "logout returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{account_name, rows_from_rowset, Envelope, LoginData, QueryData, SnowflakeWarehouse};
    use serde_json::json;

    #[test]
    fn account_name_uses_first_label() {
        assert_eq!(account_name("xy12345.us-east-1"), "XY12345");
        assert_eq!(account_name("orgname-acct"), "ORGNAME-ACCT");
    }

    #[test]
    fn base_url_appends_host_suffix() {
        let warehouse = SnowflakeWarehouse::new("snowflakecomputing.com", "query-pulse").expect("client");
        assert_eq!(warehouse.base_url("xy12345"), "https://xy12345.snowflakecomputing.com");
    }

    #[test]
    fn query_response_maps_rowset_to_named_rows() {
        let envelope: Envelope<QueryData> = serde_json::from_value(json!({
            "success": true,
            "message": null,
            "code": null,
            "data": {
                "queryId": "01b2",
                "rowtype": [{"name": "QUERY_COUNT"}, {"name": "TOTAL_TIME"}, {"name": "AVG_TIME"}],
                "rowset": [["12", "3400", null]]
            }
        }))
        .expect("parse query response");

        let data = envelope.data.expect("data");
        let rows = rows_from_rowset(&data.rowtype, data.rowset);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["QUERY_COUNT"], json!("12"));
        assert_eq!(rows[0]["AVG_TIME"], serde_json::Value::Null);
    }

    #[test]
    fn failed_login_reports_message_and_code() {
        let envelope: Envelope<LoginData> = serde_json::from_value(json!({
            "success": false,
            "message": "Incorrect username or password was specified.",
            "code": "390100",
            "data": null
        }))
        .expect("parse login response");

        assert!(!envelope.success);
        assert_eq!(
            envelope.failure_text(),
            "Incorrect username or password was specified. (390100)"
        );
    }
}
