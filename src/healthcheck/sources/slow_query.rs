use super::application::connect_mysql;
use super::queries::{
    CLICKHOUSE_SLOW_QUERY_SQL, MIN_ROWS_EXAMINED, QAN_MYSQL_SLOW_QUERY_SQL, SLOW_QUERY_LIMIT,
};
use super::{parse_base_url, Credentials, SlowQuerySource, SlowQueryStoreKind};
use crate::healthcheck::error::{HealthcheckError, Result};
use crate::healthcheck::models::{OperationInfo, SlowQuery};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::Connection;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;
use url::Url;

const QAN_BACKEND: &str = "query analytics mysql";
const CLICKHOUSE_BACKEND: &str = "clickhouse";
const CLICKHOUSE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Keeps the first row of every `sql_id` in rank order, at most `SLOW_QUERY_LIMIT` rows.
pub fn distinct_ranked(queries: Vec<SlowQuery>) -> Vec<SlowQuery> {
    let limit = usize::try_from(SLOW_QUERY_LIMIT).unwrap_or(usize::MAX);
    let mut seen = HashSet::new();
    queries
        .into_iter()
        .filter(|q| seen.insert(q.sql_id.clone()))
        .take(limit)
        .collect()
}

/// Bind values of `QAN_MYSQL_SLOW_QUERY_SQL`. The limit is bound twice,
/// once for the ranking and once after the joins.
#[derive(Debug, Clone, PartialEq)]
pub struct QanSlowQueryArgs {
    pub service_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub min_rows_examined: i64,
    pub limit: i64,
}

impl QanSlowQueryArgs {
    pub const PLACEHOLDERS: usize = 6;

    pub fn new(operation: &OperationInfo) -> Self {
        Self {
            service_name: operation.service_name().to_string(),
            start_time: operation.start_time(),
            end_time: operation.end_time(),
            min_rows_examined: MIN_ROWS_EXAMINED,
            limit: SLOW_QUERY_LIMIT,
        }
    }
}

/// Slow queries from the generation 1 query-analytics MySQL store.
#[derive(Debug)]
pub struct QanMySqlSlowQuerySource {
    args: QanSlowQueryArgs,
    conn: Option<MySqlConnection>,
}

impl QanMySqlSlowQuerySource {
    pub async fn connect(
        operation: &OperationInfo,
        credentials: &Credentials,
        database: &str,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let monitor = operation.monitor_system();
        let port = u16::try_from(monitor.port_num_slow).map_err(|_| {
            HealthcheckError::InvalidData(format!("port {} is not valid", monitor.port_num_slow))
        })?;
        let options = MySqlConnectOptions::new()
            .host(&monitor.host_ip)
            .port(port)
            .database(database)
            .username(&credentials.user)
            .password(&credentials.password);
        debug!("Connecting to query analytics store {}:{}", monitor.host_ip, port);

        let conn = connect_mysql(QAN_BACKEND, options, connect_timeout).await?;
        Ok(Self {
            args: QanSlowQueryArgs::new(operation),
            conn: Some(conn),
        })
    }
}

#[async_trait]
impl SlowQuerySource for QanMySqlSlowQuerySource {
    fn kind(&self) -> SlowQueryStoreKind {
        SlowQueryStoreKind::QanMySql
    }

    async fn get_slow_queries(&mut self) -> Result<Vec<SlowQuery>> {
        debug!(
            "Query analytics slow query sql: {} placeholders: {:?}",
            QAN_MYSQL_SLOW_QUERY_SQL, self.args
        );
        let args = &self.args;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| HealthcheckError::backend(QAN_BACKEND, "connection is already closed"))?;

        let queries = sqlx::query_as::<_, SlowQuery>(QAN_MYSQL_SLOW_QUERY_SQL)
            .bind(&args.service_name)
            .bind(args.start_time)
            .bind(args.end_time)
            .bind(args.min_rows_examined)
            .bind(args.limit)
            .bind(args.limit)
            .fetch_all(conn)
            .await?;

        Ok(distinct_ranked(queries))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
        }
        Ok(())
    }
}

/// Slow queries from the generation 2 ClickHouse `metrics` table, read over
/// the ClickHouse HTTP interface.
#[derive(Debug, Clone)]
pub struct ClickhouseSlowQuerySource {
    client: Client,
    url: Url,
    credentials: Credentials,
    database: String,
    service_name: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

impl ClickhouseSlowQuerySource {
    pub fn new(
        client: Client,
        url: &str,
        credentials: Credentials,
        database: &str,
        operation: &OperationInfo,
    ) -> Result<Self> {
        Ok(Self {
            client,
            url: parse_base_url(CLICKHOUSE_BACKEND, url)?,
            credentials,
            database: database.to_string(),
            service_name: operation.service_name().to_string(),
            start_time: operation.start_time(),
            end_time: operation.end_time(),
        })
    }

    fn params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("database", self.database.clone()),
            ("output_format_json_quote_64bit_integers", "0".to_string()),
            ("param_service_name", self.service_name.clone()),
            (
                "param_start_time",
                self.start_time.format(CLICKHOUSE_TIME_FORMAT).to_string(),
            ),
            (
                "param_end_time",
                self.end_time.format(CLICKHOUSE_TIME_FORMAT).to_string(),
            ),
            ("param_min_rows_examined", MIN_ROWS_EXAMINED.to_string()),
            ("param_limit", SLOW_QUERY_LIMIT.to_string()),
        ]
    }
}

/// Decodes a `JSONEachRow` body, one object per line.
fn parse_rows(body: &str) -> Result<Vec<SlowQuery>> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<SlowQuery>(line).map_err(HealthcheckError::from))
        .collect()
}

#[async_trait]
impl SlowQuerySource for ClickhouseSlowQuerySource {
    fn kind(&self) -> SlowQueryStoreKind {
        SlowQueryStoreKind::Clickhouse
    }

    async fn get_slow_queries(&mut self) -> Result<Vec<SlowQuery>> {
        let params = self.params();
        debug!(
            "Clickhouse slow query sql: {} params: {:?}",
            CLICKHOUSE_SLOW_QUERY_SQL, params
        );

        let response = self
            .client
            .post(self.url.clone())
            .query(&params)
            .header("X-ClickHouse-User", &self.credentials.user)
            .header("X-ClickHouse-Key", &self.credentials.password)
            .body(CLICKHOUSE_SLOW_QUERY_SQL)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(HealthcheckError::backend(
                CLICKHOUSE_BACKEND,
                format!("status {status}: {}", body.trim()),
            ));
        }

        parse_rows(&body).map(distinct_ranked)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
