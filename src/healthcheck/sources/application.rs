use super::queries::{variables_sql, LARGE_TABLES_SQL, MIN_TABLE_ROWS};
use super::{ConfigSource, Credentials};
use crate::healthcheck::error::{HealthcheckError, Result};
use crate::healthcheck::models::{GlobalVariable, OperationInfo, Table};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::Connection;
use std::time::Duration;
use tracing::debug;

const BACKEND: &str = "application mysql";

pub const DATA_DIR_VARIABLE: &str = "datadir";
pub const BINLOG_DIR_VARIABLE: &str = "log_bin_basename";

const PERFORMANCE_SCHEMA: &str = "performance_schema";
const INFORMATION_SCHEMA: &str = "information_schema";

/// Opens a single MySQL connection, failing after `connect_timeout`.
pub(crate) async fn connect_mysql(
    backend: &str,
    options: MySqlConnectOptions,
    connect_timeout: Duration,
) -> Result<MySqlConnection> {
    tokio::time::timeout(connect_timeout, MySqlConnection::connect_with(&options))
        .await
        .map_err(|_| {
            HealthcheckError::backend(
                backend,
                format!("connect timed out after {}s", connect_timeout.as_secs()),
            )
        })?
        .map_err(HealthcheckError::from)
}

/// `global_variables` moved to performance_schema in 5.7.
pub fn variables_schema(version: &str) -> Result<&'static str> {
    let mut parts = version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u32>());
    let major = parts.next();
    let minor = parts.next();

    match (major, minor) {
        (Some(Ok(major)), Some(Ok(minor))) => {
            if (major, minor) >= (5, 7) {
                Ok(PERFORMANCE_SCHEMA)
            } else {
                Ok(INFORMATION_SCHEMA)
            }
        }
        _ => Err(HealthcheckError::InvalidData(format!(
            "mysql version {version} is not valid"
        ))),
    }
}

/// Reads configuration and the large-table inventory from the target instance.
#[derive(Debug)]
pub struct MySqlConfigSource {
    version: String,
    conn: Option<MySqlConnection>,
}

impl MySqlConfigSource {
    pub async fn connect(
        operation: &OperationInfo,
        credentials: &Credentials,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let server = operation.mysql_server();
        let port = u16::try_from(server.port_num).map_err(|_| {
            HealthcheckError::InvalidData(format!("port {} is not valid", server.port_num))
        })?;
        let options = MySqlConnectOptions::new()
            .host(&server.host_ip)
            .port(port)
            .username(&credentials.user)
            .password(&credentials.password);
        debug!("Connecting to application mysql {}:{}", server.host_ip, port);

        let conn = connect_mysql(BACKEND, options, connect_timeout).await?;
        Ok(Self {
            version: server.version.clone(),
            conn: Some(conn),
        })
    }

    fn connection(&mut self) -> Result<&mut MySqlConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| HealthcheckError::backend(BACKEND, "connection is already closed"))
    }
}

#[async_trait]
impl ConfigSource for MySqlConfigSource {
    async fn get_variables(&mut self, names: &[String]) -> Result<Vec<GlobalVariable>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let sql = variables_sql(variables_schema(&self.version)?, names.len());
        debug!("Application mysql variables sql: {} placeholders: {:?}", sql, names);

        let mut query = sqlx::query_as::<_, GlobalVariable>(&sql);
        for name in names {
            query = query.bind(name);
        }
        let variables = query.fetch_all(self.connection()?).await?;

        Ok(variables)
    }

    async fn get_mysql_dirs(&mut self) -> Result<Vec<String>> {
        let names = [DATA_DIR_VARIABLE.to_string(), BINLOG_DIR_VARIABLE.to_string()];
        let variables = self.get_variables(&names).await?;

        Ok(names
            .iter()
            .filter_map(|name| {
                variables
                    .iter()
                    .find(|v| v.variable_name.eq_ignore_ascii_case(name))
                    .map(|v| v.variable_value.clone())
            })
            .filter(|dir| !dir.is_empty())
            .collect())
    }

    async fn get_large_tables(&mut self) -> Result<Vec<Table>> {
        debug!(
            "Application mysql large tables sql: {} placeholders: {}",
            LARGE_TABLES_SQL, MIN_TABLE_ROWS
        );
        let tables = sqlx::query_as::<_, Table>(LARGE_TABLES_SQL)
            .bind(MIN_TABLE_ROWS)
            .fetch_all(self.connection()?)
            .await?;

        Ok(tables)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variables_schema_by_version() {
        assert_eq!(variables_schema("5.7.35-log").unwrap(), PERFORMANCE_SCHEMA);
        assert_eq!(variables_schema("8.0.28").unwrap(), PERFORMANCE_SCHEMA);
        assert_eq!(variables_schema("5.6.51").unwrap(), INFORMATION_SCHEMA);
        assert_eq!(variables_schema("10.4.0-MariaDB").unwrap(), PERFORMANCE_SCHEMA);
    }

    #[test]
    fn test_invalid_version_is_rejected() {
        assert!(variables_schema("").is_err());
        assert!(variables_schema("five").is_err());
        assert!(variables_schema("8").is_err());
    }
}
