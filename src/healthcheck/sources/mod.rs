//! Read-only adapters over the target instance and its monitoring backends.

pub mod application;
pub mod prometheus;
pub mod queries;
pub mod slow_query;

pub use application::MySqlConfigSource;
pub use prometheus::PrometheusTelemetrySource;
pub use slow_query::{ClickhouseSlowQuerySource, QanMySqlSlowQuerySource};

use super::error::{HealthcheckError, Result};
use super::models::{
    FileSystem, GlobalVariable, MonitorGeneration, MonitorSystem, OperationInfo, PrometheusData,
    SlowQuery, Table,
};
use async_trait::async_trait;
use queries::PromQlTemplates;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{info, warn};

/// Live configuration and table inventory of the target instance.
#[async_trait]
pub trait ConfigSource: Send + Debug {
    async fn get_variables(&mut self, names: &[String]) -> Result<Vec<GlobalVariable>>;
    /// Data and binlog directories.
    async fn get_mysql_dirs(&mut self) -> Result<Vec<String>>;
    async fn get_large_tables(&mut self) -> Result<Vec<Table>>;
    async fn close(&mut self) -> Result<()>;
}

/// Range queries over the time-series backend for the operation window.
#[async_trait]
pub trait TelemetrySource: Send + Sync + Debug {
    async fn get_file_systems(&self) -> Result<Vec<FileSystem>>;
    async fn get_cpu_usage(&self) -> Result<Vec<PrometheusData>>;
    async fn get_io_util(&self) -> Result<Vec<PrometheusData>>;
    async fn get_disk_capacity_usage(&self, mount_points: &[String]) -> Result<Vec<PrometheusData>>;
    async fn get_connection_usage(&self) -> Result<Vec<PrometheusData>>;
    async fn get_average_active_session_percents(&self) -> Result<Vec<PrometheusData>>;
    async fn get_cache_miss_ratio(&self) -> Result<Vec<PrometheusData>>;
}

/// Ranked slow-query statistics, most rows examined first.
#[async_trait]
pub trait SlowQuerySource: Send + Debug {
    fn kind(&self) -> SlowQueryStoreKind;
    async fn get_slow_queries(&mut self) -> Result<Vec<SlowQuery>>;
    async fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowQueryStoreKind {
    /// Relational query-analytics store joining query classes and examples
    QanMySql,
    /// Columnar metrics table
    Clickhouse,
}

/// Backend pairing of one monitoring generation, selected once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorBackend {
    pub generation: MonitorGeneration,
    pub templates: &'static PromQlTemplates,
    pub basic_auth: bool,
    pub slow_query_store: SlowQueryStoreKind,
}

impl MonitorBackend {
    pub fn for_generation(generation: MonitorGeneration) -> Self {
        let (basic_auth, slow_query_store) = match generation {
            MonitorGeneration::Pmm1 => (false, SlowQueryStoreKind::QanMySql),
            MonitorGeneration::Pmm2 => (true, SlowQueryStoreKind::Clickhouse),
        };
        Self {
            generation,
            templates: PromQlTemplates::for_generation(generation),
            basic_auth,
            slow_query_store,
        }
    }

    /// Fails with `BackendUnsupported` for any system type other than 1 or 2.
    pub fn select(monitor_system: &MonitorSystem) -> Result<Self> {
        Ok(Self::for_generation(monitor_system.generation()?))
    }
}

/// The three adapters owned by one run.
#[derive(Debug)]
pub struct Sources {
    pub config: Box<dyn ConfigSource>,
    pub telemetry: Box<dyn TelemetrySource>,
    pub slow_query: Box<dyn SlowQuerySource>,
}

#[async_trait]
pub trait SourceFactory: Send + Sync + Debug {
    async fn connect(&self, operation: &OperationInfo) -> Result<Sources>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

/// Credentials and timeouts used to open the per-run connections.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub application_mysql: Credentials,
    pub prometheus: Credentials,
    pub qan_mysql: Credentials,
    pub clickhouse: Credentials,
    pub monitor_database: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            application_mysql: Credentials::default(),
            prometheus: Credentials::default(),
            qan_mysql: Credentials::default(),
            clickhouse: Credentials::default(),
            monitor_database: "pmm".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Opens real connections to the target instance and its monitoring system.
#[derive(Debug, Clone)]
pub struct ConnectingSourceFactory {
    settings: SourceSettings,
}

impl ConnectingSourceFactory {
    pub fn new(settings: SourceSettings) -> Self {
        Self { settings }
    }

    async fn connect_slow_query(
        &self,
        backend: MonitorBackend,
        client: reqwest::Client,
        operation: &OperationInfo,
    ) -> Result<Box<dyn SlowQuerySource>> {
        let monitor = operation.monitor_system();
        match backend.slow_query_store {
            SlowQueryStoreKind::QanMySql => Ok(Box::new(
                QanMySqlSlowQuerySource::connect(
                    operation,
                    &self.settings.qan_mysql,
                    &self.settings.monitor_database,
                    self.settings.connect_timeout,
                )
                .await?,
            )),
            SlowQueryStoreKind::Clickhouse => {
                let url = format!("http://{}:{}", monitor.host_ip, monitor.port_num_slow);
                Ok(Box::new(ClickhouseSlowQuerySource::new(
                    client,
                    &url,
                    self.settings.clickhouse.clone(),
                    &self.settings.monitor_database,
                    operation,
                )?))
            }
        }
    }

    fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.settings.connect_timeout)
            .timeout(self.settings.request_timeout)
            .build()
            .map_err(HealthcheckError::from)
    }
}

#[async_trait]
impl SourceFactory for ConnectingSourceFactory {
    async fn connect(&self, operation: &OperationInfo) -> Result<Sources> {
        let backend = MonitorBackend::select(operation.monitor_system())?;
        let monitor = operation.monitor_system();
        info!(
            "Connecting sources for operation {} (generation {:?}, slow query store {:?})",
            operation.operation_id(),
            backend.generation,
            backend.slow_query_store
        );

        let client = self.http_client()?;
        let prometheus_url = format!(
            "http://{}:{}{}",
            monitor.host_ip, monitor.port_num, monitor.base_url
        );
        let auth = backend
            .basic_auth
            .then(|| self.settings.prometheus.clone());
        let telemetry =
            PrometheusTelemetrySource::new(client.clone(), &prometheus_url, auth, backend.templates, operation)?;

        let mut config = MySqlConfigSource::connect(
            operation,
            &self.settings.application_mysql,
            self.settings.connect_timeout,
        )
        .await?;

        let slow_query = match self.connect_slow_query(backend, client, operation).await {
            Ok(source) => source,
            Err(e) => {
                if let Err(close_err) = config.close().await {
                    warn!("Failed to close application mysql connection: {}", close_err);
                }
                return Err(e);
            }
        };

        Ok(Sources {
            config: Box::new(config),
            telemetry: Box::new(telemetry),
            slow_query,
        })
    }
}

/// Parses `base` as an absolute http(s) URL for the named backend.
pub(crate) fn parse_base_url(backend: &str, base: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(base).map_err(|e| {
        HealthcheckError::backend(backend, format!("invalid base url {base}: {e}"))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(HealthcheckError::backend(
            backend,
            format!("unsupported url scheme {other}"),
        )),
    }
}
