//! In-process doubles for every external seam of the engine: sources,
//! source factory, metadata resolver and SQL advisor.

use super::db_config::DbConfigExpectations;
use super::error::{HealthcheckError, Result};
use super::models::{
    CheckItem, FileSystem, GlobalVariable, ItemConfig, MonitorSystem, MySQLServer, OperationInfo,
    PrometheusData, SlowQuery, Table,
};
use super::sources::{
    ConfigSource, MonitorBackend, SlowQuerySource, SlowQueryStoreKind, SourceFactory, Sources,
    TelemetrySource,
};
use crate::advisor::SqlAdvisor;
use crate::metadata::MetadataResolver;
use async_trait::async_trait;
use chrono::DateTime;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const MYSQL_SERVER_ID: i64 = 1;
pub const CLUSTER_ID: i64 = 1;
pub const HOST_IP: &str = "192.168.10.219";
pub const PORT_NUM: i32 = 3306;
pub const APP_DB_NAME: &str = "app";
pub const APP_DB_ID: i64 = 7;
pub const WINDOW_START: i64 = 1_633_046_400;
pub const WINDOW_END: i64 = 1_633_132_800;

const SAMPLE_STEP: i64 = 60;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Item configurations whose weights sum to 100, ten points each.
pub fn engine_config_items() -> Vec<ItemConfig> {
    CheckItem::ALL
        .iter()
        .map(|item| {
            let name = item.item_name();
            match item {
                CheckItem::DbConfig => ItemConfig::new(name, 10, 1.0, 1.0, 1.0, 5.0, 30.0, 0.0, 0.0),
                CheckItem::TableRows => ItemConfig::new(
                    name,
                    10,
                    50_000_000.0,
                    100_000_000.0,
                    10_000_000.0,
                    5.0,
                    40.0,
                    2.0,
                    20.0,
                ),
                CheckItem::TableSize => {
                    ItemConfig::new(name, 10, 100.0, 500.0, 50.0, 5.0, 40.0, 2.0, 20.0)
                }
                CheckItem::SlowQueryRowsExamined => {
                    ItemConfig::new(name, 10, 10_000.0, 100_000.0, 10_000.0, 5.0, 40.0, 2.0, 20.0)
                }
                _ => ItemConfig::new(name, 10, 60.0, 80.0, 10.0, 5.0, 40.0, 2.0, 20.0),
            }
        })
        .collect()
}

pub fn mysql_server() -> MySQLServer {
    MySQLServer {
        id: MYSQL_SERVER_ID,
        cluster_id: CLUSTER_ID,
        host_ip: HOST_IP.to_string(),
        port_num: PORT_NUM,
        service_name: format!("{HOST_IP}:{PORT_NUM}"),
        version: "5.7.21".to_string(),
    }
}

pub fn monitor_system(system_type: i32) -> MonitorSystem {
    MonitorSystem {
        id: 1,
        system_type,
        host_ip: "192.168.10.220".to_string(),
        port_num: 9090,
        port_num_slow: 9000,
        base_url: "/prometheus".to_string(),
    }
}

pub fn operation_info(operation_id: i64, system_type: i32) -> OperationInfo {
    OperationInfo::new(
        operation_id,
        mysql_server(),
        monitor_system(system_type),
        DateTime::from_timestamp(WINDOW_START, 0).unwrap_or_default(),
        DateTime::from_timestamp(WINDOW_END, 0).unwrap_or_default(),
        Duration::from_secs(SAMPLE_STEP as u64),
    )
}

/// Samples spaced one step apart from the window start.
pub fn series(values: &[f64]) -> Vec<PrometheusData> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let timestamp = WINDOW_START + i as i64 * SAMPLE_STEP;
            PrometheusData::new(format!("{timestamp}.000"), *value)
        })
        .collect()
}

/// Observations every mock source hands out.
#[derive(Debug, Clone, Default)]
pub struct MockData {
    pub variables: Vec<GlobalVariable>,
    pub dirs: Vec<String>,
    pub large_tables: Vec<Table>,
    pub file_systems: Vec<FileSystem>,
    pub cpu_usage: Vec<PrometheusData>,
    pub io_util: Vec<PrometheusData>,
    pub disk_capacity_usage: Vec<PrometheusData>,
    pub connection_usage: Vec<PrometheusData>,
    pub average_active_session_percents: Vec<PrometheusData>,
    pub cache_miss_ratio: Vec<PrometheusData>,
    pub slow_queries: Vec<SlowQuery>,
}

impl MockData {
    /// A target that scores 100 on every item of `engine_config_items`.
    pub fn healthy() -> Self {
        let expectations = DbConfigExpectations::for_server(HOST_IP, PORT_NUM);
        let variables = expectations
            .variable_names()
            .into_iter()
            .map(|name| {
                let value = expectations.expected_value(&name).unwrap_or("2000").to_string();
                GlobalVariable::new(name, value)
            })
            .collect();

        Self {
            variables,
            dirs: vec![
                "/data/mysql/data/".to_string(),
                "/data/mysql/binlog/mysql-bin".to_string(),
            ],
            large_tables: vec![Table {
                table_schema: APP_DB_NAME.to_string(),
                table_name: "t_order".to_string(),
                table_rows: 40_000_000,
                table_size: 20.5,
            }],
            file_systems: vec![
                FileSystem::new("/", "/dev/sda1"),
                FileSystem::new("/data", "/dev/sdb1"),
            ],
            cpu_usage: series(&[12.5, 20.0, 31.0]),
            io_util: series(&[5.0, 8.0]),
            disk_capacity_usage: series(&[40.0, 45.0]),
            connection_usage: series(&[10.0, 12.0]),
            average_active_session_percents: series(&[3.0, 4.0]),
            cache_miss_ratio: series(&[0.5, 1.0]),
            slow_queries: vec![
                SlowQuery {
                    sql_id: "q1".to_string(),
                    fingerprint: "select * from t_order where user_id = ?".to_string(),
                    example: "select * from t_order where user_id = 1".to_string(),
                    db_name: APP_DB_NAME.to_string(),
                    exec_count: 120,
                    total_exec_time: 36.0,
                    avg_exec_time: 0.3,
                    rows_examined_max: 5_000,
                },
                SlowQuery {
                    sql_id: "q2".to_string(),
                    fingerprint: "select ?".to_string(),
                    example: "select 1".to_string(),
                    db_name: String::new(),
                    exec_count: 3,
                    total_exec_time: 0.3,
                    avg_exec_time: 0.1,
                    rows_examined_max: 200,
                },
            ],
        }
    }
}

#[derive(Debug, Default)]
struct MockLog {
    calls: Vec<String>,
    disk_capacity_mount_points: Vec<String>,
    slow_query_kinds: Vec<SlowQueryStoreKind>,
}

#[derive(Debug)]
struct MockBehavior {
    data: MockData,
    failing_call: Option<&'static str>,
    failing_close: Vec<&'static str>,
    log: Arc<Mutex<MockLog>>,
}

impl MockBehavior {
    fn call(&self, backend: &str, call: &str) -> Result<()> {
        lock(&self.log).calls.push(call.to_string());
        if self.failing_call == Some(call) {
            return Err(HealthcheckError::backend(backend, format!("{call} failed")));
        }
        Ok(())
    }

    fn close(&self, connection: &str, call: &str) -> Result<()> {
        lock(&self.log).calls.push(call.to_string());
        if self.failing_close.iter().any(|c| *c == connection) {
            return Err(HealthcheckError::backend(connection, "connection reset by peer"));
        }
        Ok(())
    }
}

/// Builds mock `Sources` that share one call log.
#[derive(Debug, Clone)]
pub struct MockSourceSet {
    data: MockData,
    failing_call: Option<&'static str>,
    failing_close: Vec<&'static str>,
    log: Arc<Mutex<MockLog>>,
}

impl MockSourceSet {
    pub fn new(data: MockData) -> Self {
        Self {
            data,
            failing_call: None,
            failing_close: Vec::new(),
            log: Arc::new(Mutex::new(MockLog::default())),
        }
    }

    pub fn healthy() -> Self {
        Self::new(MockData::healthy())
    }

    /// Makes the source method named `call` fail, e.g. `"get_io_util"`.
    pub fn failing_on(mut self, call: &'static str) -> Self {
        self.failing_call = Some(call);
        self
    }

    /// Makes closing `connection` fail: `"application_mysql"` or `"slow_query_store"`.
    pub fn failing_close(mut self, connection: &'static str) -> Self {
        self.failing_close.push(connection);
        self
    }

    pub fn build(&self, kind: SlowQueryStoreKind) -> Sources {
        lock(&self.log).slow_query_kinds.push(kind);
        let behavior = Arc::new(MockBehavior {
            data: self.data.clone(),
            failing_call: self.failing_call,
            failing_close: self.failing_close.clone(),
            log: self.log.clone(),
        });
        Sources {
            config: Box::new(MockConfigSource {
                behavior: behavior.clone(),
            }),
            telemetry: Box::new(MockTelemetrySource {
                behavior: behavior.clone(),
            }),
            slow_query: Box::new(MockSlowQuerySource { behavior, kind }),
        }
    }

    /// Source methods called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.log).calls.clone()
    }

    pub fn disk_capacity_mount_points(&self) -> Vec<String> {
        lock(&self.log).disk_capacity_mount_points.clone()
    }

    /// Slow-query store of every `Sources` built so far.
    pub fn slow_query_kinds(&self) -> Vec<SlowQueryStoreKind> {
        lock(&self.log).slow_query_kinds.clone()
    }
}

#[derive(Debug)]
struct MockConfigSource {
    behavior: Arc<MockBehavior>,
}

#[async_trait]
impl ConfigSource for MockConfigSource {
    async fn get_variables(&mut self, names: &[String]) -> Result<Vec<GlobalVariable>> {
        self.behavior.call("application_mysql", "get_variables")?;
        Ok(self
            .behavior
            .data
            .variables
            .iter()
            .filter(|v| names.iter().any(|n| n.eq_ignore_ascii_case(&v.variable_name)))
            .cloned()
            .collect())
    }

    async fn get_mysql_dirs(&mut self) -> Result<Vec<String>> {
        self.behavior.call("application_mysql", "get_mysql_dirs")?;
        Ok(self.behavior.data.dirs.clone())
    }

    async fn get_large_tables(&mut self) -> Result<Vec<Table>> {
        self.behavior.call("application_mysql", "get_large_tables")?;
        Ok(self.behavior.data.large_tables.clone())
    }

    async fn close(&mut self) -> Result<()> {
        self.behavior.close("application_mysql", "close_config")
    }
}

#[derive(Debug)]
struct MockTelemetrySource {
    behavior: Arc<MockBehavior>,
}

#[async_trait]
impl TelemetrySource for MockTelemetrySource {
    async fn get_file_systems(&self) -> Result<Vec<FileSystem>> {
        self.behavior.call("prometheus", "get_file_systems")?;
        Ok(self.behavior.data.file_systems.clone())
    }

    async fn get_cpu_usage(&self) -> Result<Vec<PrometheusData>> {
        self.behavior.call("prometheus", "get_cpu_usage")?;
        Ok(self.behavior.data.cpu_usage.clone())
    }

    async fn get_io_util(&self) -> Result<Vec<PrometheusData>> {
        self.behavior.call("prometheus", "get_io_util")?;
        Ok(self.behavior.data.io_util.clone())
    }

    async fn get_disk_capacity_usage(&self, mount_points: &[String]) -> Result<Vec<PrometheusData>> {
        self.behavior.call("prometheus", "get_disk_capacity_usage")?;
        lock(&self.behavior.log).disk_capacity_mount_points = mount_points.to_vec();
        Ok(self.behavior.data.disk_capacity_usage.clone())
    }

    async fn get_connection_usage(&self) -> Result<Vec<PrometheusData>> {
        self.behavior.call("prometheus", "get_connection_usage")?;
        Ok(self.behavior.data.connection_usage.clone())
    }

    async fn get_average_active_session_percents(&self) -> Result<Vec<PrometheusData>> {
        self.behavior
            .call("prometheus", "get_average_active_session_percents")?;
        Ok(self.behavior.data.average_active_session_percents.clone())
    }

    async fn get_cache_miss_ratio(&self) -> Result<Vec<PrometheusData>> {
        self.behavior.call("prometheus", "get_cache_miss_ratio")?;
        Ok(self.behavior.data.cache_miss_ratio.clone())
    }
}

#[derive(Debug)]
struct MockSlowQuerySource {
    behavior: Arc<MockBehavior>,
    kind: SlowQueryStoreKind,
}

#[async_trait]
impl SlowQuerySource for MockSlowQuerySource {
    fn kind(&self) -> SlowQueryStoreKind {
        self.kind
    }

    async fn get_slow_queries(&mut self) -> Result<Vec<SlowQuery>> {
        self.behavior.call("slow_query_store", "get_slow_queries")?;
        Ok(self.behavior.data.slow_queries.clone())
    }

    async fn close(&mut self) -> Result<()> {
        self.behavior.close("slow_query_store", "close_slow_query")
    }
}

/// Factory that selects the backend like the real one but hands out mocks.
#[derive(Debug, Clone)]
pub struct MockSourceFactory {
    sources: MockSourceSet,
    fail_connect: bool,
    connects: Arc<Mutex<Vec<i64>>>,
}

impl MockSourceFactory {
    pub fn new(sources: MockSourceSet) -> Self {
        Self {
            sources,
            fail_connect: false,
            connects: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Operation ids `connect` was called for.
    pub fn connects(&self) -> Vec<i64> {
        lock(&self.connects).clone()
    }

    pub fn sources(&self) -> &MockSourceSet {
        &self.sources
    }
}

#[async_trait]
impl SourceFactory for MockSourceFactory {
    async fn connect(&self, operation: &OperationInfo) -> Result<Sources> {
        lock(&self.connects).push(operation.operation_id());
        let backend = MonitorBackend::select(operation.monitor_system())?;
        if self.fail_connect {
            return Err(HealthcheckError::backend(
                "application_mysql",
                "connection refused",
            ));
        }
        Ok(self.sources.build(backend.slow_query_store))
    }
}

#[derive(Debug, Clone)]
pub struct MockMetadataResolver {
    servers: Vec<MySQLServer>,
    monitor_system: MonitorSystem,
    db_ids: HashMap<String, i64>,
}

impl MockMetadataResolver {
    /// Knows `mysql_server()`, a generation 2 monitor and the `app` database.
    pub fn new() -> Self {
        Self {
            servers: vec![mysql_server()],
            monitor_system: monitor_system(2),
            db_ids: HashMap::from([(APP_DB_NAME.to_string(), APP_DB_ID)]),
        }
    }

    pub fn with_monitor_system_type(mut self, system_type: i32) -> Self {
        self.monitor_system.system_type = system_type;
        self
    }
}

impl Default for MockMetadataResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataResolver for MockMetadataResolver {
    async fn get_mysql_server(&self, mysql_server_id: i64) -> Result<MySQLServer> {
        self.servers
            .iter()
            .find(|s| s.id == mysql_server_id)
            .cloned()
            .ok_or_else(|| {
                HealthcheckError::Metadata(format!("mysql server {mysql_server_id} does not exist"))
            })
    }

    async fn get_mysql_server_by_host_info(&self, host_ip: &str, port_num: i32) -> Result<MySQLServer> {
        self.servers
            .iter()
            .find(|s| s.host_ip == host_ip && s.port_num == port_num)
            .cloned()
            .ok_or_else(|| {
                HealthcheckError::Metadata(format!("mysql server {host_ip}:{port_num} does not exist"))
            })
    }

    async fn get_monitor_system(&self, _mysql_server: &MySQLServer) -> Result<MonitorSystem> {
        Ok(self.monitor_system.clone())
    }

    async fn get_db_id(&self, db_name: &str, cluster_id: i64, _cluster_type: i32) -> Result<i64> {
        self.db_ids.get(db_name).copied().ok_or_else(|| {
            HealthcheckError::Metadata(format!(
                "database {db_name} of cluster {cluster_id} does not exist"
            ))
        })
    }
}

/// Advisor answering `advice for <sql>` and recording every request.
#[derive(Debug, Default)]
pub struct MockSqlAdvisor {
    requests: Mutex<Vec<(i64, String)>>,
    fail: bool,
}

impl MockSqlAdvisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<(i64, String)> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl SqlAdvisor for MockSqlAdvisor {
    async fn advise(&self, db_id: i64, sql_text: &str) -> Result<String> {
        lock(&self.requests).push((db_id, sql_text.to_string()));
        if self.fail {
            return Err(HealthcheckError::Advice("advisor unavailable".to_string()));
        }
        Ok(format!("advice for {sql_text}"))
    }
}
