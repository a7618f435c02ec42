//! Diagnostic orchestrator.
//!
//! One `DefaultEngine` drives one operation through
//! `Created -> Preparing -> Running(item) -> Summarizing -> Persisting` and
//! ends in `Succeeded` or `Failed`. Connections are torn down after the run
//! regardless of its outcome, then the operation status is written once.

use super::db_config::DbConfigExpectations;
use super::error::{CloseErrors, HealthcheckError, Result};
use super::models::{
    CheckItem, EngineConfig, HealthcheckResult, ItemConfig, OperationInfo, OperationStatus,
    SlowQuery, Table,
};
use super::mount::{self, StorageLayout};
use super::repository::HealthcheckRepository;
use super::scorer::{score_observations, ScoredItem};
use super::sources::Sources;
use crate::advisor::SqlAdvisor;
use crate::metadata::{MetadataResolver, MYSQL_CLUSTER_TYPE};
use crate::monitoring::{HealthcheckMetrics, RunTimer};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const ENGINE_NAME: &str = "default";
/// Number of ranked slow queries sent to the advisor.
pub const TOP_SLOW_QUERIES: usize = 3;

const APPLICATION_MYSQL: &str = "application_mysql";
const SLOW_QUERY_STORE: &str = "slow_query_store";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Created,
    Preparing,
    Running(CheckItem),
    Summarizing,
    Persisting,
    Succeeded,
    Failed,
}

impl fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnginePhase::Created => f.write_str("created"),
            EnginePhase::Preparing => f.write_str("preparing"),
            EnginePhase::Running(item) => write!(f, "running({item})"),
            EnginePhase::Summarizing => f.write_str("summarizing"),
            EnginePhase::Persisting => f.write_str("persisting"),
            EnginePhase::Succeeded => f.write_str("succeeded"),
            EnginePhase::Failed => f.write_str("failed"),
        }
    }
}

/// Final state of one run as seen by whoever awaits it.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub operation_id: i64,
    pub status: OperationStatus,
    pub weighted_average_score: Option<i32>,
    pub message: String,
    /// Phase the run was in when it failed.
    pub failed_phase: Option<EnginePhase>,
    /// Connections that failed to close.
    pub close_errors: Vec<String>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == OperationStatus::Succeeded
    }
}

#[derive(Debug)]
pub struct DefaultEngine {
    operation: OperationInfo,
    sources: Sources,
    repository: Arc<dyn HealthcheckRepository>,
    metadata: Arc<dyn MetadataResolver>,
    advisor: Arc<dyn SqlAdvisor>,
    metrics: Option<Arc<HealthcheckMetrics>>,

    phase: EnginePhase,
    config: EngineConfig,
    layout: StorageLayout,
    result: HealthcheckResult,
    large_tables: Option<Vec<Table>>,
    top_slow_queries: Vec<SlowQuery>,
}

impl DefaultEngine {
    pub fn new(
        operation: OperationInfo,
        sources: Sources,
        repository: Arc<dyn HealthcheckRepository>,
        metadata: Arc<dyn MetadataResolver>,
        advisor: Arc<dyn SqlAdvisor>,
    ) -> Self {
        let result = HealthcheckResult::new(operation.operation_id());
        Self {
            operation,
            sources,
            repository,
            metadata,
            advisor,
            metrics: None,
            phase: EnginePhase::Created,
            config: EngineConfig::default(),
            layout: StorageLayout::default(),
            result,
            large_tables: None,
            top_slow_queries: Vec::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthcheckMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn operation_id(&self) -> i64 {
        self.operation.operation_id()
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    /// Runs every phase, tears down the sources and records the final status.
    pub async fn run(mut self) -> RunOutcome {
        let operation_id = self.operation_id();
        let timer = self.metrics.clone().map(RunTimer::new);
        info!(
            "Healthcheck started. engine: {}, operation_id: {}, mysql server: {}",
            ENGINE_NAME,
            operation_id,
            self.operation.service_name()
        );

        let outcome = self.execute().await;
        let failed_phase = outcome.is_err().then_some(self.phase);

        let close_errors = self.close_sources().await;
        if !close_errors.is_empty() {
            error!(
                "Healthcheck closing connections failed. operation_id: {}: {}",
                operation_id, close_errors
            );
        }

        let (status, message, score) = match outcome {
            Ok(score) => {
                self.enter(EnginePhase::Succeeded);
                (
                    OperationStatus::Succeeded,
                    format!(
                        "healthcheck completed successfully. engine: {ENGINE_NAME}, operation_id: {operation_id}"
                    ),
                    Some(score),
                )
            }
            Err(e) => {
                error!(
                    "Healthcheck failed in phase {}. operation_id: {}: {}",
                    self.phase, operation_id, e
                );
                self.enter(EnginePhase::Failed);
                (OperationStatus::Failed, e.to_string(), None)
            }
        };

        if let Err(e) = self
            .repository
            .update_operation_status(operation_id, status, &message)
            .await
        {
            error!(
                "Failed to update operation status. operation_id: {}: {}",
                operation_id, e
            );
        }

        if let (Some(metrics), Some(timer)) = (&self.metrics, &timer) {
            metrics.record_close_failures(close_errors.len());
            metrics.record_run(timer.start(), score);
        }

        RunOutcome {
            operation_id,
            status,
            weighted_average_score: score,
            message,
            failed_phase,
            close_errors: close_errors.connections().map(str::to_string).collect(),
        }
    }

    async fn execute(&mut self) -> Result<i32> {
        self.prepare().await?;

        for item in CheckItem::ALL {
            self.enter(EnginePhase::Running(item));
            self.check(item).await?;
        }

        self.enter(EnginePhase::Summarizing);
        self.result.slow_query_advice = self.correlate_advice().await?;
        let score = self.result.summarize(&self.config)?;
        info!(
            "Weighted average score of operation {} is {}",
            self.operation_id(),
            score
        );

        self.enter(EnginePhase::Persisting);
        self.repository.save_result(&self.result).await?;
        Ok(score)
    }

    fn enter(&mut self, phase: EnginePhase) {
        info!(
            "Operation {} phase {} -> {}",
            self.operation_id(),
            self.phase,
            phase
        );
        self.phase = phase;
    }

    async fn prepare(&mut self) -> Result<()> {
        self.enter(EnginePhase::Preparing);

        let config = self.repository.load_engine_config().await?;
        config.validate()?;
        self.config = config;

        let file_systems = self.sources.telemetry.get_file_systems().await?;
        let dirs = self.sources.config.get_mysql_dirs().await?;
        self.layout = mount::resolve(&dirs, &file_systems)?;
        info!(
            "Operation {} resolved mount points {:?} on devices {:?}",
            self.operation_id(),
            self.layout.mount_points,
            self.layout.devices
        );
        Ok(())
    }

    async fn check(&mut self, item: CheckItem) -> Result<()> {
        let item_config = self.config.get(item)?.clone();
        let scored = match item {
            CheckItem::DbConfig => self.check_db_config(&item_config).await?,
            CheckItem::CpuUsage => {
                let datas = self.sources.telemetry.get_cpu_usage().await?;
                score_observations(&datas, &item_config, |d| d.value)?
            }
            CheckItem::IoUtil => {
                let datas = self.sources.telemetry.get_io_util().await?;
                score_observations(&datas, &item_config, |d| d.value)?
            }
            CheckItem::DiskCapacityUsage => {
                let datas = self
                    .sources
                    .telemetry
                    .get_disk_capacity_usage(&self.layout.mount_points)
                    .await?;
                score_observations(&datas, &item_config, |d| d.value)?
            }
            CheckItem::ConnectionUsage => {
                let datas = self.sources.telemetry.get_connection_usage().await?;
                score_observations(&datas, &item_config, |d| d.value)?
            }
            CheckItem::AverageActiveSessionPercents => {
                let datas = self
                    .sources
                    .telemetry
                    .get_average_active_session_percents()
                    .await?;
                score_observations(&datas, &item_config, |d| d.value)?
            }
            CheckItem::CacheMissRatio => {
                let datas = self.sources.telemetry.get_cache_miss_ratio().await?;
                score_observations(&datas, &item_config, |d| d.value)?
            }
            CheckItem::TableRows => {
                let tables = self.large_tables().await?;
                score_observations(&tables, &item_config, |t| t.table_rows as f64)?
            }
            CheckItem::TableSize => {
                let tables = self.large_tables().await?;
                score_observations(&tables, &item_config, |t| t.table_size)?
            }
            CheckItem::SlowQueryRowsExamined => {
                debug!(
                    "Operation {} reads slow queries from {:?}",
                    self.operation_id(),
                    self.sources.slow_query.kind()
                );
                let queries = self.sources.slow_query.get_slow_queries().await?;
                let scored =
                    score_observations(&queries, &item_config, |q| q.rows_examined_max as f64)?;
                self.top_slow_queries = queries.into_iter().take(TOP_SLOW_QUERIES).collect();
                scored
            }
        };

        debug!(
            "Operation {} item {} scored {}",
            self.operation_id(),
            item,
            scored.score
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_item_score(item, scored.score);
        }
        self.result.set_item(item, scored.score, scored.data, scored.high);
        Ok(())
    }

    async fn check_db_config(&mut self, item_config: &ItemConfig) -> Result<ScoredItem> {
        let server = self.operation.mysql_server();
        let expectations = DbConfigExpectations::for_server(&server.host_ip, server.port_num);
        let variables = self
            .sources
            .config
            .get_variables(&expectations.variable_names())
            .await?;

        let report = expectations.evaluate(&variables, item_config)?;
        if !report.mismatches.is_empty() {
            warn!(
                "Operation {} found {} misconfigured variables",
                self.operation_id(),
                report.mismatches.len()
            );
        }
        self.result.db_config_advice = report.advice;
        Ok(report.scored)
    }

    /// Large tables are read once and shared by the row and size checks.
    async fn large_tables(&mut self) -> Result<Vec<Table>> {
        if let Some(tables) = &self.large_tables {
            return Ok(tables.clone());
        }
        let tables = self.sources.config.get_large_tables().await?;
        self.large_tables = Some(tables.clone());
        Ok(tables)
    }

    /// Advice for the top ranked slow queries. Queries without a database
    /// name are reported as the raw record.
    async fn correlate_advice(&mut self) -> Result<String> {
        let cluster_id = self.operation.mysql_server().cluster_id;
        let mut advices = Vec::with_capacity(self.top_slow_queries.len());

        for query in &self.top_slow_queries {
            if query.db_name.is_empty() {
                advices.push(serde_json::to_string(query)?);
                continue;
            }
            let db_id = self
                .metadata
                .get_db_id(&query.db_name, cluster_id, MYSQL_CLUSTER_TYPE)
                .await?;
            let advice = self.advisor.advise(db_id, &query.example).await?;
            advices.push(advice);
        }

        Ok(advices.join(","))
    }

    async fn close_sources(&mut self) -> CloseErrors {
        let mut errors = CloseErrors::new();
        errors.collect(APPLICATION_MYSQL, self.sources.config.close().await);
        errors.collect(SLOW_QUERY_STORE, self.sources.slow_query.close().await);
        errors
    }
}

/// Completion handle of a run spawned onto the runtime.
///
/// Dropping the handle (or calling `detach`) leaves the run going in the
/// background. A run cannot be cancelled through it.
#[derive(Debug)]
pub struct RunHandle {
    operation_id: i64,
    handle: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn spawn(engine: DefaultEngine) -> Self {
        let operation_id = engine.operation_id();
        Self {
            operation_id,
            handle: tokio::spawn(engine.run()),
        }
    }

    pub fn operation_id(&self) -> i64 {
        self.operation_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> Result<RunOutcome> {
        self.handle
            .await
            .map_err(|e| HealthcheckError::Task(format!("operation {}: {e}", self.operation_id)))
    }

    pub fn detach(self) -> i64 {
        self.operation_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healthcheck::mock::{self, MockMetadataResolver, MockSourceSet, MockSqlAdvisor};
    use crate::healthcheck::models::{FileSystem, PrometheusData};
    use crate::healthcheck::repository::InMemoryHealthcheckRepository;
    use crate::healthcheck::sources::SlowQueryStoreKind;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use tracing_test::traced_test;

    struct Fixture {
        repository: Arc<InMemoryHealthcheckRepository>,
        advisor: Arc<MockSqlAdvisor>,
        operation_id: i64,
    }

    async fn fixture(items: Vec<ItemConfig>) -> Fixture {
        let repository = Arc::new(InMemoryHealthcheckRepository::new(items));
        let operation_id = repository
            .init_operation(
                mock::MYSQL_SERVER_ID,
                Utc.with_ymd_and_hms(2021, 10, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2021, 10, 2, 0, 0, 0).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        Fixture {
            repository,
            advisor: Arc::new(MockSqlAdvisor::new()),
            operation_id,
        }
    }

    fn engine(fixture: &Fixture, sources: &MockSourceSet) -> DefaultEngine {
        DefaultEngine::new(
            mock::operation_info(fixture.operation_id, 2),
            sources.build(SlowQueryStoreKind::Clickhouse),
            fixture.repository.clone(),
            Arc::new(MockMetadataResolver::new()),
            fixture.advisor.clone(),
        )
    }

    #[tokio::test]
    async fn test_healthy_target_scores_100() {
        let fixture = fixture(mock::engine_config_items()).await;
        let sources = MockSourceSet::healthy();

        let outcome = engine(&fixture, &sources).run().await;

        assert!(outcome.succeeded(), "{}", outcome.message);
        assert_eq!(outcome.weighted_average_score, Some(100));
        assert_eq!(
            outcome.message,
            format!(
                "healthcheck completed successfully. engine: default, operation_id: {}",
                fixture.operation_id
            )
        );

        let result = fixture
            .repository
            .get_result_by_operation_id(fixture.operation_id)
            .await
            .unwrap();
        assert_eq!(result.weighted_average_score, 100);
        assert!(result.db_config_advice.is_empty());

        let operation = fixture.repository.get_operation(fixture.operation_id).await.unwrap();
        assert_eq!(operation.status, OperationStatus::Succeeded.code());
    }

    #[tokio::test]
    async fn test_degraded_cpu_lowers_weighted_score() {
        let fixture = fixture(mock::engine_config_items()).await;
        let mut data = mock::MockData::healthy();
        data.cpu_usage = vec![
            PrometheusData::new("1633046400.000", 100.0),
            PrometheusData::new("1633046460.000", 100.0),
            PrometheusData::new("1633046520.000", 100.0),
        ];
        let sources = MockSourceSet::new(data);

        let outcome = engine(&fixture, &sources).run().await;

        // cpu scores 90, every other item 100, all weighted 10
        assert_eq!(outcome.weighted_average_score, Some(99));
        let result = fixture.repository.results().await.remove(0);
        assert_eq!(result.cpu_usage_score, 90);
        let high: Vec<PrometheusData> = serde_json::from_str(&result.cpu_usage_high).unwrap();
        assert_eq!(high.len(), 3);
    }

    #[tokio::test]
    async fn test_slow_query_advice_is_correlated() {
        let fixture = fixture(mock::engine_config_items()).await;
        let sources = MockSourceSet::healthy();

        engine(&fixture, &sources).run().await;

        let result = fixture.repository.results().await.remove(0);
        let requests = fixture.advisor.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, mock::APP_DB_ID);
        assert!(result.slow_query_advice.starts_with("advice for select"));
        // the query without a database is reported as the raw record
        assert!(result.slow_query_advice.contains(r#""sql_id":"q2""#));
    }

    #[tokio::test]
    async fn test_only_top_three_queries_are_advised() {
        let fixture = fixture(mock::engine_config_items()).await;
        let mut data = mock::MockData::healthy();
        data.slow_queries = (0..5)
            .map(|i| SlowQuery {
                sql_id: format!("q{i}"),
                example: format!("select {i}"),
                db_name: mock::APP_DB_NAME.to_string(),
                rows_examined_max: 1000 - i,
                ..SlowQuery::default()
            })
            .collect();

        engine(&fixture, &MockSourceSet::new(data)).run().await;

        let requests = fixture.advisor.requests();
        let sqls: Vec<&str> = requests.iter().map(|(_, sql)| sql.as_str()).collect();
        assert_eq!(sqls, vec!["select 0", "select 1", "select 2"]);
    }

    #[tokio::test]
    async fn test_adapter_failure_aborts_remaining_checks() {
        let fixture = fixture(mock::engine_config_items()).await;
        let sources = MockSourceSet::healthy().failing_on("get_io_util");

        let outcome = engine(&fixture, &sources).run().await;

        assert_eq!(outcome.status, OperationStatus::Failed);
        assert_eq!(
            outcome.failed_phase,
            Some(EnginePhase::Running(CheckItem::IoUtil))
        );
        assert!(outcome.message.contains("get_io_util"));
        assert!(!sources.calls().contains(&"get_disk_capacity_usage".to_string()));
        assert!(fixture.repository.results().await.is_empty());

        let operation = fixture.repository.get_operation(fixture.operation_id).await.unwrap();
        assert_eq!(operation.status, OperationStatus::Failed.code());
        assert_eq!(operation.message.as_deref(), Some(outcome.message.as_str()));
    }

    #[tokio::test]
    async fn test_invalid_engine_config_fails_before_any_fetch() {
        let mut items = mock::engine_config_items();
        items[0].item_weight -= 1;
        let fixture = fixture(items).await;
        let sources = MockSourceSet::healthy();

        let outcome = engine(&fixture, &sources).run().await;

        assert_eq!(outcome.failed_phase, Some(EnginePhase::Preparing));
        assert!(outcome.message.starts_with("Invalid engine configuration"));
        // only the teardown touched the sources
        assert_eq!(sources.calls(), vec!["close_config", "close_slow_query"]);
    }

    #[tokio::test]
    async fn test_unmatched_directory_fails_resolution() {
        let fixture = fixture(mock::engine_config_items()).await;
        let mut data = mock::MockData::healthy();
        data.file_systems = vec![FileSystem::new("/boot", "/dev/sda2")];

        let outcome = engine(&fixture, &MockSourceSet::new(data)).run().await;

        assert_eq!(outcome.failed_phase, Some(EnginePhase::Preparing));
        assert!(outcome.message.starts_with("Mount point resolution failed"));
    }

    #[tokio::test]
    async fn test_disk_capacity_uses_resolved_mount_points() {
        let fixture = fixture(mock::engine_config_items()).await;
        let sources = MockSourceSet::healthy();

        engine(&fixture, &sources).run().await;

        assert_eq!(
            sources.disk_capacity_mount_points(),
            vec!["/data".to_string(), "/".to_string()]
        );
    }

    #[tokio::test]
    async fn test_large_tables_are_fetched_once() {
        let fixture = fixture(mock::engine_config_items()).await;
        let sources = MockSourceSet::healthy();

        engine(&fixture, &sources).run().await;

        let fetches = sources
            .calls()
            .iter()
            .filter(|c| c.as_str() == "get_large_tables")
            .count();
        assert_eq!(fetches, 1);
    }

    #[tokio::test]
    async fn test_close_errors_do_not_override_success() {
        let fixture = fixture(mock::engine_config_items()).await;
        let sources = MockSourceSet::healthy()
            .failing_close(APPLICATION_MYSQL)
            .failing_close(SLOW_QUERY_STORE);

        let outcome = engine(&fixture, &sources).run().await;

        assert!(outcome.succeeded());
        assert_eq!(
            outcome.close_errors,
            vec![APPLICATION_MYSQL.to_string(), SLOW_QUERY_STORE.to_string()]
        );
    }

    #[tokio::test]
    async fn test_persist_failure_marks_operation_failed() {
        let fixture = fixture(mock::engine_config_items()).await;
        fixture.repository.fail_save_result(true);

        let outcome = engine(&fixture, &MockSourceSet::healthy()).run().await;

        assert_eq!(outcome.failed_phase, Some(EnginePhase::Persisting));
        let operation = fixture.repository.get_operation(fixture.operation_id).await.unwrap();
        assert_eq!(operation.status, OperationStatus::Failed.code());
    }

    #[tokio::test]
    async fn test_metrics_are_recorded() {
        let fixture = fixture(mock::engine_config_items()).await;
        let metrics = Arc::new(HealthcheckMetrics::new().unwrap());

        engine(&fixture, &MockSourceSet::healthy())
            .with_metrics(metrics.clone())
            .run()
            .await;

        assert_eq!(metrics.runs_succeeded_total.get(), 1);
        assert_eq!(metrics.runs_in_flight.get(), 0);
        assert_eq!(
            metrics
                .item_score
                .with_label_values(&["table_rows"])
                .get(),
            100
        );
    }

    #[tokio::test]
    async fn test_spawned_run_can_be_awaited() {
        let fixture = fixture(mock::engine_config_items()).await;
        let handle = RunHandle::spawn(engine(&fixture, &MockSourceSet::healthy()));
        assert_eq!(handle.operation_id(), fixture.operation_id);

        let outcome = handle.wait().await.unwrap();
        assert!(outcome.succeeded());
    }

    #[traced_test]
    #[tokio::test]
    async fn test_failure_is_logged_with_phase() {
        let fixture = fixture(mock::engine_config_items()).await;
        let sources = MockSourceSet::healthy().failing_on("get_slow_queries");

        engine(&fixture, &sources).run().await;

        assert!(logs_contain("failed in phase running(slow_query_rows_examined)"));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_slow_query_store_is_logged() {
        let fixture = fixture(mock::engine_config_items()).await;

        engine(&fixture, &MockSourceSet::healthy()).run().await;

        assert!(logs_contain("reads slow queries from Clickhouse"));
    }
}
