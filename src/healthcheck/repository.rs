use super::error::{HealthcheckError, Result};
use super::models::{EngineConfig, HealthcheckResult, ItemConfig, OperationRecord, OperationStatus};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::MySqlPool;
use std::collections::BTreeMap;
#[cfg(any(test, feature = "test-utils"))]
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Persistence of engine configuration, operation lifecycle and results.
#[async_trait]
pub trait HealthcheckRepository: Send + Sync + std::fmt::Debug {
    /// Every active item configuration. Validation is left to the caller.
    async fn load_engine_config(&self) -> Result<EngineConfig>;
    /// True if a running operation exists for the server.
    async fn is_running(&self, mysql_server_id: i64) -> Result<bool>;
    /// Inserts a running operation and returns its id.
    async fn init_operation(
        &self,
        mysql_server_id: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        step: Duration,
    ) -> Result<i64>;
    async fn update_operation_status(
        &self,
        operation_id: i64,
        status: OperationStatus,
        message: &str,
    ) -> Result<()>;
    async fn get_operation(&self, operation_id: i64) -> Result<OperationRecord>;
    async fn save_result(&self, result: &HealthcheckResult) -> Result<()>;
    /// Fails with `NotFound` on zero rows and `Duplicate` on more than one.
    async fn get_result_by_operation_id(&self, operation_id: i64) -> Result<HealthcheckResult>;
    async fn update_accuracy_review(&self, operation_id: i64, review: i32) -> Result<()>;
}

const RESULT_COLUMNS: &str = "id, operation_id, weighted_average_score, \
    db_config_score, db_config_data, db_config_high, db_config_advice, \
    cpu_usage_score, cpu_usage_data, cpu_usage_high, \
    io_util_score, io_util_data, io_util_high, \
    disk_capacity_usage_score, disk_capacity_usage_data, disk_capacity_usage_high, \
    connection_usage_score, connection_usage_data, connection_usage_high, \
    average_active_session_percents_score, average_active_session_percents_data, average_active_session_percents_high, \
    cache_miss_ratio_score, cache_miss_ratio_data, cache_miss_ratio_high, \
    table_rows_score, table_rows_data, table_rows_high, \
    table_size_score, table_size_data, table_size_high, \
    slow_query_score, slow_query_data, slow_query_high, slow_query_advice, \
    accuracy_review";

fn step_seconds(step: Duration) -> i64 {
    i64::try_from(step.as_secs()).unwrap_or(i64::MAX)
}

fn single_result(operation_id: i64, mut rows: Vec<HealthcheckResult>) -> Result<HealthcheckResult> {
    match rows.len() {
        0 => Err(HealthcheckError::NotFound { operation_id }),
        1 => Ok(rows.remove(0)),
        _ => Err(HealthcheckError::Duplicate { operation_id }),
    }
}

/// MySQL implementation over the DAS metadata database.
#[derive(Debug, Clone)]
pub struct MySqlHealthcheckRepository {
    pool: Arc<MySqlPool>,
}

impl MySqlHealthcheckRepository {
    pub fn new(pool: Arc<MySqlPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthcheckRepository for MySqlHealthcheckRepository {
    async fn load_engine_config(&self) -> Result<EngineConfig> {
        let sql = "SELECT id, item_name, item_weight, low_watermark, high_watermark, unit, \
                   score_deduction_per_unit_high, max_score_deduction_high, \
                   score_deduction_per_unit_medium, max_score_deduction_medium \
                   FROM t_hc_default_engine_config WHERE del_flag = 0";
        debug!("Loading engine config: {}", sql);

        let items = sqlx::query_as::<_, ItemConfig>(sql)
            .fetch_all(self.pool.as_ref())
            .await?;

        Ok(EngineConfig::new(items))
    }

    async fn is_running(&self, mysql_server_id: i64) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM t_hc_operation_info \
             WHERE del_flag = 0 AND mysql_server_id = ? AND status = ?",
        )
        .bind(mysql_server_id)
        .bind(OperationStatus::Running.code())
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(count != 0)
    }

    async fn init_operation(
        &self,
        mysql_server_id: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        step: Duration,
    ) -> Result<i64> {
        debug!(
            "Creating operation for mysql server {} window [{}, {}) step {:?}",
            mysql_server_id, start_time, end_time, step
        );
        let result = sqlx::query(
            "INSERT INTO t_hc_operation_info (mysql_server_id, start_time, end_time, step, status) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(mysql_server_id)
        .bind(start_time.trunc_subsecs(0))
        .bind(end_time.trunc_subsecs(0))
        .bind(step_seconds(step))
        .bind(OperationStatus::Running.code())
        .execute(self.pool.as_ref())
        .await?;

        i64::try_from(result.last_insert_id()).map_err(|_| {
            HealthcheckError::InvalidData(format!(
                "operation id {} is out of range",
                result.last_insert_id()
            ))
        })
    }

    async fn update_operation_status(
        &self,
        operation_id: i64,
        status: OperationStatus,
        message: &str,
    ) -> Result<()> {
        debug!(
            "Updating operation {} status to {:?}: {}",
            operation_id, status, message
        );
        let result = sqlx::query("UPDATE t_hc_operation_info SET status = ?, message = ? WHERE id = ?")
            .bind(status.code())
            .bind(message)
            .bind(operation_id)
            .execute(self.pool.as_ref())
            .await?;

        if result.rows_affected() == 0 {
            return Err(HealthcheckError::InvalidData(format!(
                "operation {operation_id} does not exist"
            )));
        }
        Ok(())
    }

    async fn get_operation(&self, operation_id: i64) -> Result<OperationRecord> {
        sqlx::query_as::<_, OperationRecord>(
            "SELECT id, mysql_server_id, start_time, end_time, step, status, message \
             FROM t_hc_operation_info WHERE del_flag = 0 AND id = ?",
        )
        .bind(operation_id)
        .fetch_optional(self.pool.as_ref())
        .await?
        .ok_or(HealthcheckError::NotFound { operation_id })
    }

    async fn save_result(&self, result: &HealthcheckResult) -> Result<()> {
        debug!("Saving result of operation {}", result.operation_id);
        sqlx::query(
            "INSERT INTO t_hc_result (operation_id, weighted_average_score, \
             db_config_score, db_config_data, db_config_high, db_config_advice, \
             cpu_usage_score, cpu_usage_data, cpu_usage_high, \
             io_util_score, io_util_data, io_util_high, \
             disk_capacity_usage_score, disk_capacity_usage_data, disk_capacity_usage_high, \
             connection_usage_score, connection_usage_data, connection_usage_high, \
             average_active_session_percents_score, average_active_session_percents_data, average_active_session_percents_high, \
             cache_miss_ratio_score, cache_miss_ratio_data, cache_miss_ratio_high, \
             table_rows_score, table_rows_data, table_rows_high, \
             table_size_score, table_size_data, table_size_high, \
             slow_query_score, slow_query_data, slow_query_high, slow_query_advice, \
             accuracy_review) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(result.operation_id)
        .bind(result.weighted_average_score)
        .bind(result.db_config_score)
        .bind(&result.db_config_data)
        .bind(&result.db_config_high)
        .bind(&result.db_config_advice)
        .bind(result.cpu_usage_score)
        .bind(&result.cpu_usage_data)
        .bind(&result.cpu_usage_high)
        .bind(result.io_util_score)
        .bind(&result.io_util_data)
        .bind(&result.io_util_high)
        .bind(result.disk_capacity_usage_score)
        .bind(&result.disk_capacity_usage_data)
        .bind(&result.disk_capacity_usage_high)
        .bind(result.connection_usage_score)
        .bind(&result.connection_usage_data)
        .bind(&result.connection_usage_high)
        .bind(result.average_active_session_percents_score)
        .bind(&result.average_active_session_percents_data)
        .bind(&result.average_active_session_percents_high)
        .bind(result.cache_miss_ratio_score)
        .bind(&result.cache_miss_ratio_data)
        .bind(&result.cache_miss_ratio_high)
        .bind(result.table_rows_score)
        .bind(&result.table_rows_data)
        .bind(&result.table_rows_high)
        .bind(result.table_size_score)
        .bind(&result.table_size_data)
        .bind(&result.table_size_high)
        .bind(result.slow_query_score)
        .bind(&result.slow_query_data)
        .bind(&result.slow_query_high)
        .bind(&result.slow_query_advice)
        .bind(result.accuracy_review)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn get_result_by_operation_id(&self, operation_id: i64) -> Result<HealthcheckResult> {
        let sql = format!(
            "SELECT {RESULT_COLUMNS} FROM t_hc_result \
             WHERE del_flag = 0 AND operation_id = ? ORDER BY id"
        );
        let rows = sqlx::query_as::<_, HealthcheckResult>(&sql)
            .bind(operation_id)
            .fetch_all(self.pool.as_ref())
            .await?;

        single_result(operation_id, rows)
    }

    async fn update_accuracy_review(&self, operation_id: i64, review: i32) -> Result<()> {
        debug!("Updating accuracy review of operation {} to {}", operation_id, review);
        let result = sqlx::query(
            "UPDATE t_hc_result SET accuracy_review = ? WHERE del_flag = 0 AND operation_id = ?",
        )
        .bind(review)
        .bind(operation_id)
        .execute(self.pool.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(HealthcheckError::NotFound { operation_id });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    items: Vec<ItemConfig>,
    operations: BTreeMap<i64, OperationRecord>,
    results: Vec<HealthcheckResult>,
    next_operation_id: i64,
    next_result_id: i64,
}

/// Repository kept entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryHealthcheckRepository {
    state: Mutex<InMemoryState>,
    #[cfg(any(test, feature = "test-utils"))]
    fail_save_result: AtomicBool,
}

impl InMemoryHealthcheckRepository {
    pub fn new(items: Vec<ItemConfig>) -> Self {
        Self {
            state: Mutex::new(InMemoryState {
                items,
                ..InMemoryState::default()
            }),
            #[cfg(any(test, feature = "test-utils"))]
            fail_save_result: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent `save_result` fail.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn fail_save_result(&self, fail: bool) {
        self.fail_save_result.store(fail, Ordering::SeqCst);
    }

    pub async fn operations(&self) -> Vec<OperationRecord> {
        self.state.lock().await.operations.values().cloned().collect()
    }

    pub async fn results(&self) -> Vec<HealthcheckResult> {
        self.state.lock().await.results.clone()
    }

    /// Inserts a result row verbatim, bypassing the engine.
    pub async fn insert_result(&self, result: HealthcheckResult) {
        let mut state = self.state.lock().await;
        state.next_result_id += 1;
        let id = state.next_result_id;
        state.results.push(HealthcheckResult { id, ..result });
    }
}

#[async_trait]
impl HealthcheckRepository for InMemoryHealthcheckRepository {
    async fn load_engine_config(&self) -> Result<EngineConfig> {
        Ok(EngineConfig::new(self.state.lock().await.items.clone()))
    }

    async fn is_running(&self, mysql_server_id: i64) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.operations.values().any(|op| {
            op.mysql_server_id == mysql_server_id && op.status == OperationStatus::Running.code()
        }))
    }

    async fn init_operation(
        &self,
        mysql_server_id: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        step: Duration,
    ) -> Result<i64> {
        let mut state = self.state.lock().await;
        state.next_operation_id += 1;
        let id = state.next_operation_id;
        state.operations.insert(
            id,
            OperationRecord {
                id,
                mysql_server_id,
                start_time,
                end_time,
                step: step_seconds(step),
                status: OperationStatus::Running.code(),
                message: None,
            },
        );
        Ok(id)
    }

    async fn update_operation_status(
        &self,
        operation_id: i64,
        status: OperationStatus,
        message: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let operation = state.operations.get_mut(&operation_id).ok_or_else(|| {
            HealthcheckError::InvalidData(format!("operation {operation_id} does not exist"))
        })?;
        operation.status = status.code();
        operation.message = Some(message.to_string());
        Ok(())
    }

    async fn get_operation(&self, operation_id: i64) -> Result<OperationRecord> {
        self.state
            .lock()
            .await
            .operations
            .get(&operation_id)
            .cloned()
            .ok_or(HealthcheckError::NotFound { operation_id })
    }

    async fn save_result(&self, result: &HealthcheckResult) -> Result<()> {
        #[cfg(any(test, feature = "test-utils"))]
        if self.fail_save_result.load(Ordering::SeqCst) {
            return Err(HealthcheckError::InvalidData(
                "result table is not writable".to_string(),
            ));
        }
        self.insert_result(result.clone()).await;
        Ok(())
    }

    async fn get_result_by_operation_id(&self, operation_id: i64) -> Result<HealthcheckResult> {
        let rows = self
            .state
            .lock()
            .await
            .results
            .iter()
            .filter(|r| r.operation_id == operation_id)
            .cloned()
            .collect();
        single_result(operation_id, rows)
    }

    async fn update_accuracy_review(&self, operation_id: i64, review: i32) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut updated = 0;
        for result in state.results.iter_mut().filter(|r| r.operation_id == operation_id) {
            result.accuracy_review = review;
            updated += 1;
        }
        if updated == 0 {
            return Err(HealthcheckError::NotFound { operation_id });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2021, 10, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2021, 10, 2, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_operation_lifecycle() {
        let repo = InMemoryHealthcheckRepository::default();
        let (start, end) = window();

        assert!(!repo.is_running(1).await.unwrap());
        let id = repo
            .init_operation(1, start, end, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(repo.is_running(1).await.unwrap());
        assert!(!repo.is_running(2).await.unwrap());

        let record = repo.get_operation(id).await.unwrap();
        assert_eq!(record.operation_status().unwrap(), OperationStatus::Running);
        assert_eq!(record.step, 60);

        repo.update_operation_status(id, OperationStatus::Failed, "boom")
            .await
            .unwrap();
        assert!(!repo.is_running(1).await.unwrap());
        let record = repo.get_operation(id).await.unwrap();
        assert_eq!(record.status, 3);
        assert_eq!(record.message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_result_lookup_cardinality() {
        let repo = InMemoryHealthcheckRepository::default();

        assert!(matches!(
            repo.get_result_by_operation_id(9).await,
            Err(HealthcheckError::NotFound { operation_id: 9 })
        ));

        repo.save_result(&HealthcheckResult::new(9)).await.unwrap();
        let found = repo.get_result_by_operation_id(9).await.unwrap();
        assert_eq!(found.operation_id, 9);
        assert_eq!(found.id, 1);

        repo.insert_result(HealthcheckResult::new(9)).await;
        assert!(matches!(
            repo.get_result_by_operation_id(9).await,
            Err(HealthcheckError::Duplicate { operation_id: 9 })
        ));
    }

    #[tokio::test]
    async fn test_accuracy_review_requires_a_result() {
        let repo = InMemoryHealthcheckRepository::default();
        assert!(repo.update_accuracy_review(4, 1).await.is_err());

        repo.save_result(&HealthcheckResult::new(4)).await.unwrap();
        repo.update_accuracy_review(4, 1).await.unwrap();
        assert_eq!(
            repo.get_result_by_operation_id(4).await.unwrap().accuracy_review,
            1
        );
    }

    #[tokio::test]
    async fn test_save_result_failure_injection() {
        let repo = InMemoryHealthcheckRepository::default();
        repo.fail_save_result(true);
        assert!(repo.save_result(&HealthcheckResult::new(1)).await.is_err());
        assert!(repo.results().await.is_empty());
    }
}
