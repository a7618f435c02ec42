use super::engine::{DefaultEngine, RunHandle};
use super::error::{HealthcheckError, Result};
use super::models::{HealthcheckResult, OperationInfo, OperationRecord, OperationStatus};
use super::repository::HealthcheckRepository;
use super::sources::{MonitorBackend, SourceFactory};
use crate::advisor::SqlAdvisor;
use crate::metadata::MetadataResolver;
use crate::monitoring::HealthcheckMetrics;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Rejects empty or inverted windows and a zero step.
pub fn validate_window(start_time: DateTime<Utc>, end_time: DateTime<Utc>, step: Duration) -> Result<()> {
    if start_time >= end_time {
        return Err(HealthcheckError::InvalidRequest(format!(
            "start time {start_time} should be earlier than end time {end_time}"
        )));
    }
    if step.is_zero() {
        return Err(HealthcheckError::InvalidRequest(
            "step should be greater than zero".to_string(),
        ));
    }
    Ok(())
}

/// Entry point for callers: admits checks and serves their results.
///
/// Admission is a read of `is_running` followed by an insert, without a
/// lock in between. Two concurrent checks of one server may both pass it.
#[derive(Debug, Clone)]
pub struct HealthcheckService {
    repository: Arc<dyn HealthcheckRepository>,
    metadata: Arc<dyn MetadataResolver>,
    advisor: Arc<dyn SqlAdvisor>,
    factory: Arc<dyn SourceFactory>,
    metrics: Option<Arc<HealthcheckMetrics>>,
}

impl HealthcheckService {
    pub fn new(
        repository: Arc<dyn HealthcheckRepository>,
        metadata: Arc<dyn MetadataResolver>,
        advisor: Arc<dyn SqlAdvisor>,
        factory: Arc<dyn SourceFactory>,
    ) -> Self {
        Self {
            repository,
            metadata,
            advisor,
            factory,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthcheckMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Creates an operation for the server and starts its run in the
    /// background. The returned handle carries the operation id.
    pub async fn check(
        &self,
        mysql_server_id: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        step: Duration,
    ) -> Result<RunHandle> {
        validate_window(start_time, end_time, step)?;

        if self.repository.is_running(mysql_server_id).await? {
            if let Some(metrics) = &self.metrics {
                metrics.admission_conflicts_total.inc();
            }
            warn!(
                "Rejected healthcheck, a run is already active for mysql server {}",
                mysql_server_id
            );
            return Err(HealthcheckError::Conflict { mysql_server_id });
        }

        let operation_id = self
            .repository
            .init_operation(mysql_server_id, start_time, end_time, step)
            .await?;
        info!(
            "Created operation {} for mysql server {}",
            operation_id, mysql_server_id
        );
        if let Some(metrics) = &self.metrics {
            metrics.runs_started_total.inc();
        }

        match self
            .build_engine(operation_id, mysql_server_id, start_time, end_time, step)
            .await
        {
            Ok(engine) => Ok(RunHandle::spawn(engine)),
            Err(e) => {
                self.mark_failed(operation_id, &e).await;
                Err(e)
            }
        }
    }

    pub async fn check_by_host_info(
        &self,
        host_ip: &str,
        port_num: i32,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        step: Duration,
    ) -> Result<RunHandle> {
        let server = self
            .metadata
            .get_mysql_server_by_host_info(host_ip, port_num)
            .await?;
        self.check(server.id, start_time, end_time, step).await
    }

    pub async fn get_result_by_operation_id(&self, operation_id: i64) -> Result<HealthcheckResult> {
        self.repository.get_result_by_operation_id(operation_id).await
    }

    pub async fn get_operation(&self, operation_id: i64) -> Result<OperationRecord> {
        self.repository.get_operation(operation_id).await
    }

    pub async fn review_accuracy(&self, operation_id: i64, review: i32) -> Result<()> {
        self.repository
            .update_accuracy_review(operation_id, review)
            .await?;
        info!(
            "Updated accuracy review of operation {} to {}",
            operation_id, review
        );
        Ok(())
    }

    async fn build_engine(
        &self,
        operation_id: i64,
        mysql_server_id: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        step: Duration,
    ) -> Result<DefaultEngine> {
        let mysql_server = self.metadata.get_mysql_server(mysql_server_id).await?;
        let monitor_system = self.metadata.get_monitor_system(&mysql_server).await?;
        // fails on an unknown generation before any connection is opened
        let backend = MonitorBackend::select(&monitor_system)?;
        info!(
            "Operation {} uses monitor system {} ({:?})",
            operation_id, monitor_system.id, backend.generation
        );

        let operation = OperationInfo::new(
            operation_id,
            mysql_server,
            monitor_system,
            start_time,
            end_time,
            step,
        );
        let sources = self.factory.connect(&operation).await?;

        let engine = DefaultEngine::new(
            operation,
            sources,
            self.repository.clone(),
            self.metadata.clone(),
            self.advisor.clone(),
        );
        Ok(match &self.metrics {
            Some(metrics) => engine.with_metrics(metrics.clone()),
            None => engine,
        })
    }

    async fn mark_failed(&self, operation_id: i64, cause: &HealthcheckError) {
        error!("Operation {} failed to start: {}", operation_id, cause);
        if let Some(metrics) = &self.metrics {
            metrics.runs_failed_total.inc();
        }
        if let Err(e) = self
            .repository
            .update_operation_status(operation_id, OperationStatus::Failed, &cause.to_string())
            .await
        {
            error!(
                "Failed to update operation status. operation_id: {}: {}",
                operation_id, e
            );
        }
    }
}
