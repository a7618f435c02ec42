use crate::application::DependencyContainer;
use crate::healthcheck::OperationStatus;
use crate::Config;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Server to diagnose, by id or by address
#[derive(Debug, Clone)]
pub enum CheckTarget {
    ServerId(i64),
    HostInfo { host_ip: String, port_num: i32 },
}

/// Clean separation of command handling logic from main.rs
pub struct HealthcheckCommandHandler {
    container: Arc<DependencyContainer>,
}

impl HealthcheckCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    /// Runs one check and waits for it to finish
    pub async fn check(
        &self,
        target: CheckTarget,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        step_seconds: u64,
    ) -> Result<()> {
        let step = Duration::from_secs(step_seconds);
        let service = &self.container.service;

        let handle = match &target {
            CheckTarget::ServerId(id) => service.check(*id, start_time, end_time, step).await?,
            CheckTarget::HostInfo { host_ip, port_num } => {
                service
                    .check_by_host_info(host_ip, *port_num, start_time, end_time, step)
                    .await?
            }
        };
        info!("🚀 Healthcheck started, operation_id: {}", handle.operation_id());

        let outcome = handle.wait().await?;
        match outcome.weighted_average_score {
            Some(score) => info!(
                "✅ Operation {} succeeded, weighted average score: {}",
                outcome.operation_id, score
            ),
            None => error!(
                "❌ Operation {} failed: {}",
                outcome.operation_id, outcome.message
            ),
        }
        if !outcome.close_errors.is_empty() {
            error!(
                "⚠️  Connections failed to close: {}",
                outcome.close_errors.join(", ")
            );
        }

        if let Some(metrics) = &self.container.metrics {
            debug!("Run metrics:\n{}", metrics.gather_text());
        }

        if !outcome.succeeded() {
            return Err(anyhow::anyhow!(outcome.message));
        }
        Ok(())
    }

    pub async fn result(&self, operation_id: i64) -> Result<()> {
        let result = self
            .container
            .service
            .get_result_by_operation_id(operation_id)
            .await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        Ok(())
    }

    pub async fn review(&self, operation_id: i64, review: i32) -> Result<()> {
        self.container
            .service
            .review_accuracy(operation_id, review)
            .await?;
        info!("✅ Accuracy review of operation {} set to {}", operation_id, review);
        Ok(())
    }

    pub async fn status(&self, operation_id: i64) -> Result<()> {
        let operation = self.container.service.get_operation(operation_id).await?;
        let status = operation.operation_status()?;
        let label = match status {
            OperationStatus::Running => "running",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
        };
        println!(
            "operation {}: {} ({} -> {}, step {}s)",
            operation.id, label, operation.start_time, operation.end_time, operation.step
        );
        if let Some(message) = operation.message {
            println!("  {message}");
        }
        Ok(())
    }
}

pub struct ConfigCommandHandler {
    config: Config,
}

impl ConfigCommandHandler {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn diagnose(&self) -> Result<()> {
        println!("{}", self.config.create_diagnostic_report());
        Ok(())
    }
}
