use crate::{
    advisor::HttpSqlAdvisor,
    healthcheck::{ConnectingSourceFactory, HealthcheckService, MySqlHealthcheckRepository},
    metadata::MySqlMetadataResolver,
    monitoring::HealthcheckMetrics,
    Config,
};
use anyhow::{Context, Result};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::sync::Arc;
use tracing::info;

/// Pool over the DAS metadata database
pub async fn create_pool(config: &Config) -> Result<MySqlPool> {
    let pool = MySqlPoolOptions::new()
        .max_connections(config.operational.max_db_connections)
        .acquire_timeout(config.connect_timeout())
        .connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to connect to {}", config.safe_database_url()))?;

    info!(
        "Connected to metadata database {} with {} max connections",
        config.safe_database_url(),
        config.operational.max_db_connections
    );
    Ok(pool)
}

/// Dependency injection container for the application
pub struct DependencyContainer {
    pub config: Config,
    pub db_pool: Arc<MySqlPool>,
    pub metrics: Option<Arc<HealthcheckMetrics>>,
    pub service: Arc<HealthcheckService>,
}

impl DependencyContainer {
    pub async fn new(config: Config) -> Result<Self> {
        info!("🔧 Initializing dependency container...");
        config.validate()?;

        let db_pool = Arc::new(create_pool(&config).await?);

        let repository = Arc::new(MySqlHealthcheckRepository::new(db_pool.clone()));
        let metadata = Arc::new(MySqlMetadataResolver::new(db_pool.clone()));
        let advisor = Arc::new(
            HttpSqlAdvisor::new(&config.advisor.base_url, config.advisor_timeout())
                .context("Failed to create SQL advisor client")?,
        );
        let factory = Arc::new(ConnectingSourceFactory::new(config.to_source_settings()));

        let metrics = if config.operational.enable_metrics {
            Some(Arc::new(HealthcheckMetrics::new()?))
        } else {
            None
        };

        let mut service = HealthcheckService::new(repository, metadata, advisor, factory);
        if let Some(metrics) = &metrics {
            service = service.with_metrics(metrics.clone());
        }

        Ok(Self {
            config,
            db_pool,
            metrics,
            service: Arc::new(service),
        })
    }
}
