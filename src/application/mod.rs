use crate::Config;
use anyhow::Result;
use std::sync::Arc;

pub mod command_handlers;
pub mod dependency_container;

pub use command_handlers::{CheckTarget, ConfigCommandHandler, HealthcheckCommandHandler};
pub use dependency_container::{create_pool, DependencyContainer};

/// Application layer - wires the engine to its collaborators for the CLI
pub struct Application {
    pub container: Arc<DependencyContainer>,
}

impl Application {
    pub async fn new(config: Config) -> Result<Self> {
        let container = Arc::new(DependencyContainer::new(config).await?);
        Ok(Self { container })
    }

    pub async fn shutdown(&self) {
        self.container.db_pool.close().await;
    }
}
