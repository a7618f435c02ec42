pub mod db_config;
pub mod engine;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod models;
pub mod mount;
pub mod repository;
pub mod scorer;
pub mod service;
pub mod sources;

pub use engine::{DefaultEngine, EnginePhase, RunHandle, RunOutcome};
pub use error::{CloseErrors, HealthcheckError, Result};
pub use models::{
    CheckItem, EngineConfig, HealthcheckResult, ItemConfig, MonitorGeneration, MonitorSystem,
    MySQLServer, OperationInfo, OperationRecord, OperationStatus,
};
pub use repository::{HealthcheckRepository, InMemoryHealthcheckRepository, MySqlHealthcheckRepository};
pub use service::HealthcheckService;
pub use sources::{ConnectingSourceFactory, MonitorBackend, SourceFactory, SourceSettings};
