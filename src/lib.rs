pub mod advisor;
pub mod application;
pub mod config;
pub mod healthcheck;
pub mod metadata;
pub mod monitoring;

pub use config::Config;

pub use advisor::{HttpSqlAdvisor, SqlAdvisor};
pub use metadata::{MetadataResolver, MySqlMetadataResolver};

// Re-export healthcheck types for convenience
pub use healthcheck::{
    CheckItem, CloseErrors, ConnectingSourceFactory, DefaultEngine, EngineConfig, EnginePhase,
    HealthcheckError, HealthcheckRepository, HealthcheckResult, HealthcheckService,
    InMemoryHealthcheckRepository, ItemConfig, MonitorBackend, MonitorGeneration, MonitorSystem,
    MySQLServer, MySqlHealthcheckRepository, OperationInfo, OperationRecord, OperationStatus,
    RunHandle, RunOutcome, SourceFactory, SourceSettings,
};

// Re-export monitoring types
pub use monitoring::{HealthcheckMetrics, RunTimer};
