use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HealthcheckError {
    #[error("Invalid engine configuration: {0}")]
    ConfigInvalid(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response from {backend}: {message}")]
    BackendResponse { backend: String, message: String },

    #[error("Mount point resolution failed: {0}")]
    Resolution(String),

    #[error("Monitor system type should be either 1 or 2, {0} is not valid")]
    BackendUnsupported(i32),

    #[error("Healthcheck of mysql server is still running. mysql server id: {mysql_server_id}")]
    Conflict { mysql_server_id: i64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Healthcheck result does not exist, operation_id: {operation_id}")]
    NotFound { operation_id: i64 },

    #[error("Duplicate healthcheck results exist, operation_id: {operation_id}")]
    Duplicate { operation_id: i64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Metadata lookup failed: {0}")]
    Metadata(String),

    #[error("SQL advisor failed: {0}")]
    Advice(String),

    #[error("Healthcheck task failed: {0}")]
    Task(String),
}

impl HealthcheckError {
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BackendResponse {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// True for failures raised while fetching observations from a backend.
    pub fn is_adapter_error(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Http(_) | Self::BackendResponse { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, HealthcheckError>;

/// Accumulates teardown failures so every connection that failed to close is reported.
#[derive(Debug, Default)]
pub struct CloseErrors {
    errors: Vec<(String, HealthcheckError)>,
}

impl CloseErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, connection: impl Into<String>, error: HealthcheckError) {
        self.errors.push((connection.into(), error));
    }

    /// Records the error of `result`, if any.
    pub fn collect(&mut self, connection: &str, result: Result<()>) {
        if let Err(e) = result {
            self.push(connection, e);
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn connections(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(|(name, _)| name.as_str())
    }
}

impl fmt::Display for CloseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred", self.errors.len())?;
        for (connection, error) in &self.errors {
            write!(f, "\n\t* {connection}: {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseErrors {}
