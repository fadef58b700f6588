use std::time::Duration;

/// Relational store unreachable or returned something we cannot use.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog query failed: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TimeSeriesError {
    #[error("time-series store timed out after {0:?}")]
    Timeout(Duration),
    #[error("time-series request failed: {0}")]
    Transport(reqwest::Error),
    #[error("time-series store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("time-series row {index} is malformed: {reason}")]
    MalformedRow { index: usize, reason: String },
    #[error("invalid time-series query: {0}")]
    InvalidQuery(String),
}

/// Failure to obtain a verdict. Never a verdict in itself.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("analysis backend timed out after {0:?}")]
    Timeout(Duration),
    #[error("analysis backend request failed: {0}")]
    Transport(reqwest::Error),
    #[error("analysis backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("analysis backend reply unusable: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("invalid mail address {address:?}: {reason}")]
    Address { address: String, reason: String },
    #[error("failed to build message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("dispatch queue query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("dispatch payload could not be encoded: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Errors that end a unit's execution and hand it back to the dispatcher's retry policy.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    TimeSeries(#[from] TimeSeriesError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Catalog(_) => "catalog_error",
            PipelineError::TimeSeries(TimeSeriesError::Timeout(_)) => "timeseries_timeout",
            PipelineError::TimeSeries(_) => "timeseries_error",
            PipelineError::Backend(BackendError::Timeout(_)) => "backend_timeout",
            PipelineError::Backend(_) => "backend_error",
            PipelineError::Queue(_) => "queue_error",
        }
    }
}
