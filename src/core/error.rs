use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("missing required parameter: {0}")]
    MissingField(&'static str),

    #[error("invalid parameter {field}: {reason}")]
    InvalidParameter { field: &'static str, reason: String },

    #[error("path {path_id} failed at quarter {period}: {reason}")]
    Simulation {
        path_id: u32,
        period: u32,
        reason: String,
    },

    #[error("could not build worker pool: {0}")]
    WorkerPool(String),

    #[error("calculation worker failed: {0}")]
    Worker(String),

    #[error("calculation exceeded {seconds}s timeout")]
    Timeout { seconds: f64 },
}

impl EngineError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::InvalidParameter {
            field,
            reason: reason.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
