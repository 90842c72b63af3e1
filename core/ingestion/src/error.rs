use thiserror::Error;

/// Error taxonomy for the ingestion pipeline.
///
/// `Validation` is rejected before any side effect and is never retried
/// automatically. `Persistence` is surfaced to the caller after an audit
/// record is written; whether to retry the whole event is the caller's
/// decision. Best-effort I/O (seen-set writes, audit appends, lock cleanup)
/// never surfaces here — those failures are logged and swallowed.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("persistence: {0}")]
    Persistence(String),
}

impl HubError {
    pub fn validation(msg: impl Into<String>) -> Self {
        HubError::Validation(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        HubError::Persistence(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, HubError::Validation(_))
    }
}
