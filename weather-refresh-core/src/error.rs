//! Stage-level error types.
//!
//! None of these escape [`crate::pipeline::RefreshPipeline::execute`]; the
//! pipeline turns each of them into an [`crate::model::Outcome`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("no location fix within {0:?}")]
    NoFix(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("call to server failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid request url: {0}")]
    InvalidUrl(String),
    #[error("no API key stored for provider '{0}'")]
    MissingApiKey(&'static str),
    #[error("snapshot unavailable: {0}")]
    Snapshot(String),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("store encoding error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Why a refresh did not complete; logged, then mapped to an outcome.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Location(#[from] LocationError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RefreshError {
    /// Whether the scheduler should try again later.
    ///
    /// Every failure the pipeline can hit today is expected to clear up on
    /// its own, so this is always true.
    pub fn is_transient(&self) -> bool {
        match self {
            RefreshError::Location(_) => true,
            RefreshError::Fetch(_) => true,
            RefreshError::Parse(_) => true,
            RefreshError::Store(_) => true,
        }
    }
}
