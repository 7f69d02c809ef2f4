//! API error mapping
//!
//! Every handler returns `Result<_, ApiError>`; the error carries the
//! status code and the JSON body `{err, max_size?}` surfaced to clients.
//! Client errors (malformed input, an oversize line, unknown ids) map to
//! 4xx and are never retried internally; backend errors map to 500 and
//! are logged with context at the call site.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use loghouse_storage::Error as StorageError;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub err: String,

    /// Present only on oversize-line rejections, telling the client the
    /// configured chunk bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,

    #[serde(skip)]
    pub status: StatusCode,
}

impl ApiError {
    pub fn not_found(err: impl Into<String>) -> Self {
        Self {
            err: err.into(),
            max_size: None,
            status: StatusCode::NOT_FOUND,
        }
    }

    pub fn bad_request(err: impl Into<String>) -> Self {
        Self {
            err: err.into(),
            max_size: None,
            status: StatusCode::BAD_REQUEST,
        }
    }

    pub fn internal(err: impl Into<String>) -> Self {
        Self {
            err: err.into(),
            max_size: None,
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(&self)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Core(loghouse_core::Error::LineTooLarge { max, .. }) => Self {
                err: e.to_string(),
                max_size: Some(max),
                status: StatusCode::BAD_REQUEST,
            },
            StorageError::BuildNotFound(_) | StorageError::TestNotFound(_) => {
                Self::not_found(e.to_string())
            }
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<loghouse_core::Error> for ApiError {
    fn from(e: loghouse_core::Error) -> Self {
        match e {
            loghouse_core::Error::LineTooLarge { max, .. } => Self {
                err: e.to_string(),
                max_size: Some(max),
                status: StatusCode::BAD_REQUEST,
            },
        }
    }
}
