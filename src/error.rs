use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the registry, collectors and analyzer.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("cluster {0} is already registered")]
    AlreadyExists(String),

    #[error("cluster {0} not found")]
    NotFound(String),

    #[error("connection to cluster {cluster} failed: {reason}")]
    Connection { cluster: String, reason: String },

    #[error("statistics query {query} failed: {reason}")]
    Query { query: &'static str, reason: String },

    #[error("invalid endpoint configuration: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, MonitorError>;

impl MonitorError {
    pub fn connection(cluster: &str, reason: impl ToString) -> Self {
        Self::Connection {
            cluster: cluster.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn query(query: &'static str, err: sqlx::Error) -> Self {
        Self::Query {
            query,
            reason: describe_sqlx_error(&err),
        }
    }

    pub fn query_timeout(query: &'static str, after: Duration) -> Self {
        Self::Query {
            query,
            reason: format!("timed out after {after:?}"),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Connection { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Query { .. } => StatusCode::BAD_GATEWAY,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Short, password-free description of a driver error for logs and responses.
pub(crate) fn describe_sqlx_error(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!("{} (SQLSTATE {code})", db_err.message()),
            None => db_err.message().to_string(),
        },
        sqlx::Error::Io(io) => format!("network I/O error: {io}"),
        sqlx::Error::Tls(tls) => format!("TLS error: {tls}"),
        sqlx::Error::PoolTimedOut => "timed out acquiring a pooled connection".to_string(),
        sqlx::Error::PoolClosed => "connection pool closed".to_string(),
        sqlx::Error::ColumnDecode { index, source } => {
            format!("unexpected type in column {index}: {source}")
        }
        other => other.to_string(),
    }
}
