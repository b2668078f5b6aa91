use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed app specification")]
    MalformedSpec,
    #[error("build queue full")]
    QueueFull,
    #[error("not accepting new builds")]
    ShuttingDown,
    #[error("app not found")]
    AppNotFound,
    #[error("no app available to deploy")]
    NoAppToDeploy,
    #[error("could not deploy app: {0}")]
    Deploy(#[from] crate::deploy::DeployError),
    #[error("registry failure: {0}")]
    Persistence(#[from] crate::persistence::Error),
    #[error("cluster failure: {0}")]
    Cluster(#[from] binder_cluster::Error),
    #[error("log plane failure: {0}")]
    LogPlane(#[from] binder_logd::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::MalformedSpec => StatusCode::BAD_REQUEST,
            // A full queue is an expected outcome of admission, not a
            // server failure
            Error::QueueFull => StatusCode::OK,
            Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Error::AppNotFound | Error::NoAppToDeploy => StatusCode::NOT_FOUND,
            Error::Deploy(_)
            | Error::Persistence(_)
            | Error::Cluster(_)
            | Error::LogPlane(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(err = %self, "request failed");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
