use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub const LOAD_FAILED_MESSAGE: &str = "Failed to load transport data. Please try again later.";
pub const SEARCH_FAILED_MESSAGE: &str = "Failed to search. Please try again.";

#[derive(Error, Debug)]
pub enum TransitError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API request failed with status: {0}")]
    Status(u16),

    #[error("Malformed response body: {0}")]
    MalformedBody(String),

    #[error("JSON decoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protobuf decoding failed: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    #[error("Invalid provider URL: {0}")]
    InvalidUrl(String),
}

/// Which pipeline failed; decides the single message shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    Stops,
    Search,
    Arrivals,
    TripUpdates,
}

#[derive(Error, Debug)]
#[error("{pipeline:?} pipeline failed: {source}")]
pub struct PipelineError {
    pub pipeline: Pipeline,
    #[source]
    pub source: TransitError,
}

impl PipelineError {
    pub fn new(pipeline: Pipeline, source: TransitError) -> Self {
        Self { pipeline, source }
    }

    pub fn user_message(&self) -> &'static str {
        match self.pipeline {
            Pipeline::Search => SEARCH_FAILED_MESSAGE,
            Pipeline::Stops | Pipeline::Arrivals | Pipeline::TripUpdates => LOAD_FAILED_MESSAGE,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Pipeline(#[from] PipelineError),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Pipeline(e) => match e.source {
                TransitError::InvalidRegion(ref msg) => (StatusCode::BAD_REQUEST, msg.clone()),
                _ => (StatusCode::BAD_GATEWAY, e.user_message().to_string()),
            },
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_failure_collapses_to_one_message_per_pipeline() {
        let search = PipelineError::new(Pipeline::Search, TransitError::Status(500));
        assert_eq!(search.user_message(), SEARCH_FAILED_MESSAGE);

        let malformed = PipelineError::new(
            Pipeline::Stops,
            TransitError::MalformedBody("missing stops".to_string()),
        );
        assert_eq!(malformed.user_message(), LOAD_FAILED_MESSAGE);

        let arrivals = PipelineError::new(Pipeline::Arrivals, TransitError::Status(404));
        assert_eq!(arrivals.user_message(), LOAD_FAILED_MESSAGE);
    }

    #[test]
    fn invalid_region_maps_to_bad_request() {
        let err = AppError::from(PipelineError::new(
            Pipeline::Stops,
            TransitError::InvalidRegion("region deltas must be non-zero".to_string()),
        ));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let err = AppError::from(PipelineError::new(Pipeline::Stops, TransitError::Status(503)));
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
