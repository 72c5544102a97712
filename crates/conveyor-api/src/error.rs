//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use conveyor_core::graph::GraphError;
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    /// The pipeline definition itself is unusable, e.g. a dependency cycle.
    InvalidPipeline(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::InvalidPipeline(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<conveyor_core::Error> for ApiError {
    fn from(err: conveyor_core::Error) -> Self {
        match err {
            conveyor_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            conveyor_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            conveyor_core::Error::Unauthorized(msg) => ApiError::Unauthorized(msg),
            conveyor_core::Error::Conflict(msg) => ApiError::Conflict(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<GraphError> for ApiError {
    fn from(err: GraphError) -> Self {
        let kind = match err {
            GraphError::Cycle { .. } => "dependency cycle",
            GraphError::UnresolvedDependency { .. } => "unresolved dependency",
            GraphError::DuplicateStack(_) => "duplicate stack",
        };
        ApiError::InvalidPipeline(format!("{} in stack graph: {}", kind, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_errors_are_unprocessable() {
        let err = ApiError::from(GraphError::Cycle {
            members: vec!["a".to_string(), "b".to_string()],
        });
        assert!(matches!(&err, ApiError::InvalidPipeline(msg) if msg.contains("a -> b -> a")));
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);

        let err = ApiError::from(GraphError::UnresolvedDependency {
            stack: "api".to_string(),
            dependency: "auth".to_string(),
        });
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_core_not_found_maps_to_404() {
        let err = ApiError::from(conveyor_core::Error::NotFound("run".to_string()));
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}
