use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Body of every error response: `{"detail": {"response", "cause"}}`.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub response: String,
    pub cause: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    detail: &'a ErrorDetail,
}

#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    detail: ErrorDetail,
}

impl ApiError {
    pub fn new(status: StatusCode, response: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            status,
            detail: ErrorDetail {
                response: response.into(),
                cause: cause.into(),
            },
        }
    }

    pub fn bad_request(cause: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "Invalid request", cause)
    }

    pub fn unauthorized(cause: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "Missing or invalid credentials provided by client",
            cause,
        )
    }

    /// `resource` is the lower-case noun, e.g. "streaming request".
    pub fn not_found(resource: &str, resource_id: &str) -> Self {
        let mut title = resource.to_string();
        if let Some(first) = title.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        Self::new(
            StatusCode::NOT_FOUND,
            format!("{} not found", title),
            format!("{} with ID {} does not exist", title, resource_id),
        )
    }

    pub fn unprocessable(cause: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Invalid request payload",
            cause,
        )
    }

    pub fn service_unavailable(cause: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Unable to connect to the inference backend",
            cause,
        )
    }

    pub fn internal(cause: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
            cause,
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                detail: &self.detail,
            }),
        )
            .into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::unprocessable(rejection.body_text())
    }
}
