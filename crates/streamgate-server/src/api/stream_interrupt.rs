use super::response::ApiError;
use super::state::AppState;
use crate::auth::AuthContext;
use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
};
use streamgate_core::{
    InterruptResult, StreamingInterruptRequest, StreamingInterruptResponse, interrupt_stream,
};

/// Interrupt one of the caller's in-flight streaming requests.
pub async fn stream_interrupt(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    payload: Result<Json<StreamingInterruptRequest>, JsonRejection>,
) -> Result<Json<StreamingInterruptResponse>, ApiError> {
    let Json(request) = payload?;
    request.validate().map_err(ApiError::unprocessable)?;

    match interrupt_stream(&state.registry, &request.request_id, &auth.user_id) {
        InterruptResult::Interrupted(response) | InterruptResult::NotInterrupted(response) => {
            Ok(Json(response))
        }
        InterruptResult::NotFound { request_id } => {
            Err(ApiError::not_found("streaming request", &request_id))
        }
    }
}
