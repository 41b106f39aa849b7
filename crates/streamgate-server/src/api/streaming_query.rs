use super::response::ApiError;
use super::state::AppState;
use crate::auth::AuthContext;
use axum::{
    Extension, Json,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::Response,
};
use serde::Deserialize;
use streamgate_core::{EVENT_STREAM_MEDIA_TYPE, InferenceRequest, SessionRequest};
use tracing::{info, warn};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl QueryRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.query.trim().is_empty() {
            return Err("Query must not be empty".to_string());
        }
        if let Some(conversation_id) = &self.conversation_id
            && Uuid::parse_str(conversation_id).is_err()
        {
            return Err(format!("Improper conversation ID '{}'", conversation_id));
        }
        match (&self.provider, &self.model) {
            (Some(_), None) => Err("Model must be specified if provider is specified".to_string()),
            (None, Some(_)) => Err("Provider must be specified if model is specified".to_string()),
            _ => Ok(()),
        }
    }
}

/// Start a streamed answer; the body is a `text/event-stream` of
/// `start`, `token`... and `end` frames.
pub async fn streaming_query(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    request.validate().map_err(ApiError::unprocessable)?;

    if let (Some(provider), Some(model)) = (&request.provider, &request.model)
        && provider != state.backend.provider()
    {
        return Err(ApiError::bad_request(format!(
            "Model {} from provider {} not found in available models",
            model, provider
        )));
    }

    let request_id = Uuid::new_v4().to_string();
    let conversation_id = request
        .conversation_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let model = request
        .model
        .clone()
        .unwrap_or_else(|| state.backend.model().to_string());

    let inference = InferenceRequest {
        query: request.query.clone(),
        conversation_id: conversation_id.clone(),
        system_prompt: request.system_prompt.clone(),
        model: Some(model.clone()),
    };
    let source = state.backend.open(&inference).await.map_err(|err| {
        warn!(
            request_id = %request_id,
            provider = state.backend.provider(),
            error = %err,
            "Failed to open token source"
        );
        ApiError::service_unavailable(err.to_string())
    })?;

    info!(
        request_id = %request_id,
        conversation_id = %conversation_id,
        user_id = %auth.user_id,
        username = %auth.username,
        model = %model,
        "Streaming query accepted"
    );

    let session = SessionRequest::new(
        &request_id,
        &conversation_id,
        &auth.user_id,
        request.query,
    )
    .with_backend(state.backend.provider(), model);
    let stream = state.orchestrator.start(session, source);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, EVENT_STREAM_MEDIA_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(REQUEST_ID_HEADER, request_id.as_str())
        .body(Body::from_stream(stream.into_frames()))
        .map_err(|err| ApiError::internal(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::{
        body_json, body_string, post_json, state_with_backend, state_with_source,
    };
    use crate::api::router;
    use futures::StreamExt;
    use std::sync::Arc;
    use streamgate_ai::{MockBackend, MockStep};
    use streamgate_core::{StreamEvent, events};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_streams_full_event_sequence() {
        let app = router(state_with_backend(Arc::new(MockBackend::new("echo"))));

        let response = app
            .oneshot(post_json(
                "/v1/streaming_query",
                r#"{"query": "hello there"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            EVENT_STREAM_MEDIA_TYPE
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        let request_id = response.headers()[REQUEST_ID_HEADER]
            .to_str()
            .unwrap()
            .to_string();

        let body = body_string(response).await;
        let decoded = events::decode_all(&body).unwrap();

        match &decoded[0] {
            StreamEvent::Start {
                request_id: started,
                conversation_id,
            } => {
                assert_eq!(started, &request_id);
                assert!(Uuid::parse_str(conversation_id).is_ok());
            }
            other => panic!("expected start, got {:?}", other),
        }
        let text: String = decoded
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Token { token, .. } => Some(token.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "mock-echo: hello there");
        assert!(matches!(decoded.last(), Some(StreamEvent::End { .. })));
    }

    #[tokio::test]
    async fn test_keeps_supplied_conversation_id() {
        let app = router(state_with_backend(Arc::new(MockBackend::new("echo"))));
        let conversation_id = "123e4567-e89b-12d3-a456-426614174000";

        let response = app
            .oneshot(post_json(
                "/v1/streaming_query",
                &format!(
                    r#"{{"query": "hi", "conversation_id": "{}"}}"#,
                    conversation_id
                ),
            ))
            .await
            .unwrap();

        let body = body_string(response).await;
        assert!(body.starts_with(&format!(
            "data: {{\"event\":\"start\",\"data\":{{\"conversation_id\":\"{}\"",
            conversation_id
        )));
    }

    #[tokio::test]
    async fn test_rejects_empty_query() {
        let app = router(state_with_backend(Arc::new(MockBackend::new("echo"))));

        let response = app
            .oneshot(post_json("/v1/streaming_query", r#"{"query": "  "}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(response).await;
        assert_eq!(json["detail"]["cause"], "Query must not be empty");
    }

    #[tokio::test]
    async fn test_rejects_malformed_conversation_id() {
        let app = router(state_with_backend(Arc::new(MockBackend::new("echo"))));

        let response = app
            .oneshot(post_json(
                "/v1/streaming_query",
                r#"{"query": "hi", "conversation_id": "not-a-uuid"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_rejects_unknown_provider() {
        let app = router(state_with_backend(Arc::new(MockBackend::new("echo"))));

        let response = app
            .oneshot(post_json(
                "/v1/streaming_query",
                r#"{"query": "hi", "provider": "other", "model": "m"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let app = router(state_with_backend(Arc::new(MockBackend::new("echo"))));
        let response = app
            .oneshot(post_json(
                "/v1/streaming_query",
                r#"{"query": "hi", "model": "m"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_backend_open_failure_is_503() {
        let state = state_with_source(None);
        let registry = Arc::clone(&state.registry);
        let app = router(state);

        let response = app
            .oneshot(post_json("/v1/streaming_query", r#"{"query": "hi"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_ends_stream_without_end_event() {
        let state = state_with_source(Some(vec![
            MockStep::fragment("par"),
            MockStep::error("upstream reset"),
        ]));
        let registry = Arc::clone(&state.registry);
        let app = router(state);

        let response = app
            .oneshot(post_json("/v1/streaming_query", r#"{"query": "hi"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut frames = response.into_body().into_data_stream();
        let mut received = Vec::new();
        let mut errors = 0;
        while let Some(chunk) = frames.next().await {
            match chunk {
                Ok(bytes) => received.push(String::from_utf8(bytes.to_vec()).unwrap()),
                Err(_) => errors += 1,
            }
        }

        assert_eq!(received.len(), 2);
        assert_eq!(errors, 1);
        assert!(received.iter().all(|frame| !frame.contains("\"event\":\"end\"")));
        assert!(registry.is_empty());
    }
}
