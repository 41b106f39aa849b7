pub mod health;
pub mod response;
pub mod state;
pub mod stream_interrupt;
pub mod streaming_query;

pub use state::AppState;

use crate::auth::auth_middleware;
use crate::auth::middleware::USER_ID_HEADER;
use axum::{
    Router,
    http::{HeaderName, Method, header},
    middleware,
    routing::{get, post},
};
use health::health;
use stream_interrupt::stream_interrupt;
use streaming_query::{REQUEST_ID_HEADER, streaming_query};
use tower_http::cors::{Any, CorsLayer};

/// Build the HTTP router. `/v1` routes resolve the caller identity first;
/// `/health` is open.
pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/v1/streaming_query", post(streaming_query))
        .route("/v1/streaming_query/interrupt", post(stream_interrupt))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(v1)
        .layer(cors())
        .with_state(state)
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(USER_ID_HEADER),
        ])
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)])
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::AppState;
    use crate::auth::Authenticator;
    use crate::auth::middleware::USER_ID_HEADER;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use std::sync::Arc;
    use streamgate_ai::{MockStep, ScriptedTokenSource};
    use streamgate_core::{
        InferenceRequest, Result, StreamError, TokenSource, TokenSourceFactory,
    };

    /// Factory replaying the same script for every request, or failing to
    /// open when there is none.
    pub struct ScriptedBackend {
        script: Option<Vec<MockStep>>,
    }

    #[async_trait]
    impl TokenSourceFactory for ScriptedBackend {
        fn provider(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "script"
        }

        async fn open(&self, _request: &InferenceRequest) -> Result<Box<dyn TokenSource>> {
            match &self.script {
                Some(steps) => Ok(Box::new(ScriptedTokenSource::new(steps.clone()))),
                None => Err(StreamError::Backend("connection refused".to_string())),
            }
        }
    }

    pub fn state_with_backend(backend: Arc<dyn TokenSourceFactory>) -> AppState {
        AppState::new(backend, Authenticator::Noop)
    }

    pub fn state_with_source(script: Option<Vec<MockStep>>) -> AppState {
        state_with_backend(Arc::new(ScriptedBackend { script }))
    }

    pub fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub fn post_json_as(uri: &str, body: &str, user_id: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .header(USER_ID_HEADER, user_id)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub async fn body_string(response: Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    pub async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }
}
