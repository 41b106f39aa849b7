use super::state::AppState;
use axum::{Json, extract::State};
use serde::Serialize;

#[derive(Serialize, Debug)]
pub struct Health {
    pub status: String,
    pub active_streams: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        active_streams: state.registry.len(),
    })
}
