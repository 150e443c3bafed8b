//! OpenAI-compatible model listing.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;
use vgate_core::types::now_unix_secs;

pub fn router() -> Router<AppState> {
    Router::new().route("/models", get(list_models))
}

#[derive(Debug, Serialize)]
struct ModelList {
    object: &'static str,
    data: Vec<ModelObject>,
}

#[derive(Debug, Serialize)]
struct ModelObject {
    id: String,
    object: &'static str,
    created: u64,
    owned_by: &'static str,
}

async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    let created = now_unix_secs();
    let data = state
        .manager
        .list()
        .await
        .into_iter()
        .map(|descriptor| ModelObject {
            id: descriptor.name,
            object: "model",
            created,
            owned_by: "vgate",
        })
        .collect();

    Json(ModelList {
        object: "list",
        data,
    })
}
