//! API routes and handlers

pub mod manage;
pub mod native;
pub mod openai;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::state::AppState;

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(native::router())
        .merge(manage::router())
        .nest("/v1", openai::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Wrap an SSE body with the header that disables proxy buffering, so
/// chunks reach clients as they are produced.
pub(crate) fn streaming_response(sse: impl IntoResponse) -> Response {
    (
        [(header::HeaderName::from_static("x-accel-buffering"), "no")],
        sse,
    )
        .into_response()
}

/// Bearer auth applied to every route when an API key is configured.
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(next.run(request).await),
        Some(_) => Err(ApiError(
            vgate_core::Error::IncorrectApiKey("incorrect API key provided".into()).envelope(),
        )),
        None => Err(ApiError::unauthorized("missing bearer token")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_responses_disable_proxy_buffering() {
        let response = streaming_response("data");
        assert_eq!(
            response.headers().get("x-accel-buffering").map(|v| v.as_bytes()),
            Some(b"no".as_slice())
        );
    }
}
