//! API error handling

use async_trait::async_trait;
use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::StatusCode,
    response::{sse::Event, IntoResponse, Response},
    Json,
};
use vgate_core::ErrorEnvelope;

/// API error type. Wraps the translated domain envelope so every handler
/// surfaces the same `{status_code, code, msg}` body.
#[derive(Debug)]
pub struct ApiError(pub ErrorEnvelope);

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError(vgate_core::Error::BadParams(msg.into()).envelope())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        ApiError(vgate_core::Error::Authentication(msg.into()).envelope())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0)).into_response()
    }
}

impl From<vgate_core::Error> for ApiError {
    fn from(err: vgate_core::Error) -> Self {
        ApiError(err.envelope())
    }
}

/// Json extractor whose rejection is the standard error envelope, so a
/// malformed or type-mismatched body never escapes as axum's plain-text
/// response.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError::bad_request(rejection.body_text())),
        }
    }
}

/// Terminal SSE event carrying an error envelope. Streams emit this as
/// their last data item once the response status is already committed.
pub fn sse_error_event(envelope: &ErrorEnvelope) -> Event {
    Event::default().data(serde_json::to_string(envelope).unwrap_or_else(|_| {
        format!(
            "{{\"status_code\":500,\"code\":\"INTERNAL_SERVER_ERROR\",\"msg\":{:?}}}",
            envelope.msg
        )
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vgate_core::Error;

    #[test]
    fn model_not_found_maps_to_404_body() {
        let err = ApiError::from(Error::ModelNotFound("qwen".into()));
        assert_eq!(err.0.status_code, 404);
        assert_eq!(err.0.code, "MODEL_NOT_FOUND");
    }

    #[test]
    fn error_event_serializes_envelope() {
        let envelope = Error::RateLimit("slow down".into()).envelope();
        let event = sse_error_event(&envelope);
        let rendered = format!("{:?}", event);
        assert!(rendered.contains("RATE_LIMIT"));
    }

    #[tokio::test]
    async fn malformed_body_rejects_with_envelope() {
        let request = axum::http::Request::builder()
            .method("POST")
            .header(axum::http::header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from("{not json"))
            .unwrap();

        let err = ApiJson::<serde_json::Value>::from_request(request, &())
            .await
            .err()
            .unwrap();
        assert_eq!(err.0.status_code, 400);
        assert_eq!(err.0.code, "BAD_PARAMS");
    }

    #[tokio::test]
    async fn type_mismatched_body_rejects_with_envelope() {
        #[derive(serde::Deserialize)]
        #[allow(dead_code)]
        struct Named {
            name: String,
        }

        let request = axum::http::Request::builder()
            .method("POST")
            .header(axum::http::header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(r#"{"name": 42}"#))
            .unwrap();

        let err = ApiJson::<Named>::from_request(request, &())
            .await
            .err()
            .unwrap();
        assert_eq!(err.0.status_code, 400);
        assert_eq!(err.0.code, "BAD_PARAMS");
    }
}
