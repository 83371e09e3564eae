use crate::{capture_error, set_user, EndUser, Engine};
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json,
};
use serde_json::{json, Value};

/// Build the diagnostic Router of the request-capture server.
/// Every route is wrapped with `engine`, and panics are converted into
/// 500 responses only after they've been observed by capture.
pub fn router(engine: &Engine) -> axum::Router {
    axum::Router::new()
        .route("/ok", get(ok))
        .route("/not-found", get(not_found))
        .route("/fail", get(fail))
        .route("/panic", get(panics))
        .route("/echo", post(echo))
        .layer(engine.layer())
        .layer(tower_http::catch_panic::CatchPanicLayer::new())
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("widget service is unavailable")]
    Unavailable(#[source] std::io::Error),
    #[error("request body must be a JSON document")]
    NotJson(#[from] serde_json::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::NotJson(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn ok() -> Json<Value> {
    tracing::info!("serving ok");
    Json(json!({ "ok": true }))
}

async fn not_found() -> (StatusCode, Json<Value>) {
    tracing::warn!(widget = "sprocket", "widget lookup missed");
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}

async fn fail(headers: HeaderMap) -> Result<Json<Value>, Error> {
    if let Some(id) = headers.get("x-user-id").and_then(|v| v.to_str().ok()) {
        set_user(Some(EndUser {
            id: Some(id.to_string()),
            ..Default::default()
        }));
    }
    tracing::info!("calling widget service");

    let err = Error::Unavailable(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "connection refused",
    ));
    capture_error(&err);
    Err(err)
}

async fn panics() -> &'static str {
    tracing::error!("about to panic");
    panic!("E_CODE_42")
}

async fn echo(body: axum::body::Bytes) -> Result<Json<Value>, Error> {
    let doc: Value = serde_json::from_slice(&body)?;
    tracing::info!(len = body.len(), "echoing request body");
    Ok(Json(doc))
}
