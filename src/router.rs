use std::any::Any;

use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::error_response;
use crate::handlers::{check_generation::check_generation, health::health};
use crate::state::AppState;

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else {
        "Unknown panic".to_string()
    };
    error!("Handler panicked: {message}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/check-generation", get(check_generation))
        .route("/health", get(health))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
