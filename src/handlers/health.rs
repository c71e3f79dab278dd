use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub progress_queue_len: usize,
    pub progress_queue_capacity: usize,
}

pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    if let Err(err) = state.db.health_check().await {
        warn!("Health check failed: {err}");
        return Err(ApiError::Unavailable(format!("database unavailable: {err}")));
    }

    Ok(Json(HealthResponse {
        status: "ok",
        progress_queue_len: state.db.queue_len(),
        progress_queue_capacity: state.db.queue_max_capacity(),
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::db::database::Database;
    use crate::router::router;
    use crate::state::test_state;

    #[tokio::test]
    async fn reports_ok_with_queue_depth() {
        let db = Database::init_in_memory().await;
        let app = router(test_state(db, "http://localhost", ""));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["progress_queue_len"], 0);
        assert_eq!(body["progress_queue_capacity"], 1000);
    }
}
