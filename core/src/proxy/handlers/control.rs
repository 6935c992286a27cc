// Control handlers: status snapshot and provider switch

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use crate::proxy::router::StatusSnapshot;
use crate::proxy::server::AppState;

pub async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.router.status())
}

/// `POST /select` with a plain-text provider index as body.
pub async fn select(State(state): State<AppState>, body: String) -> Response {
    let index: i64 = match body.trim().parse() {
        Ok(index) => index,
        Err(_) => {
            tracing::debug!("Rejected provider switch with body {:?}", body);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "success": false,
                    "message": "request body must be an integer provider index",
                })),
            )
                .into_response();
        }
    };

    let router = &state.router;
    let Ok(index) = usize::try_from(index) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "message": format!("invalid provider index {} (valid range 0..{})", index, router.pool().len()),
                "current": router.active_provider(),
                "total": router.pool().len(),
            })),
        )
            .into_response();
    };

    let selection = router.select_provider(index);
    let status = if selection.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(selection)).into_response()
}
