//! Recording status route.
//!
//! `GET /api/status` answers "is anything recording, is it safe to update".

use axum::{Json, Router, extract::State, routing::get};

use crate::api::error::ApiResult;
use crate::api::server::AppState;
use crate::status::StatusSnapshot;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_status))
}

async fn get_status(State(state): State<AppState>) -> ApiResult<Json<StatusSnapshot>> {
    Ok(Json(state.status.status()?))
}
