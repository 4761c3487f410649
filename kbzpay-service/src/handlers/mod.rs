//! HTTP handlers for kbzpay-service.

pub mod payments;
pub mod webhook;

use crate::services::get_metrics;
use crate::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use mongodb::bson::doc;
use serde_json::json;

pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "kbzpay-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Ready when the database answers a ping and the gateway is configured.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match state.db {
        Some(ref db) => match db.run_command(doc! { "ping": 1 }, None).await {
            Ok(_) => "ok",
            Err(e) => {
                tracing::warn!(error = %e, "Database ping failed");
                "unavailable"
            }
        },
        None => "memory",
    };
    let gateway = if state.gateway.is_configured() {
        "configured"
    } else {
        "not_configured"
    };

    let ready = database != "unavailable" && state.gateway.is_configured();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if ready { "ready" } else { "not_ready" },
            "database": database,
            "gateway": gateway,
        })),
    )
}

pub async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
