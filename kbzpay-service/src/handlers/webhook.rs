//! KBZPay payment notification handler.
//!
//! Verifies the callback signature, then hands the trade status to the order
//! lifecycle. The gateway only needs to see `success`; processing errors are
//! logged, never returned, so the gateway does not keep redelivering.

use axum::{extract::State, http::StatusCode};
use serde_json::Value;
use service_core::error::AppError;

use crate::{
    dtos::CallbackEnvelope,
    services::{
        kbzpay::TradeStatus,
        lifecycle::{EventSource, GatewayEvent},
        repository::OrderStore,
        signer::{self, SignParams},
    },
    utils::{parse_amount, parse_epoch_seconds},
    AppState,
};

/// Body the gateway expects on successful receipt.
pub const ACKNOWLEDGEMENT: &str = "success";

const PAID_AT_FIELDS: [&str; 2] = ["pay_success_time", "trans_end_time"];

pub async fn kbzpay_callback(
    State(state): State<AppState>,
    body: String,
) -> Result<(StatusCode, &'static str), AppError> {
    let envelope: CallbackEnvelope = serde_json::from_str(&body).map_err(|e| {
        tracing::warn!(error = %e, "Unparseable KBZPay callback");
        AppError::BadRequest(anyhow::anyhow!("Invalid callback payload"))
    })?;

    let params = signer::flatten(&Value::Object(envelope.request));

    if !state.gateway.verify_signature(&params) {
        tracing::warn!(
            merchant_order_id = ?params.get("merch_order_id"),
            "Invalid KBZPay callback signature"
        );
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invalid callback signature"
        )));
    }

    let Some(merchant_order_id) = params.get("merch_order_id").cloned() else {
        tracing::error!("Signed KBZPay callback without merch_order_id acknowledged");
        return Ok((StatusCode::OK, ACKNOWLEDGEMENT));
    };

    match state
        .lifecycle
        .orders()
        .find_by_merchant_order_id(&merchant_order_id)
        .await
    {
        Ok(Some(_)) => {}
        Ok(None) => {
            tracing::warn!(
                merchant_order_id = %merchant_order_id,
                "KBZPay callback for unknown order"
            );
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Payment order not found"
            )));
        }
        Err(e) => {
            tracing::error!(
                merchant_order_id = %merchant_order_id,
                error = %e,
                "Order lookup failed; acknowledging KBZPay callback"
            );
            return Ok((StatusCode::OK, ACKNOWLEDGEMENT));
        }
    }

    let Some(event) = trade_event(&params, body) else {
        tracing::warn!(
            merchant_order_id = %merchant_order_id,
            "KBZPay callback without trade_status acknowledged"
        );
        return Ok((StatusCode::OK, ACKNOWLEDGEMENT));
    };

    tracing::info!(
        merchant_order_id = %merchant_order_id,
        trade_status = ?params.get("trade_status"),
        "Processing KBZPay callback"
    );

    let lifecycle = state.lifecycle.clone();
    let order_id = merchant_order_id.clone();
    let task = tokio::spawn(async move {
        lifecycle
            .apply(&order_id, EventSource::Webhook, event)
            .await
    });

    match tokio::time::timeout(state.config.webhook.ack_timeout(), task).await {
        Ok(Ok(Ok(result))) => tracing::info!(
            merchant_order_id = %merchant_order_id,
            outcome = ?result.outcome,
            status = %result.order.status,
            purchases = result.purchases_materialized,
            "KBZPay callback processed"
        ),
        Ok(Ok(Err(e))) => tracing::error!(
            merchant_order_id = %merchant_order_id,
            error = %e,
            "Failed to apply KBZPay callback"
        ),
        Ok(Err(e)) => tracing::error!(
            merchant_order_id = %merchant_order_id,
            error = %e,
            "KBZPay callback task panicked"
        ),
        Err(_) => tracing::warn!(
            merchant_order_id = %merchant_order_id,
            "KBZPay callback still processing; acknowledging"
        ),
    }

    Ok((StatusCode::OK, ACKNOWLEDGEMENT))
}

fn trade_event(params: &SignParams, payload: String) -> Option<GatewayEvent> {
    let trade_status = params
        .get("trade_status")
        .filter(|s| !s.is_empty())
        .map(|s| TradeStatus::parse(s))?;

    let paid_at = PAID_AT_FIELDS
        .iter()
        .find_map(|field| params.get(*field).and_then(|v| parse_epoch_seconds(v)))
        .map(|secs| mongodb::bson::DateTime::from_millis(secs.saturating_mul(1000)));

    Some(GatewayEvent::Trade {
        trade_status,
        paid_amount: params.get("total_amount").and_then(|v| parse_amount(v)),
        gateway_order_id: params.get("mm_order_id").filter(|s| !s.is_empty()).cloned(),
        paid_at,
        payload,
    })
}
