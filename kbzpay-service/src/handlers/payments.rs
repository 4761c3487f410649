//! Payment order handlers: creation, status verification and read views.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use service_core::error::AppError;
use validator::Validate;

use crate::{
    dtos::{
        CreatePaymentRequest, CreatePaymentResponse, OrderResponse, PurchaseResponse,
        ReconcileResponse, VerifyPaymentRequest, VerifyPaymentResponse,
    },
    models::{LineItem, NewPaymentOrder, PaymentOrder},
    services::{
        kbzpay::GatewayOutcome,
        lifecycle::{EventSource, GatewayEvent},
        purchases::PurchaseLedger,
        repository::{OrderStore, StoreError},
    },
    utils::generate_merchant_order_id,
    AppState,
};

/// Attempts at picking a merchant order id before giving up.
const ORDER_ID_ATTEMPTS: usize = 2;

/// Create a payment order and register it with the gateway.
///
/// The order is persisted `pending` before the gateway is called, so a
/// gateway outage leaves a record the reconciler can pick up.
pub async fn create_payment(
    State(state): State<AppState>,
    Json(payload): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<CreatePaymentResponse>), AppError> {
    payload.validate()?;
    let line_items = payload.line_items()?;

    if !state.gateway.is_configured() {
        return Err(AppError::ServiceUnavailable(
            "Payment gateway is not configured".to_string(),
        ));
    }

    let order = persist_order(&state, &payload.user_id, line_items).await?;

    tracing::info!(
        merchant_order_id = %order.merchant_order_id,
        user_id = %order.user_id,
        total_amount = order.total_amount,
        items = order.line_items.len(),
        "Creating KBZPay order"
    );

    let title = format!("Book purchase ({} items)", order.line_items.len());
    let created = match state
        .gateway
        .create_order(
            &order.merchant_order_id,
            order.total_amount,
            &title,
            &order.id,
        )
        .await
    {
        Ok(created) => created,
        Err(e) => {
            tracing::error!(
                merchant_order_id = %order.merchant_order_id,
                error = %e,
                "KBZPay order creation failed in transport"
            );
            record_creation_event(
                &state,
                &order.merchant_order_id,
                GatewayEvent::TransportFailed {
                    message: e.to_string(),
                },
            )
            .await;
            return Err(e.into());
        }
    };

    let prepay_id = match (created.result, created.prepay_id) {
        (GatewayOutcome::Success, Some(prepay_id)) => prepay_id,
        (result, _) => {
            let code = match result {
                GatewayOutcome::Failure => created.code,
                GatewayOutcome::Success => Some("MISSING_PREPAY_ID".to_string()),
            };
            let message = created
                .message
                .unwrap_or_else(|| "gateway did not return a prepay id".to_string());
            record_creation_event(
                &state,
                &order.merchant_order_id,
                GatewayEvent::Rejected {
                    code: code.clone(),
                    message: Some(message.clone()),
                },
            )
            .await;
            return Err(AppError::BadGateway(format!(
                "Payment gateway rejected order: {} ({})",
                message,
                code.unwrap_or_default()
            )));
        }
    };

    record_creation_event(
        &state,
        &order.merchant_order_id,
        GatewayEvent::Created {
            prepay_id: prepay_id.clone(),
            gateway_order_id: None,
        },
    )
    .await;

    let payment_url = state.gateway.build_redirect_url(&prepay_id)?;

    tracing::info!(
        merchant_order_id = %order.merchant_order_id,
        prepay_id = %prepay_id,
        "KBZPay order created successfully"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreatePaymentResponse {
            order_id: order.id,
            merchant_order_id: order.merchant_order_id,
            prepay_id,
            payment_url,
            total_amount: order.total_amount,
            currency: order.currency,
        }),
    ))
}

async fn persist_order(
    state: &AppState,
    user_id: &str,
    line_items: Vec<LineItem>,
) -> Result<PaymentOrder, AppError> {
    let mut last_error = None;
    for _ in 0..ORDER_ID_ATTEMPTS {
        let new_order = NewPaymentOrder {
            merchant_order_id: generate_merchant_order_id(user_id, Utc::now()),
            user_id: user_id.to_string(),
            line_items: line_items.clone(),
            currency: state.gateway.currency().to_string(),
        };
        match state.lifecycle.orders().create(new_order).await {
            Ok(order) => return Ok(order),
            Err(StoreError::DuplicateKey(msg)) => {
                tracing::warn!(error = %msg, "Merchant order id collided; regenerating");
                last_error = Some(StoreError::DuplicateKey(msg));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(last_error
        .map(AppError::from)
        .unwrap_or_else(|| AppError::InternalError(anyhow::anyhow!("order not created"))))
}

/// Creation outcomes are recorded best-effort; the caller's response does not
/// depend on them.
async fn record_creation_event(state: &AppState, merchant_order_id: &str, event: GatewayEvent) {
    if let Err(e) = state
        .lifecycle
        .apply(merchant_order_id, EventSource::Creation, event)
        .await
    {
        tracing::error!(
            merchant_order_id = %merchant_order_id,
            error = %e,
            "Failed to record creation outcome"
        );
    }
}

/// Ask the gateway for the order's trade status and apply it.
pub async fn verify_payment(
    State(state): State<AppState>,
    Json(payload): Json<VerifyPaymentRequest>,
) -> Result<Json<VerifyPaymentResponse>, AppError> {
    payload.validate()?;

    tracing::info!(
        merchant_order_id = %payload.merchant_order_id,
        "Verifying KBZPay payment"
    );

    let result = state
        .reconciler
        .reconcile_order(&payload.merchant_order_id)
        .await
        .map_err(|e| {
            tracing::warn!(
                merchant_order_id = %payload.merchant_order_id,
                error = %e,
                "Payment verification failed"
            );
            AppError::from(e)
        })?;

    Ok(Json(VerifyPaymentResponse::new(
        &result.order,
        result.outcome,
    )))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(merchant_order_id): Path<String>,
) -> Result<Json<OrderResponse>, AppError> {
    let order = state
        .lifecycle
        .orders()
        .find_by_merchant_order_id(&merchant_order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment order not found")))?;

    Ok(Json(OrderResponse::from(&order)))
}

pub async fn list_purchases(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<PurchaseResponse>>, AppError> {
    let purchases = state.lifecycle.ledger().list_for_user(&user_id).await?;
    Ok(Json(
        purchases.into_iter().map(PurchaseResponse::from).collect(),
    ))
}

/// Sweep stale pending orders through the query channel.
pub async fn reconcile_pending(
    State(state): State<AppState>,
) -> Result<Json<ReconcileResponse>, AppError> {
    let summary = state.reconciler.sweep().await?;
    Ok(Json(ReconcileResponse::from(summary)))
}
