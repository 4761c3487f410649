//! Order lifecycle: the single writer of payment order status.
//!
//! Events arrive from three unordered sources (creation response, webhook,
//! status query) and all go through [`OrderLifecycle::apply`]. Status only
//! moves forward out of `pending`; purchases are materialized only by the
//! writer whose compare-and-set moved the order into a paid status.

use crate::models::{OrderPatch, OrderStatus, PaymentOrder};
use crate::services::kbzpay::TradeStatus;
use crate::services::metrics;
use crate::services::purchases::PurchaseLedger;
use crate::services::repository::{CasOutcome, OrderStore, StoreError};
use mongodb::bson::DateTime;
use service_core::error::AppError;
use std::sync::Arc;
use thiserror::Error;

pub const GATEWAY_UNAVAILABLE: &str = "GATEWAY_UNAVAILABLE";
pub const GATEWAY_REJECTED: &str = "GATEWAY_REJECTED";
pub const MATERIALIZATION_FAILED: &str = "MATERIALIZATION_FAILED";

/// Read-decide-write attempts before giving up to a concurrent writer.
const CAS_ATTEMPTS: usize = 2;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("payment order {0} not found")]
    OrderNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::OrderNotFound(id) => {
                AppError::NotFound(anyhow::anyhow!("Payment order {} not found", id))
            }
            LifecycleError::Store(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Creation,
    Webhook,
    Query,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Creation => "creation",
            EventSource::Webhook => "webhook",
            EventSource::Query => "query",
        }
    }
}

#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Gateway accepted the order.
    Created {
        prepay_id: String,
        gateway_order_id: Option<String>,
    },
    /// Gateway refused to create the order.
    Rejected {
        code: Option<String>,
        message: Option<String>,
    },
    /// The create call never got an answer; the order stays pending.
    TransportFailed { message: String },
    /// Trade status reported by webhook or query.
    Trade {
        trade_status: TradeStatus,
        paid_amount: Option<i64>,
        gateway_order_id: Option<String>,
        paid_at: Option<DateTime>,
        payload: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Status changed.
    Transitioned { from: OrderStatus, to: OrderStatus },
    /// Non-status fields changed.
    Updated,
    /// Nothing to do.
    Unchanged,
    /// Order was already final; nothing written.
    AlreadyTerminal(OrderStatus),
    /// A concurrent writer advanced the order first.
    Superseded,
}

#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub outcome: ApplyOutcome,
    /// The order as stored after processing.
    pub order: PaymentOrder,
    pub purchases_materialized: usize,
}

/// Map gateway trade vocabulary to an order status. `None` for statuses we
/// do not recognise.
pub fn map_trade_status(status: &TradeStatus) -> Option<OrderStatus> {
    match status {
        TradeStatus::PaySuccess => Some(OrderStatus::Completed),
        TradeStatus::PayFailed => Some(OrderStatus::Failed),
        TradeStatus::OrderExpired => Some(OrderStatus::Expired),
        TradeStatus::OrderClosed => Some(OrderStatus::Cancelled),
        TradeStatus::WaitPay | TradeStatus::Paying => Some(OrderStatus::Pending),
        TradeStatus::Unknown(_) => None,
    }
}

enum Plan {
    Write {
        patch: OrderPatch,
        transition: Option<OrderStatus>,
    },
    Skip(ApplyOutcome),
}

#[derive(Clone)]
pub struct OrderLifecycle {
    orders: Arc<dyn OrderStore>,
    ledger: Arc<dyn PurchaseLedger>,
}

impl OrderLifecycle {
    pub fn new(orders: Arc<dyn OrderStore>, ledger: Arc<dyn PurchaseLedger>) -> Self {
        Self { orders, ledger }
    }

    pub fn orders(&self) -> &Arc<dyn OrderStore> {
        &self.orders
    }

    pub fn ledger(&self) -> &Arc<dyn PurchaseLedger> {
        &self.ledger
    }

    /// Apply one gateway event to an order.
    pub async fn apply(
        &self,
        merchant_order_id: &str,
        source: EventSource,
        event: GatewayEvent,
    ) -> Result<ApplyResult, LifecycleError> {
        for attempt in 0..CAS_ATTEMPTS {
            let order = self.load(merchant_order_id).await?;

            let (patch, transition) = match plan(&order, source, &event) {
                Plan::Skip(outcome) => {
                    tracing::debug!(
                        merchant_order_id = %merchant_order_id,
                        source = source.as_str(),
                        status = %order.status,
                        outcome = ?outcome,
                        "Gateway event required no change"
                    );
                    return Ok(ApplyResult {
                        outcome,
                        order,
                        purchases_materialized: 0,
                    });
                }
                Plan::Write { patch, transition } => (patch, transition),
            };

            match self
                .orders
                .compare_and_set(merchant_order_id, order.version, &patch)
                .await?
            {
                CasOutcome::Applied(updated) => {
                    let Some(to) = transition else {
                        return Ok(ApplyResult {
                            outcome: ApplyOutcome::Updated,
                            order: updated,
                            purchases_materialized: 0,
                        });
                    };

                    let from = order.status;
                    metrics::record_transition(source.as_str(), to.as_str());
                    tracing::info!(
                        merchant_order_id = %merchant_order_id,
                        source = source.as_str(),
                        from = %from,
                        to = %to,
                        "Payment order transitioned"
                    );

                    let (order, purchases_materialized) = if to.is_paid() && !from.is_paid() {
                        self.materialize(updated).await
                    } else {
                        (updated, 0)
                    };

                    return Ok(ApplyResult {
                        outcome: ApplyOutcome::Transitioned { from, to },
                        order,
                        purchases_materialized,
                    });
                }
                CasOutcome::Conflict => {
                    tracing::debug!(
                        merchant_order_id = %merchant_order_id,
                        attempt = attempt + 1,
                        "Order version changed concurrently"
                    );
                }
            }
        }

        tracing::info!(
            merchant_order_id = %merchant_order_id,
            source = source.as_str(),
            "Another writer advanced the order; event dropped"
        );
        let order = self.load(merchant_order_id).await?;
        Ok(ApplyResult {
            outcome: ApplyOutcome::Superseded,
            order,
            purchases_materialized: 0,
        })
    }

    async fn load(&self, merchant_order_id: &str) -> Result<PaymentOrder, LifecycleError> {
        self.orders
            .find_by_merchant_order_id(merchant_order_id)
            .await?
            .ok_or_else(|| LifecycleError::OrderNotFound(merchant_order_id.to_string()))
    }

    /// Record one purchase per line item. Any failure downgrades the order to
    /// `completed_with_errors`; payment success is never reversed.
    async fn materialize(&self, order: PaymentOrder) -> (PaymentOrder, usize) {
        let mut recorded = 0usize;
        let mut failed = Vec::new();

        for item in &order.line_items {
            match self.ledger.materialize(&order, item).await {
                Ok(_) => recorded += 1,
                Err(e) => {
                    tracing::error!(
                        merchant_order_id = %order.merchant_order_id,
                        item_id = %item.item_id,
                        error = %e,
                        "Failed to record purchase"
                    );
                    failed.push(item.item_id.clone());
                }
            }
        }

        metrics::record_materialized("ok", recorded as u64);
        if failed.is_empty() {
            return (order, recorded);
        }
        metrics::record_materialized("error", failed.len() as u64);

        let patch = OrderPatch {
            status: Some(OrderStatus::CompletedWithErrors),
            error_code: Some(MATERIALIZATION_FAILED.to_string()),
            error_message: Some(format!(
                "purchases not recorded for items: {}",
                failed.join(", ")
            )),
            ..Default::default()
        };

        tracing::warn!(
            merchant_order_id = %order.merchant_order_id,
            failed_items = ?failed,
            manual_reconciliation = true,
            "Downgrading paid order to completed_with_errors"
        );

        for attempt in 0..CAS_ATTEMPTS {
            match self
                .orders
                .compare_and_set(&order.merchant_order_id, order.version, &patch)
                .await
            {
                Ok(CasOutcome::Applied(downgraded)) => return (downgraded, recorded),
                Ok(CasOutcome::Conflict) => {
                    tracing::error!(
                        merchant_order_id = %order.merchant_order_id,
                        manual_reconciliation = true,
                        "Order changed before materialization failure was recorded"
                    );
                    return match self.load(&order.merchant_order_id).await {
                        Ok(current) => (current, recorded),
                        Err(_) => (order, recorded),
                    };
                }
                Err(e) => tracing::warn!(
                    merchant_order_id = %order.merchant_order_id,
                    attempt = attempt + 1,
                    error = %e,
                    "Failed to record materialization failure on order"
                ),
            }
        }

        tracing::error!(
            merchant_order_id = %order.merchant_order_id,
            failed_items = ?failed,
            manual_reconciliation = true,
            "Paid order left without materialization failure flag"
        );
        (order, recorded)
    }
}

fn plan(order: &PaymentOrder, source: EventSource, event: &GatewayEvent) -> Plan {
    if order.status.is_terminal() {
        if let GatewayEvent::Trade {
            trade_status: TradeStatus::PaySuccess,
            paid_amount,
            ..
        } = event
        {
            if !order.status.is_paid() {
                metrics::record_late_success();
                tracing::warn!(
                    merchant_order_id = %order.merchant_order_id,
                    source = source.as_str(),
                    status = %order.status,
                    paid_amount = ?paid_amount,
                    manual_reconciliation = true,
                    "Payment success reported for an order that already ended unpaid"
                );
            }
        }
        return Plan::Skip(ApplyOutcome::AlreadyTerminal(order.status));
    }

    match event {
        GatewayEvent::Created {
            prepay_id,
            gateway_order_id,
        } => {
            let prepay_changed = order.prepay_id.as_deref() != Some(prepay_id.as_str());
            let gateway_changed = gateway_order_id.is_some()
                && order.gateway_order_id.as_deref() != gateway_order_id.as_deref();
            if !prepay_changed && !gateway_changed {
                return Plan::Skip(ApplyOutcome::Unchanged);
            }
            Plan::Write {
                patch: OrderPatch {
                    prepay_id: Some(prepay_id.clone()),
                    gateway_order_id: gateway_order_id.clone(),
                    ..Default::default()
                },
                transition: None,
            }
        }
        GatewayEvent::Rejected { code, message } => Plan::Write {
            patch: OrderPatch {
                status: Some(OrderStatus::Failed),
                error_code: Some(
                    code.clone()
                        .filter(|c| !c.is_empty())
                        .unwrap_or_else(|| GATEWAY_REJECTED.to_string()),
                ),
                error_message: Some(
                    message
                        .clone()
                        .unwrap_or_else(|| "order rejected by gateway".to_string()),
                ),
                ..Default::default()
            },
            transition: Some(OrderStatus::Failed),
        },
        GatewayEvent::TransportFailed { message } => Plan::Write {
            patch: OrderPatch {
                error_code: Some(GATEWAY_UNAVAILABLE.to_string()),
                error_message: Some(message.clone()),
                ..Default::default()
            },
            transition: None,
        },
        GatewayEvent::Trade {
            trade_status,
            paid_amount,
            gateway_order_id,
            paid_at,
            payload,
        } => {
            let target = match map_trade_status(trade_status) {
                Some(OrderStatus::Pending) => return Plan::Skip(ApplyOutcome::Unchanged),
                Some(status) => status,
                None => {
                    tracing::warn!(
                        merchant_order_id = %order.merchant_order_id,
                        source = source.as_str(),
                        trade_status = trade_status.as_str(),
                        "Unknown trade status ignored"
                    );
                    return Plan::Skip(ApplyOutcome::Unchanged);
                }
            };

            let mut patch = OrderPatch {
                status: Some(target),
                gateway_order_id: gateway_order_id.clone(),
                last_gateway_payload: Some(payload.clone()),
                ..Default::default()
            };

            if target.is_paid() {
                let amount = paid_amount.unwrap_or(order.total_amount);
                if amount != order.total_amount {
                    tracing::warn!(
                        merchant_order_id = %order.merchant_order_id,
                        total_amount = order.total_amount,
                        paid_amount = amount,
                        "Paid amount differs from order total"
                    );
                }
                patch.paid_amount = Some(amount);
                patch.paid_at = Some(paid_at.unwrap_or_else(DateTime::now));
            }

            Plan::Write {
                patch,
                transition: Some(target),
            }
        }
    }
}
