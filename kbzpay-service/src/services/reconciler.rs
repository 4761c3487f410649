//! Query-channel reconciliation.
//!
//! Pulls trade status from the gateway for orders the webhook has not
//! resolved, either one order on demand or a sweep over stale pending orders.

use crate::config::ReconciliationConfig;
use crate::services::kbzpay::{GatewayError, GatewayOutcome, KbzPayClient, QueryOrderResult};
use crate::services::lifecycle::{
    ApplyOutcome, ApplyResult, EventSource, GatewayEvent, LifecycleError, OrderLifecycle,
};
use crate::services::repository::{OrderStore, StoreError};
use mongodb::bson::DateTime;
use service_core::error::AppError;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        ReconcileError::Lifecycle(LifecycleError::Store(err))
    }
}

impl From<ReconcileError> for AppError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Gateway(e) => e.into(),
            ReconcileError::Lifecycle(e) => e.into(),
        }
    }
}

/// Turn a query response into a lifecycle event. `None` when the gateway
/// did not report a trade status.
pub fn query_event(result: QueryOrderResult) -> Option<GatewayEvent> {
    if result.result != GatewayOutcome::Success {
        return None;
    }
    let trade_status = result.trade_status?;
    Some(GatewayEvent::Trade {
        trade_status,
        paid_amount: result.paid_amount,
        gateway_order_id: result.gateway_order_id,
        paid_at: result
            .paid_at_epoch_seconds
            .map(|secs| DateTime::from_millis(secs.saturating_mul(1000))),
        payload: result.raw,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub examined: usize,
    pub transitioned: usize,
    pub unchanged: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct Reconciler {
    gateway: KbzPayClient,
    lifecycle: OrderLifecycle,
    config: ReconciliationConfig,
}

impl Reconciler {
    pub fn new(
        gateway: KbzPayClient,
        lifecycle: OrderLifecycle,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            gateway,
            lifecycle,
            config,
        }
    }

    /// Query the gateway for one order and apply what it reports.
    ///
    /// Orders that are already terminal are returned without a gateway call.
    pub async fn reconcile_order(
        &self,
        merchant_order_id: &str,
    ) -> Result<ApplyResult, ReconcileError> {
        let order = self
            .lifecycle
            .orders()
            .find_by_merchant_order_id(merchant_order_id)
            .await?
            .ok_or_else(|| LifecycleError::OrderNotFound(merchant_order_id.to_string()))?;

        if order.status.is_terminal() {
            return Ok(ApplyResult {
                outcome: ApplyOutcome::AlreadyTerminal(order.status),
                order,
                purchases_materialized: 0,
            });
        }

        let result = self.gateway.query_order(merchant_order_id).await?;
        if result.result != GatewayOutcome::Success {
            tracing::warn!(
                merchant_order_id = %merchant_order_id,
                code = ?result.code,
                msg = ?result.message,
                "Gateway query returned failure"
            );
        }

        match query_event(result) {
            Some(event) => Ok(self
                .lifecycle
                .apply(merchant_order_id, EventSource::Query, event)
                .await?),
            None => Ok(ApplyResult {
                outcome: ApplyOutcome::Unchanged,
                order,
                purchases_materialized: 0,
            }),
        }
    }

    /// Reconcile pending orders older than `stale_after_secs`, oldest first.
    pub async fn sweep(&self) -> Result<SweepSummary, ReconcileError> {
        let cutoff_ms = DateTime::now()
            .timestamp_millis()
            .saturating_sub((self.config.stale_after_secs as i64).saturating_mul(1000));
        let stale = self
            .lifecycle
            .orders()
            .list_stale_pending(DateTime::from_millis(cutoff_ms), self.config.batch_size)
            .await?;

        let mut summary = SweepSummary {
            examined: stale.len(),
            ..Default::default()
        };

        for order in stale {
            match self.reconcile_order(&order.merchant_order_id).await {
                Ok(result) => match result.outcome {
                    ApplyOutcome::Transitioned { .. } => summary.transitioned += 1,
                    _ => summary.unchanged += 1,
                },
                Err(e) => {
                    summary.errors += 1;
                    tracing::warn!(
                        merchant_order_id = %order.merchant_order_id,
                        error = %e,
                        "Failed to reconcile pending order"
                    );
                }
            }
        }

        tracing::info!(
            examined = summary.examined,
            transitioned = summary.transitioned,
            errors = summary.errors,
            "Pending order sweep finished"
        );
        Ok(summary)
    }

    /// Run [`Reconciler::sweep`] every `interval` until the task is aborted.
    pub fn spawn_periodic(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep().await {
                    tracing::error!(error = %e, "Pending order sweep failed");
                }
            }
        })
    }
}
