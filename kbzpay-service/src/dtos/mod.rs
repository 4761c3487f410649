use crate::models::{LineItem, PaymentOrder, Purchase};
use crate::services::lifecycle::ApplyOutcome;
use crate::services::reconciler::SweepSummary;
use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use service_core::error::AppError;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentRequest {
    #[validate(length(min = 1, message = "userId is required"))]
    pub user_id: String,
    #[validate(length(min = 1, message = "at least one book is required"))]
    pub book_ids: Vec<String>,
    pub amounts: Vec<i64>,
}

impl CreatePaymentRequest {
    /// Pair book ids with amounts, rejecting anything that cannot be billed.
    pub fn line_items(&self) -> Result<Vec<LineItem>, AppError> {
        if self.book_ids.len() != self.amounts.len() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "bookIds and amounts must have the same length"
            )));
        }

        let mut seen = std::collections::HashSet::new();
        let mut items = Vec::with_capacity(self.book_ids.len());
        for (book_id, &amount) in self.book_ids.iter().zip(&self.amounts) {
            let book_id = book_id.trim();
            if book_id.is_empty() {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "bookIds must not be empty"
                )));
            }
            if !seen.insert(book_id) {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "duplicate bookId {}",
                    book_id
                )));
            }
            if amount < 0 {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "amount for {} must not be negative",
                    book_id
                )));
            }
            items.push(LineItem {
                item_id: book_id.to_string(),
                amount,
            });
        }

        let total = items
            .iter()
            .try_fold(0i64, |acc, item| acc.checked_add(item.amount))
            .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("total amount overflows")))?;
        if total <= 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "total amount must be greater than zero"
            )));
        }

        Ok(items)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentResponse {
    pub order_id: String,
    pub merchant_order_id: String,
    pub prepay_id: String,
    pub payment_url: String,
    pub total_amount: i64,
    pub currency: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentRequest {
    #[validate(length(min = 1, message = "merchantOrderId is required"))]
    pub merchant_order_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentResponse {
    pub merchant_order_id: String,
    pub status: String,
    /// `transitioned`, `updated`, `unchanged`, `already_terminal` or `superseded`.
    pub outcome: String,
    pub order: OrderResponse,
}

impl VerifyPaymentResponse {
    pub fn new(order: &PaymentOrder, outcome: ApplyOutcome) -> Self {
        let outcome = match outcome {
            ApplyOutcome::Transitioned { .. } => "transitioned",
            ApplyOutcome::Updated => "updated",
            ApplyOutcome::Unchanged => "unchanged",
            ApplyOutcome::AlreadyTerminal(_) => "already_terminal",
            ApplyOutcome::Superseded => "superseded",
        };
        Self {
            merchant_order_id: order.merchant_order_id.clone(),
            status: order.status.to_string(),
            outcome: outcome.to_string(),
            order: OrderResponse::from(order),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItemResponse {
    pub item_id: String,
    pub amount: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: String,
    pub merchant_order_id: String,
    pub user_id: String,
    pub status: String,
    pub line_items: Vec<LineItemResponse>,
    pub total_amount: i64,
    pub currency: String,
    pub paid_amount: Option<i64>,
    pub paid_at: Option<String>,
    pub gateway_order_id: Option<String>,
    pub prepay_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&PaymentOrder> for OrderResponse {
    fn from(order: &PaymentOrder) -> Self {
        Self {
            order_id: order.id.clone(),
            merchant_order_id: order.merchant_order_id.clone(),
            user_id: order.user_id.clone(),
            status: order.status.to_string(),
            line_items: order
                .line_items
                .iter()
                .map(|item| LineItemResponse {
                    item_id: item.item_id.clone(),
                    amount: item.amount,
                })
                .collect(),
            total_amount: order.total_amount,
            currency: order.currency.clone(),
            paid_amount: order.paid_amount,
            paid_at: order.paid_at.map(rfc3339),
            gateway_order_id: order.gateway_order_id.clone(),
            prepay_id: order.prepay_id.clone(),
            error_code: order.error_code.clone(),
            error_message: order.error_message.clone(),
            created_at: rfc3339(order.created_at),
            updated_at: rfc3339(order.updated_at),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseResponse {
    pub purchase_id: String,
    pub order_id: String,
    pub item_id: String,
    pub amount: i64,
    pub payment_reference: String,
    pub purchased_at: String,
}

impl From<Purchase> for PurchaseResponse {
    fn from(purchase: Purchase) -> Self {
        Self {
            purchase_id: purchase.id,
            order_id: purchase.order_id,
            item_id: purchase.item_id,
            amount: purchase.amount,
            payment_reference: purchase.payment_reference,
            purchased_at: rfc3339(purchase.purchased_at),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    pub examined: usize,
    pub transitioned: usize,
    pub unchanged: usize,
    pub errors: usize,
}

impl From<SweepSummary> for ReconcileResponse {
    fn from(summary: SweepSummary) -> Self {
        Self {
            examined: summary.examined,
            transitioned: summary.transitioned,
            unchanged: summary.unchanged,
            errors: summary.errors,
        }
    }
}

/// Gateway callback body: `{"Request": {merch_order_id, trade_status, ..., sign}}`.
#[derive(Debug, Deserialize)]
pub struct CallbackEnvelope {
    #[serde(rename = "Request")]
    pub request: Map<String, Value>,
}

fn rfc3339(value: DateTime) -> String {
    value.to_chrono().to_rfc3339()
}
