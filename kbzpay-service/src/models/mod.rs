use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};

/// The only currency the gateway settles in for this merchant.
pub const CURRENCY_MMK: &str = "MMK";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
    Expired,
    Cancelled,
    CompletedWithErrors,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Completed => "completed",
            OrderStatus::Failed => "failed",
            OrderStatus::Expired => "expired",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::CompletedWithErrors => "completed_with_errors",
        }
    }

    /// Every status except `pending` is final.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    /// Payment was received (purchases may or may not all exist).
    pub fn is_paid(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::CompletedWithErrors
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LineItem {
    pub item_id: String,
    pub amount: i64,
}

/// A payment order as persisted by the order store.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PaymentOrder {
    #[serde(rename = "_id")]
    pub id: String,
    pub merchant_order_id: String,
    pub user_id: String,
    pub line_items: Vec<LineItem>,
    pub currency: String,
    pub total_amount: i64,
    pub status: OrderStatus,
    pub gateway_order_id: Option<String>,
    pub prepay_id: Option<String>,
    pub paid_amount: Option<i64>,
    pub paid_at: Option<DateTime>,
    /// Raw gateway payload of the last applied event, kept for audit.
    pub last_gateway_payload: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Row version for compare-and-set updates.
    pub version: i64,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl PaymentOrder {
    /// Reference recorded on purchases: the gateway's order id when known.
    pub fn payment_reference(&self) -> &str {
        self.gateway_order_id
            .as_deref()
            .unwrap_or(&self.merchant_order_id)
    }
}

/// Input for creating an order. The store assigns `id` and timestamps.
#[derive(Debug, Clone)]
pub struct NewPaymentOrder {
    pub merchant_order_id: String,
    pub user_id: String,
    pub line_items: Vec<LineItem>,
    pub currency: String,
}

impl NewPaymentOrder {
    pub fn total_amount(&self) -> i64 {
        self.line_items.iter().map(|item| item.amount).sum()
    }

    /// Build the persisted record in `pending` state.
    pub fn into_order(self, id: String, now: DateTime) -> PaymentOrder {
        let total_amount = self.total_amount();
        PaymentOrder {
            id,
            merchant_order_id: self.merchant_order_id,
            user_id: self.user_id,
            line_items: self.line_items,
            currency: self.currency,
            total_amount,
            status: OrderStatus::Pending,
            gateway_order_id: None,
            prepay_id: None,
            paid_amount: None,
            paid_at: None,
            last_gateway_payload: None,
            error_code: None,
            error_message: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Field changes written by a compare-and-set update. `None` leaves a field
/// untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderPatch {
    pub status: Option<OrderStatus>,
    pub prepay_id: Option<String>,
    pub gateway_order_id: Option<String>,
    pub paid_amount: Option<i64>,
    pub paid_at: Option<DateTime>,
    pub last_gateway_payload: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl OrderPatch {
    /// Apply to an in-memory record, bumping version and `updated_at`.
    pub fn apply_to(&self, order: &mut PaymentOrder, now: DateTime) {
        if let Some(status) = self.status {
            order.status = status;
        }
        if let Some(ref prepay_id) = self.prepay_id {
            order.prepay_id = Some(prepay_id.clone());
        }
        if let Some(ref gateway_order_id) = self.gateway_order_id {
            order.gateway_order_id = Some(gateway_order_id.clone());
        }
        if let Some(paid_amount) = self.paid_amount {
            order.paid_amount = Some(paid_amount);
        }
        if let Some(paid_at) = self.paid_at {
            order.paid_at = Some(paid_at);
        }
        if let Some(ref payload) = self.last_gateway_payload {
            order.last_gateway_payload = Some(payload.clone());
        }
        if let Some(ref code) = self.error_code {
            order.error_code = Some(code.clone());
        }
        if let Some(ref message) = self.error_message {
            order.error_message = Some(message.clone());
        }
        order.version += 1;
        order.updated_at = now;
    }
}

/// Entitlement created for one line item of a paid order.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Purchase {
    #[serde(rename = "_id")]
    pub id: String,
    pub order_id: String,
    pub user_id: String,
    pub item_id: String,
    pub amount: i64,
    pub payment_reference: String,
    pub purchased_at: DateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_order() -> NewPaymentOrder {
        NewPaymentOrder {
            merchant_order_id: "BK1".to_string(),
            user_id: "user-1".to_string(),
            line_items: vec![
                LineItem {
                    item_id: "book-a".to_string(),
                    amount: 5000,
                },
                LineItem {
                    item_id: "book-b".to_string(),
                    amount: 8000,
                },
            ],
            currency: CURRENCY_MMK.to_string(),
        }
    }

    #[test]
    fn total_is_sum_of_line_items() {
        let order = new_order().into_order("id-1".to_string(), DateTime::now());
        assert_eq!(order.total_amount, 13000);
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.version, 0);
        assert!(order.paid_at.is_none());
    }

    #[test]
    fn only_pending_is_not_terminal() {
        assert!(!OrderStatus::Pending.is_terminal());
        for status in [
            OrderStatus::Completed,
            OrderStatus::Failed,
            OrderStatus::Expired,
            OrderStatus::Cancelled,
            OrderStatus::CompletedWithErrors,
        ] {
            assert!(status.is_terminal(), "{} should be terminal", status);
        }
    }

    #[test]
    fn patch_touches_only_set_fields_and_bumps_version() {
        let mut order = new_order().into_order("id-1".to_string(), DateTime::now());
        order.prepay_id = Some("P1".to_string());

        let patch = OrderPatch {
            status: Some(OrderStatus::Completed),
            gateway_order_id: Some("G1".to_string()),
            ..Default::default()
        };
        patch.apply_to(&mut order, DateTime::now());

        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(order.prepay_id.as_deref(), Some("P1"));
        assert_eq!(order.gateway_order_id.as_deref(), Some("G1"));
        assert_eq!(order.version, 1);
        assert_eq!(order.payment_reference(), "G1");
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&OrderStatus::CompletedWithErrors).unwrap();
        assert_eq!(json, "\"completed_with_errors\"");
    }
}
