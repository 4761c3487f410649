//! Process-local order store and purchase ledger.
//!
//! Selected with `database.backend = "memory"`; also backs the integration
//! tests. Same compare-and-set semantics as the MongoDB store.

use crate::models::{LineItem, NewPaymentOrder, OrderPatch, OrderStatus, PaymentOrder, Purchase};
use crate::services::purchases::{build_purchase, MaterializeError, PurchaseLedger};
use crate::services::repository::{CasOutcome, OrderStore, StoreError};
use async_trait::async_trait;
use mongodb::bson::DateTime;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Orders keyed by merchant order id.
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<String, PaymentOrder>>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create(&self, order: NewPaymentOrder) -> Result<PaymentOrder, StoreError> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.merchant_order_id) {
            return Err(StoreError::DuplicateKey(format!(
                "merchant_order_id {} already exists",
                order.merchant_order_id
            )));
        }

        let order = order.into_order(Uuid::new_v4().to_string(), DateTime::now());
        orders.insert(order.merchant_order_id.clone(), order.clone());
        Ok(order)
    }

    async fn find_by_merchant_order_id(
        &self,
        merchant_order_id: &str,
    ) -> Result<Option<PaymentOrder>, StoreError> {
        Ok(self.orders.read().await.get(merchant_order_id).cloned())
    }

    async fn compare_and_set(
        &self,
        merchant_order_id: &str,
        expected_version: i64,
        patch: &OrderPatch,
    ) -> Result<CasOutcome, StoreError> {
        let mut orders = self.orders.write().await;
        match orders.get_mut(merchant_order_id) {
            Some(order) if order.version == expected_version => {
                patch.apply_to(order, DateTime::now());
                Ok(CasOutcome::Applied(order.clone()))
            }
            _ => Ok(CasOutcome::Conflict),
        }
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime,
        limit: usize,
    ) -> Result<Vec<PaymentOrder>, StoreError> {
        let orders = self.orders.read().await;
        let mut pending: Vec<PaymentOrder> = orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending && o.created_at < created_before)
            .cloned()
            .collect();
        pending.sort_by_key(|o| o.created_at);
        pending.truncate(limit);
        Ok(pending)
    }
}

/// Purchases keyed by purchase id.
#[derive(Clone, Default)]
pub struct InMemoryPurchaseLedger {
    purchases: Arc<RwLock<HashMap<String, Purchase>>>,
}

impl InMemoryPurchaseLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.purchases.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.purchases.read().await.is_empty()
    }

    pub async fn for_order(&self, order_id: &str) -> Vec<Purchase> {
        let mut purchases: Vec<Purchase> = self
            .purchases
            .read()
            .await
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect();
        purchases.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        purchases
    }
}

#[async_trait]
impl PurchaseLedger for InMemoryPurchaseLedger {
    async fn materialize(
        &self,
        order: &PaymentOrder,
        item: &LineItem,
    ) -> Result<Purchase, MaterializeError> {
        let purchase = build_purchase(order, item, DateTime::now());
        let mut purchases = self.purchases.write().await;
        let stored = purchases
            .entry(purchase.id.clone())
            .or_insert(purchase)
            .clone();
        Ok(stored)
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Purchase>, MaterializeError> {
        let mut purchases: Vec<Purchase> = self
            .purchases
            .read()
            .await
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        purchases.sort_by(|a, b| b.purchased_at.cmp(&a.purchased_at));
        Ok(purchases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CURRENCY_MMK;

    fn new_order(merchant_order_id: &str) -> NewPaymentOrder {
        NewPaymentOrder {
            merchant_order_id: merchant_order_id.to_string(),
            user_id: "user-1".to_string(),
            line_items: vec![LineItem {
                item_id: "book-a".to_string(),
                amount: 5000,
            }],
            currency: CURRENCY_MMK.to_string(),
        }
    }

    #[tokio::test]
    async fn duplicate_merchant_order_id_is_rejected() {
        let store = InMemoryOrderStore::new();
        store.create(new_order("BK1")).await.unwrap();
        let err = store.create(new_order("BK1")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_version() {
        let store = InMemoryOrderStore::new();
        store.create(new_order("BK1")).await.unwrap();

        let patch = OrderPatch {
            prepay_id: Some("P1".to_string()),
            ..Default::default()
        };
        let first = store.compare_and_set("BK1", 0, &patch).await.unwrap();
        assert!(matches!(first, CasOutcome::Applied(ref o) if o.version == 1));

        let second = store.compare_and_set("BK1", 0, &patch).await.unwrap();
        assert!(matches!(second, CasOutcome::Conflict));
    }

    #[tokio::test]
    async fn compare_and_set_on_missing_order_conflicts() {
        let store = InMemoryOrderStore::new();
        let outcome = store
            .compare_and_set("missing", 0, &OrderPatch::default())
            .await
            .unwrap();
        assert!(matches!(outcome, CasOutcome::Conflict));
    }

    #[tokio::test]
    async fn stale_pending_excludes_recent_and_terminal_orders() {
        let store = InMemoryOrderStore::new();
        let old = store.create(new_order("BK-old")).await.unwrap();
        store.create(new_order("BK-done")).await.unwrap();
        store
            .compare_and_set(
                "BK-done",
                0,
                &OrderPatch {
                    status: Some(OrderStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let cutoff = DateTime::from_millis(DateTime::now().timestamp_millis() + 1_000);
        let stale = store.list_stale_pending(cutoff, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);

        let before_everything = DateTime::from_millis(0);
        assert!(store
            .list_stale_pending(before_everything, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn materializing_twice_keeps_one_purchase() {
        let store = InMemoryOrderStore::new();
        let ledger = InMemoryPurchaseLedger::new();
        let order = store.create(new_order("BK1")).await.unwrap();
        let item = order.line_items[0].clone();

        let first = ledger.materialize(&order, &item).await.unwrap();
        let second = ledger.materialize(&order, &item).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.len().await, 1);
        assert_eq!(ledger.list_for_user("user-1").await.unwrap().len(), 1);
    }
}
