//! Order store: the only component that reads or writes payment orders.
//!
//! Updates are compare-and-set on the row `version`, so two writers racing on
//! the same order cannot both apply a transition.

use crate::models::{NewPaymentOrder, OrderPatch, OrderStatus, PaymentOrder};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, DateTime, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument};
use mongodb::{Collection, Database, IndexModel};
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

const DUPLICATE_KEY_CODE: i32 = 11000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("database error: {0}")]
    Database(anyhow::Error),
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        if is_duplicate_key(&err) {
            StoreError::DuplicateKey(err.to_string())
        } else {
            StoreError::Database(anyhow::Error::new(err))
        }
    }
}

impl From<mongodb::bson::ser::Error> for StoreError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        StoreError::Database(anyhow::Error::new(err))
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateKey(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            StoreError::Database(e) => AppError::DatabaseError(e),
        }
    }
}

pub(crate) fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY_CODE
    )
}

/// Result of a compare-and-set update.
#[derive(Debug, Clone)]
pub enum CasOutcome {
    /// The write landed; carries the order as stored afterwards.
    Applied(PaymentOrder),
    /// The row no longer had the expected version.
    Conflict,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persist a new `pending` order. Fails with `DuplicateKey` if the merchant
    /// order id is already taken.
    async fn create(&self, order: NewPaymentOrder) -> Result<PaymentOrder, StoreError>;

    async fn find_by_merchant_order_id(
        &self,
        merchant_order_id: &str,
    ) -> Result<Option<PaymentOrder>, StoreError>;

    /// Apply `patch` only if the order is still at `expected_version`.
    async fn compare_and_set(
        &self,
        merchant_order_id: &str,
        expected_version: i64,
        patch: &OrderPatch,
    ) -> Result<CasOutcome, StoreError>;

    /// Oldest-first pending orders created before `created_before`.
    async fn list_stale_pending(
        &self,
        created_before: DateTime,
        limit: usize,
    ) -> Result<Vec<PaymentOrder>, StoreError>;
}

/// MongoDB-backed order store (`payment_orders` collection).
#[derive(Clone)]
pub struct MongoOrderStore {
    orders: Collection<PaymentOrder>,
}

impl MongoOrderStore {
    pub fn new(db: &Database) -> Self {
        Self {
            orders: db.collection("payment_orders"),
        }
    }

    pub async fn init_indexes(&self) -> Result<(), StoreError> {
        let merchant_order_index = IndexModel::builder()
            .keys(doc! { "merchant_order_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("merchant_order_id_unique".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        let status_index = IndexModel::builder()
            .keys(doc! { "status": 1, "created_at": 1 })
            .options(
                IndexOptions::builder()
                    .name("status_created_at_idx".to_string())
                    .build(),
            )
            .build();

        let user_index = IndexModel::builder()
            .keys(doc! { "user_id": 1 })
            .options(IndexOptions::builder().name("user_idx".to_string()).build())
            .build();

        self.orders
            .create_indexes([merchant_order_index, status_index, user_index], None)
            .await?;

        tracing::info!("Payment order indexes initialized");
        Ok(())
    }
}

fn patch_document(patch: &OrderPatch) -> Result<Document, StoreError> {
    let mut set = Document::new();
    if let Some(status) = patch.status {
        set.insert("status", mongodb::bson::to_bson(&status)?);
    }
    if let Some(ref prepay_id) = patch.prepay_id {
        set.insert("prepay_id", prepay_id.clone());
    }
    if let Some(ref gateway_order_id) = patch.gateway_order_id {
        set.insert("gateway_order_id", gateway_order_id.clone());
    }
    if let Some(paid_amount) = patch.paid_amount {
        set.insert("paid_amount", paid_amount);
    }
    if let Some(paid_at) = patch.paid_at {
        set.insert("paid_at", paid_at);
    }
    if let Some(ref payload) = patch.last_gateway_payload {
        set.insert("last_gateway_payload", payload.clone());
    }
    if let Some(ref code) = patch.error_code {
        set.insert("error_code", code.clone());
    }
    if let Some(ref message) = patch.error_message {
        set.insert("error_message", message.clone());
    }
    Ok(set)
}

#[async_trait]
impl OrderStore for MongoOrderStore {
    async fn create(&self, order: NewPaymentOrder) -> Result<PaymentOrder, StoreError> {
        let order = order.into_order(Uuid::new_v4().to_string(), DateTime::now());
        self.orders.insert_one(&order, None).await?;
        Ok(order)
    }

    async fn find_by_merchant_order_id(
        &self,
        merchant_order_id: &str,
    ) -> Result<Option<PaymentOrder>, StoreError> {
        let filter = doc! { "merchant_order_id": merchant_order_id };
        Ok(self.orders.find_one(filter, None).await?)
    }

    async fn compare_and_set(
        &self,
        merchant_order_id: &str,
        expected_version: i64,
        patch: &OrderPatch,
    ) -> Result<CasOutcome, StoreError> {
        let filter = doc! {
            "merchant_order_id": merchant_order_id,
            "version": expected_version,
        };

        let mut set = patch_document(patch)?;
        set.insert("version", expected_version + 1);
        set.insert("updated_at", DateTime::now());

        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        let updated = self
            .orders
            .find_one_and_update(filter, doc! { "$set": set }, options)
            .await?;

        Ok(match updated {
            Some(order) => CasOutcome::Applied(order),
            None => CasOutcome::Conflict,
        })
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime,
        limit: usize,
    ) -> Result<Vec<PaymentOrder>, StoreError> {
        let filter = doc! {
            "status": mongodb::bson::to_bson(&OrderStatus::Pending)?,
            "created_at": { "$lt": created_before },
        };
        let options = FindOptions::builder()
            .sort(doc! { "created_at": 1 })
            .limit(limit as i64)
            .build();

        let cursor = self.orders.find(filter, options).await?;
        Ok(cursor.try_collect().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_document_only_contains_set_fields() {
        let patch = OrderPatch {
            status: Some(OrderStatus::Completed),
            paid_amount: Some(13000),
            ..Default::default()
        };
        let document = patch_document(&patch).unwrap();

        assert_eq!(document.get_str("status").unwrap(), "completed");
        assert_eq!(document.get_i64("paid_amount").unwrap(), 13000);
        assert!(!document.contains_key("prepay_id"));
        assert_eq!(document.len(), 2);
    }

    #[test]
    fn empty_patch_yields_empty_document() {
        assert!(patch_document(&OrderPatch::default()).unwrap().is_empty());
    }
}
