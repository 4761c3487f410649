//! Purchase materialization: turning a paid order's line items into
//! entitlement records.

use crate::models::{LineItem, PaymentOrder, Purchase};
use crate::services::repository::is_duplicate_key;
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, DateTime};
use mongodb::options::{FindOptions, IndexOptions};
use mongodb::{Collection, Database, IndexModel};
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("failed to record purchase of {item_id}: {source}")]
    Write {
        item_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to read purchases: {0}")]
    Read(anyhow::Error),
}

impl From<MaterializeError> for AppError {
    fn from(err: MaterializeError) -> Self {
        AppError::DatabaseError(anyhow::Error::new(err))
    }
}

/// Stable purchase id: one per (order, item).
pub fn purchase_id(order_id: &str, item_id: &str) -> String {
    format!("{}:{}", order_id, item_id)
}

pub fn build_purchase(order: &PaymentOrder, item: &LineItem, now: DateTime) -> Purchase {
    Purchase {
        id: purchase_id(&order.id, &item.item_id),
        order_id: order.id.clone(),
        user_id: order.user_id.clone(),
        item_id: item.item_id.clone(),
        amount: item.amount,
        payment_reference: order.payment_reference().to_string(),
        purchased_at: now,
    }
}

#[async_trait]
pub trait PurchaseLedger: Send + Sync {
    /// Record the purchase of one line item. Recording the same
    /// `(order, item)` twice returns the existing record.
    async fn materialize(
        &self,
        order: &PaymentOrder,
        item: &LineItem,
    ) -> Result<Purchase, MaterializeError>;

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Purchase>, MaterializeError>;
}

/// MongoDB-backed ledger (`purchases` collection).
#[derive(Clone)]
pub struct MongoPurchaseLedger {
    purchases: Collection<Purchase>,
}

impl MongoPurchaseLedger {
    pub fn new(db: &Database) -> Self {
        Self {
            purchases: db.collection("purchases"),
        }
    }

    pub async fn init_indexes(&self) -> Result<(), mongodb::error::Error> {
        let order_item_index = IndexModel::builder()
            .keys(doc! { "order_id": 1, "item_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("order_item_unique".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        let user_index = IndexModel::builder()
            .keys(doc! { "user_id": 1, "purchased_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("user_purchased_at_idx".to_string())
                    .build(),
            )
            .build();

        self.purchases
            .create_indexes([order_item_index, user_index], None)
            .await?;

        tracing::info!("Purchase indexes initialized");
        Ok(())
    }
}

#[async_trait]
impl PurchaseLedger for MongoPurchaseLedger {
    async fn materialize(
        &self,
        order: &PaymentOrder,
        item: &LineItem,
    ) -> Result<Purchase, MaterializeError> {
        let purchase = build_purchase(order, item, DateTime::now());

        match self.purchases.insert_one(&purchase, None).await {
            Ok(_) => Ok(purchase),
            Err(e) if is_duplicate_key(&e) => {
                tracing::debug!(
                    purchase_id = %purchase.id,
                    "Purchase already recorded"
                );
                self.purchases
                    .find_one(doc! { "_id": purchase.id.as_str() }, None)
                    .await
                    .map_err(|e| MaterializeError::Read(anyhow::Error::new(e)))?
                    .ok_or_else(|| MaterializeError::Write {
                        item_id: item.item_id.clone(),
                        source: anyhow::anyhow!("duplicate purchase could not be read back"),
                    })
            }
            Err(e) => Err(MaterializeError::Write {
                item_id: item.item_id.clone(),
                source: anyhow::Error::new(e),
            }),
        }
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Purchase>, MaterializeError> {
        let options = FindOptions::builder()
            .sort(doc! { "purchased_at": -1 })
            .build();

        let cursor = self
            .purchases
            .find(doc! { "user_id": user_id }, options)
            .await
            .map_err(|e| MaterializeError::Read(anyhow::Error::new(e)))?;

        cursor
            .try_collect()
            .await
            .map_err(|e| MaterializeError::Read(anyhow::Error::new(e)))
    }
}
