mod common;

use async_trait::async_trait;
use common::{paid_callback, signed_callback, TestApp, TEST_USER_ID};
use kbzpay_service::models::{LineItem, NewPaymentOrder, OrderPatch, PaymentOrder, Purchase};
use kbzpay_service::services::purchases::MaterializeError;
use kbzpay_service::services::repository::{CasOutcome, StoreError};
use kbzpay_service::services::{InMemoryOrderStore, OrderStore, PurchaseLedger};
use mongodb::bson::DateTime;
use serde_json::Value;
use std::sync::Arc;

/// Ledger whose writes always fail.
struct UnavailableLedger;

#[async_trait]
impl PurchaseLedger for UnavailableLedger {
    async fn materialize(
        &self,
        _order: &PaymentOrder,
        item: &LineItem,
    ) -> Result<Purchase, MaterializeError> {
        Err(MaterializeError::Write {
            item_id: item.item_id.clone(),
            source: anyhow::anyhow!("ledger unavailable"),
        })
    }

    async fn list_for_user(&self, _user_id: &str) -> Result<Vec<Purchase>, MaterializeError> {
        Ok(Vec::new())
    }
}

/// Order store with no reachable database.
struct UnreachableStore;

fn unreachable() -> StoreError {
    StoreError::Database(anyhow::anyhow!("server selection timeout"))
}

#[async_trait]
impl OrderStore for UnreachableStore {
    async fn create(&self, _order: NewPaymentOrder) -> Result<PaymentOrder, StoreError> {
        Err(unreachable())
    }

    async fn find_by_merchant_order_id(
        &self,
        _merchant_order_id: &str,
    ) -> Result<Option<PaymentOrder>, StoreError> {
        Err(unreachable())
    }

    async fn compare_and_set(
        &self,
        _merchant_order_id: &str,
        _expected_version: i64,
        _patch: &OrderPatch,
    ) -> Result<CasOutcome, StoreError> {
        Err(unreachable())
    }

    async fn list_stale_pending(
        &self,
        _created_before: DateTime,
        _limit: usize,
    ) -> Result<Vec<PaymentOrder>, StoreError> {
        Err(unreachable())
    }
}

#[tokio::test]
async fn bad_signature_is_rejected_without_state_change() {
    let app = TestApp::spawn().await;
    app.mount_precreate_success("P1").await;
    let created = app.create_two_book_order().await;
    let merchant_order_id = created["merchantOrderId"].as_str().unwrap();

    let forged = signed_callback(&paid_callback(merchant_order_id), "wrong-key");
    let response = app.post_json("/kbzpay-callback", &forged).await;
    assert_eq!(response.status().as_u16(), 401);

    let order: Value = app
        .get(&format!("/orders/{}", merchant_order_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(order["status"], "pending");
}

#[tokio::test]
async fn tampered_amount_fails_verification() {
    let app = TestApp::spawn().await;
    app.mount_precreate_success("P1").await;
    let created = app.create_two_book_order().await;
    let merchant_order_id = created["merchantOrderId"].as_str().unwrap();

    let mut body = signed_callback(&paid_callback(merchant_order_id), common::TEST_APP_KEY);
    body["Request"]["total_amount"] = Value::String("1".to_string());

    let response = app.post_json("/kbzpay-callback", &body).await;
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn unknown_order_is_404() {
    let app = TestApp::spawn().await;
    let response = app.send_callback(&paid_callback("BK-does-not-exist")).await;
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn malformed_body_is_400() {
    let app = TestApp::spawn().await;
    let response = app
        .post_raw("/kbzpay-callback", "not json".to_string())
        .await;
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn waiting_status_is_acknowledged_and_leaves_order_pending() {
    let app = TestApp::spawn().await;
    app.mount_precreate_success("P1").await;
    let created = app.create_two_book_order().await;
    let merchant_order_id = created["merchantOrderId"].as_str().unwrap();

    let response = app
        .send_callback(&[
            ("merch_order_id", merchant_order_id),
            ("trade_status", "WAIT_PAY"),
        ])
        .await;
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "success");

    let order: Value = app
        .get(&format!("/orders/{}", merchant_order_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(order["status"], "pending");
}

#[tokio::test]
async fn concurrent_deliveries_record_purchases_once() {
    let app = TestApp::spawn().await;
    app.mount_precreate_success("P1").await;
    let created = app.create_two_book_order().await;
    let merchant_order_id = created["merchantOrderId"].as_str().unwrap().to_string();

    let body = signed_callback(&paid_callback(&merchant_order_id), common::TEST_APP_KEY);
    let url = format!("{}/kbzpay-callback", app.address);
    let requests = (0..8).map(|_| {
        let client = app.client.clone();
        let url = url.clone();
        let body = body.clone();
        async move { client.post(url).json(&body).send().await }
    });

    for response in futures::future::join_all(requests).await {
        let response = response.expect("Failed to execute request");
        assert_eq!(response.status().as_u16(), 200);
    }

    let purchases: Vec<Value> = app
        .get(&format!("/users/{}/purchases", TEST_USER_ID))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(purchases.len(), 2);
}

#[tokio::test]
async fn ledger_failure_is_acknowledged_and_flags_order() {
    let app = TestApp::spawn_with_stores(
        Arc::new(InMemoryOrderStore::new()),
        Arc::new(UnavailableLedger),
    )
    .await;
    app.mount_precreate_success("P1").await;
    let created = app.create_two_book_order().await;
    let merchant_order_id = created["merchantOrderId"].as_str().unwrap();

    let response = app.send_callback(&paid_callback(merchant_order_id)).await;
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "success");

    let order: Value = app
        .get(&format!("/orders/{}", merchant_order_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(order["status"], "completed_with_errors");
    assert_eq!(order["errorCode"], "MATERIALIZATION_FAILED");
    assert!(order["paidAt"].is_string());
}

#[tokio::test]
async fn store_outage_is_acknowledged() {
    let app = TestApp::spawn_with_stores(
        Arc::new(UnreachableStore),
        Arc::new(UnavailableLedger),
    )
    .await;

    let response = app.send_callback(&paid_callback("BK1")).await;
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "success");
}

#[tokio::test]
async fn signed_callback_without_order_id_is_acknowledged() {
    let app = TestApp::spawn().await;

    let response = app.send_callback(&[("trade_status", "PAY_SUCCESS")]).await;
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "success");
}
