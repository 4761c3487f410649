mod common;

use common::TestApp;
use serde_json::Value;

#[tokio::test]
async fn health_check_works() {
    let app = TestApp::spawn().await;

    let response = app.get("/health").await;
    assert!(response.status().is_success());

    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "kbzpay-service");
}

#[tokio::test]
async fn readiness_check_works() {
    let app = TestApp::spawn().await;

    let response = app.get("/ready").await;
    assert!(response.status().is_success());

    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["database"], "memory");
    assert_eq!(body["gateway"], "configured");
}

#[tokio::test]
async fn readiness_fails_without_gateway_credentials() {
    let app = TestApp::spawn_with(|config| {
        config.kbzpay.app_id = String::new();
    })
    .await;

    let response = app.get("/ready").await;
    assert_eq!(response.status().as_u16(), 503);
}

#[tokio::test]
async fn responses_carry_request_id() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(format!("{}/health", app.address))
        .header("x-request-id", "req-123")
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("req-123")
    );
}

#[tokio::test]
async fn metrics_endpoint_renders_payment_counters() {
    let app = TestApp::spawn().await;
    app.get("/health").await;

    let response = app.get("/metrics").await;
    assert!(response.status().is_success());
    let body = response.text().await.unwrap();
    assert!(body.contains("payment_late_success_total"));
}
