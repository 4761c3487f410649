#![allow(dead_code)]

use kbzpay_service::config::{
    Config, DatabaseConfig, KbzPayConfig, ReconciliationConfig, ServerConfig, StorageBackend,
    WebhookConfig,
};
use kbzpay_service::services::signer::{self, SignParams, SIGN_TYPE_SHA256};
use kbzpay_service::services::{KbzPayClient, OrderStore, PurchaseLedger};
use kbzpay_service::{AppState, Application};
use secrecy::Secret;
use serde_json::{json, Map, Value};
use service_core::retry::RetryConfig;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_APP_KEY: &str = "test_app_key";
pub const TEST_USER_ID: &str = "user-1";

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub gateway: MockServer,
    pub state: AppState,
    pub client: reqwest::Client,
}

pub fn test_config(gateway_url: &str) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Random port
        },
        database: DatabaseConfig {
            backend: StorageBackend::Memory,
            url: Secret::new("mongodb://unused".to_string()),
            db_name: "kbzpay_test".to_string(),
        },
        kbzpay: KbzPayConfig {
            api_base_url: gateway_url.to_string(),
            redirect_base_url: "https://static.kbzpay.com/pgw/uat/pwa/#/".to_string(),
            app_id: "kp_test_app".to_string(),
            merchant_code: "200001".to_string(),
            app_key: Secret::new(TEST_APP_KEY.to_string()),
            notify_url: "https://shop.example/kbzpay-callback".to_string(),
            trade_type: "PWAAPP".to_string(),
            timeout_express: "120m".to_string(),
            request_timeout_secs: 2,
            max_retries: 1,
        },
        webhook: WebhookConfig {
            ack_timeout_ms: 3000,
        },
        reconciliation: ReconciliationConfig {
            stale_after_secs: 0,
            batch_size: 50,
            interval_secs: None,
        },
        service_name: "kbzpay-service-test".to_string(),
        log_level: "warn".to_string(),
        otlp_endpoint: None,
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    /// Spawn with a config tweak applied on top of the test defaults.
    pub async fn spawn_with(configure: impl FnOnce(&mut Config)) -> Self {
        let gateway = MockServer::start().await;
        let mut config = test_config(&gateway.uri());
        configure(&mut config);

        let client = gateway_client(&config);
        let app = Application::build_with_gateway(config, client)
            .await
            .expect("Failed to build test application");

        Self::launch(app, gateway).await
    }

    /// Spawn on top of caller-supplied stores.
    pub async fn spawn_with_stores(
        orders: Arc<dyn OrderStore>,
        ledger: Arc<dyn PurchaseLedger>,
    ) -> Self {
        let gateway = MockServer::start().await;
        let config = test_config(&gateway.uri());

        let client = gateway_client(&config);
        let app = Application::build_with(config, client, orders, ledger, None)
            .await
            .expect("Failed to build test application");

        Self::launch(app, gateway).await
    }

    async fn launch(app: Application, gateway: MockServer) -> Self {
        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);
        let state = app.state();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        TestApp {
            address,
            port,
            gateway,
            state,
            client,
        }
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.address, path))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.address, path))
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn post_raw(&self, path: &str, body: String) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.address, path))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn mount_precreate_success(&self, prepay_id: &str) {
        Mock::given(method("POST"))
            .and(path("/precreate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Response": {
                    "result": "SUCCESS",
                    "code": "0",
                    "msg": "success",
                    "prepay_id": prepay_id
                }
            })))
            .mount(&self.gateway)
            .await;
    }

    pub async fn mount_query(&self, trade_status: &str) {
        Mock::given(method("POST"))
            .and(path("/queryorder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Response": {
                    "result": "SUCCESS",
                    "code": "0",
                    "trade_status": trade_status,
                    "total_amount": "13000",
                    "mm_order_id": "G1",
                    "pay_success_time": "1700000000"
                }
            })))
            .mount(&self.gateway)
            .await;
    }

    /// Create the two-book order used throughout the tests.
    pub async fn create_two_book_order(&self) -> Value {
        let response = self
            .post_json(
                "/create-payment",
                &json!({
                    "userId": TEST_USER_ID,
                    "bookIds": ["A", "B"],
                    "amounts": [5000, 8000]
                }),
            )
            .await;
        assert_eq!(response.status().as_u16(), 201);
        response.json().await.expect("Failed to parse JSON")
    }

    pub async fn send_callback(&self, fields: &[(&str, &str)]) -> reqwest::Response {
        self.post_json("/kbzpay-callback", &signed_callback(fields, TEST_APP_KEY))
            .await
    }
}

fn gateway_client(config: &Config) -> KbzPayClient {
    KbzPayClient::new(config.kbzpay.clone())
        .expect("Failed to build gateway client")
        .with_retry(RetryConfig {
            initial_backoff: Duration::from_millis(1),
            add_jitter: false,
            ..RetryConfig::with_max_retries(config.kbzpay.max_retries)
        })
}

/// Callback body signed the way the gateway signs it.
pub fn signed_callback(fields: &[(&str, &str)], secret: &str) -> Value {
    let mut params: SignParams = fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    params.insert(
        signer::SIGN_TYPE_FIELD.to_string(),
        SIGN_TYPE_SHA256.to_string(),
    );
    let signature = signer::sign(&params, secret);
    params.insert(signer::SIGN_FIELD.to_string(), signature);

    let request: Map<String, Value> = params
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    json!({ "Request": request })
}

pub fn paid_callback(merchant_order_id: &str) -> Vec<(&str, &str)> {
    vec![
        ("merch_order_id", merchant_order_id),
        ("trade_status", "PAY_SUCCESS"),
        ("total_amount", "13000"),
        ("mm_order_id", "G1"),
        ("trans_currency", "MMK"),
    ]
}
