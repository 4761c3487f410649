//! KBZPay gateway client.
//!
//! Implements the pre-create and query-order APIs and builds the signed PWA
//! redirect URL. Each call gets its own timestamp and nonce; nothing is kept
//! between calls except configuration.

use crate::config::KbzPayConfig;
use crate::services::signer::{self, SignParams, SIGN_TYPE_SHA256};
use crate::utils::{
    generate_nonce, normalize_epoch_seconds, parse_amount, parse_epoch_seconds, unix_timestamp,
};
use chrono::Utc;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use service_core::error::AppError;
use service_core::retry::{retry_async, RetryConfig};
use thiserror::Error;

pub const PRECREATE_METHOD: &str = "kbz.payment.precreate";
pub const PRECREATE_VERSION: &str = "1.0";
pub const QUERY_METHOD: &str = "kbz.payment.queryorder";
pub const QUERY_VERSION: &str = "3.0";

/// Transport-level failures. Business rejections (`result != SUCCESS`) are
/// returned as values, never as this error.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("KBZPay credentials not configured")]
    NotConfigured,

    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("gateway request timed out")]
    Timeout,

    #[error("could not connect to gateway: {0}")]
    Connect(String),

    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("gateway returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed gateway response: {0}")]
    MalformedBody(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Timeout | GatewayError::Connect(_) | GatewayError::Transport(_) => true,
            GatewayError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The request never reached the gateway.
    pub fn is_connect(&self) -> bool {
        matches!(self, GatewayError::Connect(_))
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotConfigured => {
                AppError::ServiceUnavailable("Payment gateway is not configured".to_string())
            }
            GatewayError::ClientBuild(msg) => AppError::InternalError(anyhow::anyhow!(msg)),
            other => AppError::ServiceUnavailable(format!("Payment gateway unavailable: {}", other)),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else if err.is_connect() {
            GatewayError::Connect(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

/// Gateway `result` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayOutcome {
    Success,
    Failure,
}

impl GatewayOutcome {
    fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("SUCCESS") {
            GatewayOutcome::Success
        } else {
            GatewayOutcome::Failure
        }
    }
}

/// Gateway trade-status vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeStatus {
    WaitPay,
    Paying,
    PaySuccess,
    PayFailed,
    OrderExpired,
    OrderClosed,
    Unknown(String),
}

impl TradeStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "WAIT_PAY" => TradeStatus::WaitPay,
            "PAYING" => TradeStatus::Paying,
            "PAY_SUCCESS" => TradeStatus::PaySuccess,
            "PAY_FAILED" => TradeStatus::PayFailed,
            "ORDER_EXPIRED" => TradeStatus::OrderExpired,
            "ORDER_CLOSED" => TradeStatus::OrderClosed,
            other => TradeStatus::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TradeStatus::WaitPay => "WAIT_PAY",
            TradeStatus::Paying => "PAYING",
            TradeStatus::PaySuccess => "PAY_SUCCESS",
            TradeStatus::PayFailed => "PAY_FAILED",
            TradeStatus::OrderExpired => "ORDER_EXPIRED",
            TradeStatus::OrderClosed => "ORDER_CLOSED",
            TradeStatus::Unknown(raw) => raw,
        }
    }
}

/// Result of `kbz.payment.precreate`.
#[derive(Debug, Clone)]
pub struct CreateOrderResult {
    pub result: GatewayOutcome,
    pub prepay_id: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
    /// Response body as received.
    pub raw: String,
}

/// Result of `kbz.payment.queryorder`.
#[derive(Debug, Clone)]
pub struct QueryOrderResult {
    pub result: GatewayOutcome,
    pub trade_status: Option<TradeStatus>,
    pub paid_amount: Option<i64>,
    pub gateway_order_id: Option<String>,
    pub paid_at_epoch_seconds: Option<i64>,
    pub code: Option<String>,
    pub message: Option<String>,
    pub raw: String,
}

#[derive(Debug, Serialize)]
struct PrecreateBizContent<'a> {
    appid: &'a str,
    merch_code: &'a str,
    merch_order_id: &'a str,
    trade_type: &'a str,
    title: &'a str,
    total_amount: String,
    trans_currency: &'a str,
    timeout_express: &'a str,
    callback_info: &'a str,
}

#[derive(Debug, Serialize)]
struct QueryBizContent<'a> {
    appid: &'a str,
    merch_code: &'a str,
    merch_order_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    #[serde(rename = "Response")]
    response: GatewayResponse,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    result: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    prepay_id: Option<String>,
    #[serde(default)]
    trade_status: Option<String>,
    #[serde(default)]
    total_amount: Option<Value>,
    #[serde(default)]
    mm_order_id: Option<String>,
    #[serde(default)]
    pay_success_time: Option<Value>,
}

/// KBZPay client. Cheap to clone; safe to use concurrently.
#[derive(Clone)]
pub struct KbzPayClient {
    client: Client,
    config: KbzPayConfig,
    retry: RetryConfig,
}

impl KbzPayClient {
    pub fn new(config: KbzPayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| GatewayError::ClientBuild(e.to_string()))?;
        let retry = RetryConfig::with_max_retries(config.max_retries);

        Ok(Self {
            client,
            config,
            retry,
        })
    }

    /// Override the retry policy (tests use a zero backoff).
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    pub fn currency(&self) -> &'static str {
        crate::models::CURRENCY_MMK
    }

    /// Create a gateway order.
    ///
    /// Only retried when the request never reached the gateway, so a retry
    /// cannot register the same merchant order twice.
    pub async fn create_order(
        &self,
        merchant_order_id: &str,
        total_amount: i64,
        title: &str,
        callback_info: &str,
    ) -> Result<CreateOrderResult, GatewayError> {
        self.ensure_configured()?;

        let biz_content = PrecreateBizContent {
            appid: &self.config.app_id,
            merch_code: &self.config.merchant_code,
            merch_order_id: merchant_order_id,
            trade_type: &self.config.trade_type,
            title,
            total_amount: total_amount.to_string(),
            trans_currency: self.currency(),
            timeout_express: &self.config.timeout_express,
            callback_info,
        };
        let url = format!("{}/precreate", self.config.api_base_url);

        let body = retry_async(&self.retry, "kbzpay_precreate", GatewayError::is_connect, || {
            // Fresh timestamp and nonce per attempt.
            let envelope = self.signed_envelope(
                PRECREATE_METHOD,
                PRECREATE_VERSION,
                Some(self.config.notify_url.as_str()),
                &biz_content,
            );
            self.post(&url, envelope)
        })
        .await?;

        let response = parse_response(&body)?;
        let result = GatewayOutcome::parse(&response.result);

        match result {
            GatewayOutcome::Success => tracing::info!(
                merchant_order_id = %merchant_order_id,
                prepay_id = ?response.prepay_id,
                "KBZPay order created"
            ),
            GatewayOutcome::Failure => tracing::warn!(
                merchant_order_id = %merchant_order_id,
                code = ?response.code,
                msg = ?response.msg,
                "KBZPay rejected order creation"
            ),
        }

        Ok(CreateOrderResult {
            result,
            prepay_id: response.prepay_id.filter(|id| !id.is_empty()),
            code: response.code,
            message: response.msg,
            raw: body,
        })
    }

    /// Query the gateway for the current trade status of an order.
    pub async fn query_order(
        &self,
        merchant_order_id: &str,
    ) -> Result<QueryOrderResult, GatewayError> {
        self.ensure_configured()?;

        let biz_content = QueryBizContent {
            appid: &self.config.app_id,
            merch_code: &self.config.merchant_code,
            merch_order_id: merchant_order_id,
        };
        let url = format!("{}/queryorder", self.config.api_base_url);

        let body = retry_async(&self.retry, "kbzpay_queryorder", GatewayError::is_retryable, || {
            let envelope = self.signed_envelope(QUERY_METHOD, QUERY_VERSION, None, &biz_content);
            self.post(&url, envelope)
        })
        .await?;

        let response = parse_response(&body)?;
        let trade_status = response
            .trade_status
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(TradeStatus::parse);

        tracing::debug!(
            merchant_order_id = %merchant_order_id,
            result = %response.result,
            trade_status = ?trade_status,
            "KBZPay order queried"
        );

        Ok(QueryOrderResult {
            result: GatewayOutcome::parse(&response.result),
            trade_status,
            paid_amount: response.total_amount.as_ref().and_then(value_to_amount),
            gateway_order_id: response.mm_order_id.filter(|id| !id.is_empty()),
            paid_at_epoch_seconds: response.pay_success_time.as_ref().and_then(value_to_epoch),
            code: response.code,
            message: response.msg,
            raw: body,
        })
    }

    /// Build the signed PWA checkout URL for a prepay id.
    ///
    /// This signature covers only the redirect parameters and is unrelated to
    /// the one sent with the pre-create request.
    pub fn build_redirect_url(&self, prepay_id: &str) -> Result<String, GatewayError> {
        self.ensure_configured()?;

        let mut params = SignParams::new();
        params.insert("appid".to_string(), self.config.app_id.clone());
        params.insert("merch_code".to_string(), self.config.merchant_code.clone());
        params.insert("nonce_str".to_string(), generate_nonce());
        params.insert("prepay_id".to_string(), prepay_id.to_string());
        params.insert("timestamp".to_string(), unix_timestamp(Utc::now()));

        let signature = signer::sign(&params, self.config.app_key.expose_secret());
        params.insert(signer::SIGN_FIELD.to_string(), signature);

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let separator = if self.config.redirect_base_url.contains('?') {
            '&'
        } else {
            '?'
        };

        Ok(format!(
            "{}{}{}",
            self.config.redirect_base_url, separator, query
        ))
    }

    /// Verify a signed parameter map received from the gateway.
    pub fn verify_signature(&self, params: &SignParams) -> bool {
        signer::verify(params, self.config.app_key.expose_secret())
    }

    fn ensure_configured(&self) -> Result<(), GatewayError> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(GatewayError::NotConfigured)
        }
    }

    fn signed_envelope<B: Serialize>(
        &self,
        method: &str,
        version: &str,
        notify_url: Option<&str>,
        biz_content: &B,
    ) -> Value {
        let mut request = json!({
            "timestamp": unix_timestamp(Utc::now()),
            "nonce_str": generate_nonce(),
            "sign_type": SIGN_TYPE_SHA256,
            "version": version,
            "method": method,
            "biz_content": biz_content,
        });

        if let Some(url) = notify_url.filter(|u| !u.is_empty()) {
            request["notify_url"] = Value::String(url.to_string());
        }

        let signature = signer::sign(
            &signer::flatten(&request),
            self.config.app_key.expose_secret(),
        );
        request[signer::SIGN_FIELD] = Value::String(signature);

        json!({ "Request": request })
    }

    async fn post(&self, url: &str, envelope: Value) -> Result<String, GatewayError> {
        let response = self.client.post(url).json(&envelope).send().await?;

        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(status = %status, body = %body, "KBZPay response");

        if status.is_success() {
            Ok(body)
        } else {
            Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

fn parse_response(body: &str) -> Result<GatewayResponse, GatewayError> {
    serde_json::from_str::<ResponseEnvelope>(body)
        .map(|envelope| envelope.response)
        .map_err(|e| GatewayError::MalformedBody(e.to_string()))
}

fn value_to_amount(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => parse_amount(s),
        _ => None,
    }
}

/// Accepts epoch seconds or milliseconds, as a number or numeric string.
fn value_to_epoch(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().and_then(normalize_epoch_seconds),
        Value::String(s) => parse_epoch_seconds(s),
        _ => None,
    }
}
