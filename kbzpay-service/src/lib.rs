pub mod config;
pub mod dtos;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;

use axum::middleware::from_fn;
use axum::{
    routing::{get, post},
    Router,
};
use mongodb::{options::ClientOptions, Client};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{metrics_middleware, request_id, request_id_middleware};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use config::{Config, StorageBackend};
use services::{
    init_metrics, InMemoryOrderStore, InMemoryPurchaseLedger, KbzPayClient, MongoOrderStore,
    MongoPurchaseLedger, OrderLifecycle, OrderStore, PurchaseLedger, Reconciler,
};

#[derive(Clone)]
pub struct AppState {
    /// `None` when running on the in-memory backend.
    pub db: Option<mongodb::Database>,
    pub config: Config,
    pub gateway: KbzPayClient,
    pub lifecycle: OrderLifecycle,
    pub reconciler: Reconciler,
}

pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application, connecting to the configured storage backend.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        let gateway = KbzPayClient::new(config.kbzpay.clone())?;
        Self::build_with_gateway(config, gateway).await
    }

    /// Build with an explicit gateway client (tests override its retry policy).
    pub async fn build_with_gateway(
        config: Config,
        gateway: KbzPayClient,
    ) -> Result<Self, AppError> {
        match config.database.backend {
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage; orders are lost on restart");
                Self::build_with(
                    config,
                    gateway,
                    Arc::new(InMemoryOrderStore::new()),
                    Arc::new(InMemoryPurchaseLedger::new()),
                    None,
                )
                .await
            }
            StorageBackend::Mongodb => {
                let mut client_options = ClientOptions::parse(config.database.url.expose_secret())
                    .await
                    .map_err(|e| {
                        tracing::error!("Failed to parse MongoDB connection string: {}", e);
                        AppError::DatabaseError(e.into())
                    })?;
                client_options.app_name = Some(config.service_name.clone());

                let client = Client::with_options(client_options).map_err(|e| {
                    tracing::error!("Failed to create MongoDB client: {}", e);
                    AppError::DatabaseError(e.into())
                })?;
                let db = client.database(&config.database.db_name);

                let orders = MongoOrderStore::new(&db);
                orders.init_indexes().await.map_err(|e| {
                    tracing::error!("Failed to initialize order indexes: {}", e);
                    AppError::from(e)
                })?;
                let ledger = MongoPurchaseLedger::new(&db);
                ledger.init_indexes().await?;

                Self::build_with(config, gateway, Arc::new(orders), Arc::new(ledger), Some(db))
                    .await
            }
        }
    }

    /// Build on top of already constructed stores.
    pub async fn build_with(
        config: Config,
        gateway: KbzPayClient,
        orders: Arc<dyn OrderStore>,
        ledger: Arc<dyn PurchaseLedger>,
        db: Option<mongodb::Database>,
    ) -> Result<Self, AppError> {
        init_metrics();

        if gateway.is_configured() {
            tracing::info!("KBZPay client initialized");
        } else {
            tracing::warn!("KBZPay credentials not configured - payment creation disabled");
        }

        let lifecycle = OrderLifecycle::new(orders, ledger);
        let reconciler = Reconciler::new(
            gateway.clone(),
            lifecycle.clone(),
            config.reconciliation.clone(),
        );

        let state = AppState {
            db,
            config: config.clone(),
            gateway,
            lifecycle,
            reconciler,
        };

        // Port 0 binds a random port for tests
        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = TcpListener::bind(addr.as_str()).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let sweeper = self
            .state
            .config
            .reconciliation
            .interval_secs
            .filter(|secs| *secs > 0)
            .map(|secs| {
                tracing::info!(interval_secs = secs, "Starting pending order sweeper");
                self.state
                    .reconciler
                    .clone()
                    .spawn_periodic(Duration::from_secs(secs))
            });

        tracing::info!("kbzpay-service listening on port {}", self.port);
        let result = axum::serve(self.listener, router(self.state)).await;

        if let Some(handle) = sweeper {
            handle.abort();
        }
        result
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .route("/create-payment", post(handlers::payments::create_payment))
        .route("/verify-payment", post(handlers::payments::verify_payment))
        .route("/kbzpay-callback", post(handlers::webhook::kbzpay_callback))
        .route(
            "/orders/:merchant_order_id",
            get(handlers::payments::get_order),
        )
        .route(
            "/users/:user_id/purchases",
            get(handlers::payments::list_purchases),
        )
        .route(
            "/reconcile-pending",
            post(handlers::payments::reconcile_pending),
        )
        .route_layer(from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    request_id = %request_id(request.headers()),
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}
