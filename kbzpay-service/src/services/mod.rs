pub mod kbzpay;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod purchases;
pub mod reconciler;
pub mod repository;
pub mod signer;

pub use kbzpay::{GatewayError, KbzPayClient};
pub use lifecycle::{ApplyOutcome, EventSource, GatewayEvent, OrderLifecycle};
pub use memory::{InMemoryOrderStore, InMemoryPurchaseLedger};
pub use self::metrics::{get_metrics, init_metrics};
pub use purchases::{MongoPurchaseLedger, PurchaseLedger};
pub use reconciler::Reconciler;
pub use repository::{MongoOrderStore, OrderStore};
