//! Services module for subscription-service.

pub mod catalog;
pub mod database;
pub mod events;
pub mod history;
pub mod ledger;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod payment;
pub mod store;

pub use catalog::{FeatureCatalog, FeatureLookup};
pub use database::Database;
pub use events::{ChannelEventSink, EventSink, SubscriptionEvent, TracingEventSink};
pub use history::SubscriptionHistory;
pub use ledger::UsageLedger;
pub use lifecycle::{Extension, ExtensionKind, LifecycleManager, SubscriberAccount};
pub use memory::{InMemoryCatalog, InMemoryStore};
pub use metrics::{get_metrics, init_metrics};
pub use payment::{
    from_minor_units, is_zero_decimal, to_minor_units, ChargeKind, ChargeOutcome, ChargeReceipt,
    ChargeRequest, GatewayError, PaymentCoordinator, PaymentGateway,
};
pub use store::{PlanCatalog, SubscriptionChanges, SubscriptionStore};
