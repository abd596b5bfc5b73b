//! Domain models for subscription-service.

mod customer;
mod feature;
mod payment_method;
mod plan;
mod subscription;
mod term;
mod usage;

pub use customer::CustomerRecord;
pub use feature::{Feature, FeatureKind, FeatureLimit};
pub use payment_method::PaymentMethod;
pub use plan::Plan;
pub use subscription::{NewSubscription, SubscriberRef, SubscriptionRecord};
pub use term::Term;
pub use usage::{ConsumeOutcome, ReleaseOutcome, Remaining, UsageChange, UsageRecord};
