//! Persistence seams for the lifecycle manager and the usage ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{
    ConsumeOutcome, CustomerRecord, Feature, Plan, ReleaseOutcome, SubscriberRef,
    SubscriptionRecord, UsageRecord,
};

/// Subscription writes that land together or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionChanges {
    pub deleted: Vec<Uuid>,
    pub updated: Vec<SubscriptionRecord>,
    pub inserted: Vec<SubscriptionRecord>,
}

impl SubscriptionChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delete(mut self, subscription_id: Uuid) -> Self {
        self.deleted.push(subscription_id);
        self
    }

    pub fn update(mut self, record: SubscriptionRecord) -> Self {
        self.updated.push(record);
        self
    }

    pub fn insert(mut self, record: SubscriptionRecord) -> Self {
        self.inserted.push(record);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.updated.is_empty() && self.inserted.is_empty()
    }

    /// Every touched record must belong to `subscriber`.
    pub fn ensure_owned_by(&self, subscriber: &SubscriberRef) -> Result<(), AppError> {
        let foreign = self
            .updated
            .iter()
            .chain(&self.inserted)
            .find(|record| !record.belongs_to(subscriber));
        match foreign {
            Some(record) => Err(AppError::BadRequest(anyhow::anyhow!(
                "subscription {} does not belong to {}",
                record.subscription_id,
                subscriber
            ))),
            None => Ok(()),
        }
    }
}

/// Read-only access to plans and their features.
#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError>;

    /// The plan used when a subscriber without history extends. Ordered by
    /// creation time.
    async fn first_plan(&self) -> Result<Option<Plan>, AppError>;

    async fn features(&self, plan_id: Uuid) -> Result<Vec<Feature>, AppError>;

    async fn feature(&self, plan_id: Uuid, code: &str) -> Result<Option<Feature>, AppError> {
        Ok(self
            .features(plan_id)
            .await?
            .into_iter()
            .find(|feature| feature.code == code))
    }
}

/// Subscription, usage and customer persistence.
///
/// `consume_usage` and `release_usage` are the only read-modify-write paths on
/// usage counters. Implementations must execute each as one atomic unit.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn insert_subscription(&self, record: &SubscriptionRecord) -> Result<(), AppError>;

    /// Apply `changes` to one subscriber's records as a single unit, provided
    /// the subscriber's records still equal `seen`. When another writer got
    /// there first this fails with `AppError::Conflict`; on any failure
    /// nothing is written.
    async fn apply_changes(
        &self,
        subscriber: &SubscriberRef,
        seen: &[SubscriptionRecord],
        changes: &SubscriptionChanges,
    ) -> Result<(), AppError>;

    /// Overwrite the mutable columns of an existing record.
    async fn update_subscription(&self, record: &SubscriptionRecord) -> Result<(), AppError>;

    /// Delete a record together with its usage. Returns false if it did not exist.
    async fn delete_subscription(&self, subscription_id: Uuid) -> Result<bool, AppError>;

    async fn subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<SubscriptionRecord>, AppError>;

    /// Every record of a subscriber, in insertion order.
    async fn subscriptions_of(
        &self,
        subscriber: &SubscriberRef,
    ) -> Result<Vec<SubscriptionRecord>, AppError>;

    async fn usage(
        &self,
        subscription_id: Uuid,
        code: &str,
    ) -> Result<Option<UsageRecord>, AppError>;

    async fn usages(&self, subscription_id: Uuid) -> Result<Vec<UsageRecord>, AppError>;

    /// Create the usage record if missing, then add `amount` unless that would
    /// push `used` above `ceiling`. `None` means no ceiling.
    async fn consume_usage(
        &self,
        subscription_id: Uuid,
        code: &str,
        amount: Decimal,
        ceiling: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, AppError>;

    /// Create the usage record if missing, then subtract `amount`, flooring at zero.
    async fn release_usage(
        &self,
        subscription_id: Uuid,
        code: &str,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, AppError>;

    async fn customer(&self, subscriber: &SubscriberRef)
        -> Result<Option<CustomerRecord>, AppError>;

    async fn insert_customer(&self, record: &CustomerRecord) -> Result<(), AppError>;

    async fn delete_customer(&self, subscriber: &SubscriberRef) -> Result<bool, AppError>;
}
