//! In-memory store and catalog.
//!
//! Each trait method holds the state lock for its whole body, so the atomic
//! usage operations run inside a single critical section.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::models::{
    ConsumeOutcome, CustomerRecord, Feature, Plan, ReleaseOutcome, SubscriberRef,
    SubscriptionRecord, UsageRecord,
};
use crate::services::store::{PlanCatalog, SubscriptionChanges, SubscriptionStore};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, AppError> {
    mutex
        .lock()
        .map_err(|_| AppError::InternalError(anyhow::anyhow!("in-memory store lock poisoned")))
}

#[derive(Default)]
struct StoreState {
    /// Insertion order is the listing order.
    subscriptions: Vec<SubscriptionRecord>,
    usages: HashMap<(Uuid, String), UsageRecord>,
    customers: HashMap<SubscriberRef, CustomerRecord>,
}

impl StoreState {
    fn records_of(&self, subscriber: &SubscriberRef) -> Vec<SubscriptionRecord> {
        self.subscriptions
            .iter()
            .filter(|s| s.belongs_to(subscriber))
            .cloned()
            .collect()
    }

    fn contains(&self, subscription_id: Uuid) -> bool {
        self.subscriptions
            .iter()
            .any(|s| s.subscription_id == subscription_id)
    }

    /// Check every change against the current state before any is applied.
    /// Deletes and updates may only touch `own` records.
    fn validate(
        &self,
        own: &[SubscriptionRecord],
        changes: &SubscriptionChanges,
    ) -> Result<(), AppError> {
        let owned = |id: Uuid| own.iter().any(|s| s.subscription_id == id);
        for id in changes.deleted.iter().copied() {
            if !owned(id) {
                return Err(AppError::NotFound(anyhow::anyhow!("subscription {} not found", id)));
            }
        }
        for record in &changes.updated {
            if !owned(record.subscription_id) || changes.deleted.contains(&record.subscription_id) {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "subscription {} not found",
                    record.subscription_id
                )));
            }
        }
        for (i, record) in changes.inserted.iter().enumerate() {
            let repeated = changes.inserted[..i]
                .iter()
                .any(|other| other.subscription_id == record.subscription_id);
            if self.contains(record.subscription_id) || repeated {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "subscription {} already exists",
                    record.subscription_id
                )));
            }
        }
        Ok(())
    }

    fn usage_entry(
        &mut self,
        subscription_id: Uuid,
        code: &str,
        now: DateTime<Utc>,
    ) -> &mut UsageRecord {
        self.usages
            .entry((subscription_id, code.to_string()))
            .or_insert_with(|| UsageRecord::new(subscription_id, code, now))
    }
}

/// Subscription store backed by process memory.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn insert_subscription(&self, record: &SubscriptionRecord) -> Result<(), AppError> {
        let mut state = lock(&self.state)?;
        if state
            .subscriptions
            .iter()
            .any(|s| s.subscription_id == record.subscription_id)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "subscription {} already exists",
                record.subscription_id
            )));
        }
        state.subscriptions.push(record.clone());
        Ok(())
    }

    async fn apply_changes(
        &self,
        subscriber: &SubscriberRef,
        seen: &[SubscriptionRecord],
        changes: &SubscriptionChanges,
    ) -> Result<(), AppError> {
        changes.ensure_owned_by(subscriber)?;
        let mut state = lock(&self.state)?;
        let current = state.records_of(subscriber);
        if current != seen {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "subscriptions of {} changed concurrently",
                subscriber
            )));
        }
        state.validate(&current, changes)?;

        state
            .subscriptions
            .retain(|s| !changes.deleted.contains(&s.subscription_id));
        state
            .usages
            .retain(|(id, _), _| !changes.deleted.contains(id));
        for record in &changes.updated {
            if let Some(existing) = state
                .subscriptions
                .iter_mut()
                .find(|s| s.subscription_id == record.subscription_id)
            {
                *existing = record.clone();
            }
        }
        state.subscriptions.extend(changes.inserted.iter().cloned());
        Ok(())
    }

    async fn update_subscription(&self, record: &SubscriptionRecord) -> Result<(), AppError> {
        let mut state = lock(&self.state)?;
        let existing = state
            .subscriptions
            .iter_mut()
            .find(|s| s.subscription_id == record.subscription_id)
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("subscription {} not found", record.subscription_id))
            })?;
        *existing = record.clone();
        Ok(())
    }

    async fn delete_subscription(&self, subscription_id: Uuid) -> Result<bool, AppError> {
        let mut state = lock(&self.state)?;
        let before = state.subscriptions.len();
        state
            .subscriptions
            .retain(|s| s.subscription_id != subscription_id);
        if state.subscriptions.len() == before {
            return Ok(false);
        }
        state.usages.retain(|(id, _), _| *id != subscription_id);
        Ok(true)
    }

    async fn subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<SubscriptionRecord>, AppError> {
        Ok(lock(&self.state)?
            .subscriptions
            .iter()
            .find(|s| s.subscription_id == subscription_id)
            .cloned())
    }

    async fn subscriptions_of(
        &self,
        subscriber: &SubscriberRef,
    ) -> Result<Vec<SubscriptionRecord>, AppError> {
        Ok(lock(&self.state)?.records_of(subscriber))
    }

    async fn usage(
        &self,
        subscription_id: Uuid,
        code: &str,
    ) -> Result<Option<UsageRecord>, AppError> {
        Ok(lock(&self.state)?
            .usages
            .get(&(subscription_id, code.to_string()))
            .cloned())
    }

    async fn usages(&self, subscription_id: Uuid) -> Result<Vec<UsageRecord>, AppError> {
        let state = lock(&self.state)?;
        let mut usages: Vec<UsageRecord> = state
            .usages
            .values()
            .filter(|u| u.subscription_id == subscription_id)
            .cloned()
            .collect();
        usages.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(usages)
    }

    async fn consume_usage(
        &self,
        subscription_id: Uuid,
        code: &str,
        amount: Decimal,
        ceiling: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, AppError> {
        let mut state = lock(&self.state)?;
        let usage = state.usage_entry(subscription_id, code, now);

        if let Some(ceiling) = ceiling {
            if usage.used + amount > ceiling {
                return Ok(ConsumeOutcome::WouldExceed(usage.clone()));
            }
        }

        usage.used += amount;
        usage.updated_utc = now;
        Ok(ConsumeOutcome::Applied(usage.clone()))
    }

    async fn release_usage(
        &self,
        subscription_id: Uuid,
        code: &str,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, AppError> {
        let mut state = lock(&self.state)?;
        let usage = state.usage_entry(subscription_id, code, now);

        let previous_used = usage.used;
        usage.used = (usage.used - amount).max(Decimal::ZERO);
        usage.updated_utc = now;

        Ok(ReleaseOutcome {
            record: usage.clone(),
            previous_used,
        })
    }

    async fn customer(
        &self,
        subscriber: &SubscriberRef,
    ) -> Result<Option<CustomerRecord>, AppError> {
        Ok(lock(&self.state)?.customers.get(subscriber).cloned())
    }

    async fn insert_customer(&self, record: &CustomerRecord) -> Result<(), AppError> {
        let subscriber = SubscriberRef::new(&record.subscriber_type, &record.subscriber_id);
        let mut state = lock(&self.state)?;
        if state.customers.contains_key(&subscriber) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "customer record for {} already exists",
                subscriber
            )));
        }
        state.customers.insert(subscriber, record.clone());
        Ok(())
    }

    async fn delete_customer(&self, subscriber: &SubscriberRef) -> Result<bool, AppError> {
        Ok(lock(&self.state)?.customers.remove(subscriber).is_some())
    }
}

/// Plan catalog backed by process memory.
#[derive(Default)]
pub struct InMemoryCatalog {
    plans: Mutex<Vec<Plan>>,
    features: Mutex<Vec<Feature>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_plan(&self, plan: Plan) -> Result<(), AppError> {
        lock(&self.plans)?.push(plan);
        Ok(())
    }

    /// Attach a feature to its plan. Codes are unique within a plan.
    pub fn insert_feature(&self, feature: Feature) -> Result<(), AppError> {
        let mut features = lock(&self.features)?;
        if features
            .iter()
            .any(|f| f.plan_id == feature.plan_id && f.code == feature.code)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "feature {} already exists on plan {}",
                feature.code, feature.plan_id
            )));
        }
        features.push(feature);
        Ok(())
    }
}

#[async_trait]
impl PlanCatalog for InMemoryCatalog {
    async fn plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError> {
        Ok(lock(&self.plans)?
            .iter()
            .find(|p| p.plan_id == plan_id)
            .cloned())
    }

    async fn first_plan(&self) -> Result<Option<Plan>, AppError> {
        Ok(lock(&self.plans)?.first().cloned())
    }

    async fn features(&self, plan_id: Uuid) -> Result<Vec<Feature>, AppError> {
        Ok(lock(&self.features)?
            .iter()
            .filter(|f| f.plan_id == plan_id)
            .cloned()
            .collect())
    }
}
