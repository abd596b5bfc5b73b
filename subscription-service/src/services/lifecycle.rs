//! Subscription lifecycle orchestration.
//!
//! Every mutating operation takes the subscriber's lock, reads the
//! subscriber's history once at a single instant, validates, and only then
//! writes. All writes of one decision go to the store as a single
//! `SubscriptionChanges` checked against that history, so a rejected or
//! failed operation leaves persisted state untouched.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::LifecycleSettings;
use crate::error::{Rejection, SubscriptionError};
use crate::models::{
    CustomerRecord, NewSubscription, Plan, SubscriberRef, SubscriptionRecord, Term,
};
use crate::services::catalog::FeatureCatalog;
use crate::services::events::{EventSink, SubscriptionEvent};
use crate::services::history::SubscriptionHistory;
use crate::services::ledger::UsageLedger;
use crate::services::metrics::{record_charge, record_subscription_operation};
use crate::services::payment::{
    settle_due_record, ChargeContext, ChargeKind, ChargeOutcome, PaymentCoordinator,
};
use crate::services::store::{PlanCatalog, SubscriptionChanges, SubscriptionStore};

/// How an extension or upgrade was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionKind {
    /// The active record's expiry moved.
    InPlace,
    /// A new record was queued after the active one.
    Chained,
    /// Nothing was active; a new subscription was created from history or
    /// for the requested plan.
    Resubscribed,
    /// Nothing was active and there was no history; the first catalog plan
    /// was used. Depends entirely on catalog ordering.
    CatalogDefault,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extension {
    pub subscription: SubscriptionRecord,
    pub kind: ExtensionKind,
}

impl Extension {
    pub fn is_catalog_default(&self) -> bool {
        self.kind == ExtensionKind::CatalogDefault
    }
}

/// An extension worked out against a history but not yet written.
struct PlannedExtension {
    record: SubscriptionRecord,
    kind: ExtensionKind,
    /// Queued records moved along with an in-place extension.
    shifted: Vec<SubscriptionRecord>,
}

impl PlannedExtension {
    fn changes(&self) -> SubscriptionChanges {
        let changes = self
            .shifted
            .iter()
            .cloned()
            .fold(SubscriptionChanges::new(), SubscriptionChanges::update);
        match self.kind {
            ExtensionKind::Chained => changes.insert(self.record.clone()),
            _ => changes.update(self.record.clone()),
        }
    }
}

type LockMap = DashMap<SubscriberRef, Arc<Mutex<()>>>;

/// A held subscriber lock. Dropping it releases the lock and forgets the
/// subscriber once no other caller holds or waits on it.
struct SubscriberLock {
    locks: Arc<LockMap>,
    subscriber: SubscriberRef,
    mutex: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SubscriberLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Two references remain when idle: the map's and ours.
        self.locks.remove_if(&self.subscriber, |_, mutex| {
            Arc::ptr_eq(mutex, &self.mutex) && Arc::strong_count(mutex) == 2
        });
    }
}

/// Dates of a record about to be created.
struct Period {
    starts_on: DateTime<Utc>,
    expires_on: DateTime<Utc>,
    recurring_each_days: i32,
}

fn days_after(at: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>, Rejection> {
    Duration::try_days(days)
        .and_then(|span| at.checked_add_signed(span))
        .ok_or(Rejection::InvalidDuration(days))
}

fn day_count(days: i64) -> Result<i32, Rejection> {
    i32::try_from(days).map_err(|_| Rejection::InvalidDuration(days))
}

/// A period starting one second before `now`, so it has already started
/// under any clock-equality comparison.
fn fresh_period(term: Term, now: DateTime<Utc>) -> Result<Period, Rejection> {
    let starts_on = now - Duration::seconds(1);
    match term {
        Term::Days(days) if days < 1 => Err(Rejection::InvalidDuration(days)),
        Term::Days(days) => Ok(Period {
            starts_on,
            expires_on: days_after(now, days)?,
            recurring_each_days: day_count(days)?,
        }),
        Term::Until(date) if date <= now => Err(Rejection::DateNotInFuture),
        Term::Until(date) => Ok(Period {
            starts_on,
            expires_on: date,
            recurring_each_days: day_count((date - starts_on).num_days())?,
        }),
    }
}

/// A period starting exactly at `anchor`.
fn chained_period(term: Term, anchor: DateTime<Utc>) -> Result<Period, Rejection> {
    match term {
        Term::Days(days) if days < 1 => Err(Rejection::InvalidDuration(days)),
        Term::Days(days) => Ok(Period {
            starts_on: anchor,
            expires_on: days_after(anchor, days)?,
            recurring_each_days: day_count(days)?,
        }),
        Term::Until(date) if date <= anchor => Err(Rejection::DateBeforeExpiry),
        Term::Until(date) => Ok(Period {
            starts_on: anchor,
            expires_on: date,
            recurring_each_days: day_count((date - (anchor - Duration::seconds(1))).num_days())?,
        }),
    }
}

fn extended_expiry(
    term: Term,
    current: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, Rejection> {
    match term {
        Term::Days(days) if days < 1 => Err(Rejection::InvalidDuration(days)),
        Term::Days(days) => days_after(current, days),
        Term::Until(date) if date <= now => Err(Rejection::DateNotInFuture),
        Term::Until(date) => Ok(date),
    }
}

fn observe<T>(operation: &str, result: &Result<T, SubscriptionError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(SubscriptionError::Rejected(rejection)) => rejection.label(),
        Err(SubscriptionError::UnsupportedPaymentMethod(_)) => "unsupported_payment_method",
        Err(SubscriptionError::Store(e)) => e.label(),
    };
    record_subscription_operation(operation, outcome);
}

/// Entry point for subscription lifecycle operations.
#[derive(Clone)]
pub struct LifecycleManager {
    store: Arc<dyn SubscriptionStore>,
    catalog: Arc<dyn PlanCatalog>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    settings: LifecycleSettings,
    locks: Arc<LockMap>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        catalog: Arc<dyn PlanCatalog>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            store,
            catalog,
            events,
            clock,
            settings,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn account(&self, subscriber: SubscriberRef) -> SubscriberAccount {
        SubscriberAccount {
            manager: self.clone(),
            subscriber,
            payments: None,
        }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn features_of(&self, plan_id: Uuid) -> FeatureCatalog {
        FeatureCatalog::new(self.catalog.clone(), plan_id)
    }

    /// Ledger for a specific record, active or not.
    pub fn ledger_for(&self, subscription: &SubscriptionRecord) -> UsageLedger {
        UsageLedger::new(
            subscription.subscription_id,
            self.features_of(subscription.plan_id),
            self.store.clone(),
            self.events.clone(),
            self.clock.clone(),
        )
    }

    async fn lock_subscriber(&self, subscriber: &SubscriberRef) -> SubscriberLock {
        let mutex = self
            .locks
            .entry(subscriber.clone())
            .or_default()
            .value()
            .clone();
        let guard = mutex.clone().lock_owned().await;
        SubscriberLock {
            locks: self.locks.clone(),
            subscriber: subscriber.clone(),
            mutex,
            guard: Some(guard),
        }
    }

    /// Subscribers with a lock currently held or awaited.
    #[cfg(test)]
    fn locked_subscribers(&self) -> usize {
        self.locks.len()
    }
}

/// One subscriber's view of the lifecycle manager, optionally carrying a
/// payment coordinator.
#[derive(Clone)]
pub struct SubscriberAccount {
    manager: LifecycleManager,
    subscriber: SubscriberRef,
    payments: Option<PaymentCoordinator>,
}

impl SubscriberAccount {
    pub fn with_payments(mut self, payments: PaymentCoordinator) -> Self {
        self.payments = Some(payments);
        self
    }

    pub fn subscriber(&self) -> &SubscriberRef {
        &self.subscriber
    }

    pub fn payments(&self) -> Option<&PaymentCoordinator> {
        self.payments.as_ref()
    }

    async fn history(&self) -> Result<SubscriptionHistory, AppError> {
        let now = self.manager.clock.now();
        let records = self.manager.store.subscriptions_of(&self.subscriber).await?;
        Ok(SubscriptionHistory::new(records, now))
    }

    fn charge_context(&self, now: DateTime<Utc>) -> ChargeContext<'_> {
        ChargeContext {
            store: self.manager.store.as_ref(),
            events: self.manager.events.as_ref(),
            subscriber: &self.subscriber,
            now,
        }
    }

    fn charging_snapshot(
        &self,
        payments: Option<&PaymentCoordinator>,
        price: Decimal,
        currency: &str,
    ) -> (Decimal, String) {
        match payments {
            Some(payments) => payments.charging_price_for(price, currency),
            None => (price, currency.to_string()),
        }
    }

    /// Write `changes` in one unit, provided nothing moved since `history`
    /// was read.
    async fn commit(
        &self,
        history: &SubscriptionHistory,
        changes: SubscriptionChanges,
    ) -> Result<(), AppError> {
        self.manager
            .store
            .apply_changes(&self.subscriber, history.records(), &changes)
            .await
    }

    fn require_payments(&self) -> Result<&PaymentCoordinator, SubscriptionError> {
        self.payments
            .as_ref()
            .ok_or_else(|| Rejection::PaymentUnavailable(self.subscriber.to_string()).into())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn subscriptions(&self) -> Result<Vec<SubscriptionRecord>, AppError> {
        Ok(self.history().await?.into_records())
    }

    pub async fn has_subscriptions(&self) -> Result<bool, AppError> {
        Ok(!self.history().await?.is_empty())
    }

    pub async fn active_subscription(&self) -> Result<Option<SubscriptionRecord>, AppError> {
        Ok(self.history().await?.active().cloned())
    }

    pub async fn has_active_subscription(&self) -> Result<bool, AppError> {
        Ok(self.history().await?.active().is_some())
    }

    pub async fn last_active_subscription(&self) -> Result<Option<SubscriptionRecord>, AppError> {
        Ok(self.history().await?.last_active().cloned())
    }

    pub async fn last_subscription(&self) -> Result<Option<SubscriptionRecord>, AppError> {
        Ok(self.history().await?.last_subscription().cloned())
    }

    pub async fn last_unpaid_subscription(&self) -> Result<Option<SubscriptionRecord>, AppError> {
        Ok(self.history().await?.last_unpaid().cloned())
    }

    pub async fn last_due_subscription(&self) -> Result<Option<SubscriptionRecord>, AppError> {
        Ok(self.history().await?.last_due().cloned())
    }

    pub async fn has_due_subscription(&self) -> Result<bool, AppError> {
        Ok(self.history().await?.has_due())
    }

    /// Usage ledger of the active subscription.
    pub async fn usage(&self) -> Result<UsageLedger, SubscriptionError> {
        let history = self.history().await?;
        let active = history.active().ok_or(Rejection::NoActiveSubscription)?;
        Ok(self.manager.ledger_for(active))
    }

    // =========================================================================
    // Customer records
    // =========================================================================

    pub async fn customer(&self) -> Result<Option<CustomerRecord>, AppError> {
        self.manager.store.customer(&self.subscriber).await
    }

    pub async fn is_customer(&self) -> Result<bool, AppError> {
        Ok(self.customer().await?.is_some())
    }

    pub async fn create_customer(&self) -> Result<CustomerRecord, SubscriptionError> {
        let payments = self.require_payments()?;
        Ok(payments
            .create_customer(self.manager.store.as_ref(), &self.subscriber)
            .await?)
    }

    pub async fn delete_customer(&self) -> Result<bool, SubscriptionError> {
        let payments = self.require_payments()?;
        Ok(payments
            .delete_customer(self.manager.store.as_ref(), &self.subscriber)
            .await?)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Subscribe to `plan`. Rejected while a paid subscription is active; a
    /// due subscription is replaced.
    #[instrument(skip(self, plan), fields(subscriber = %self.subscriber, plan_id = %plan.plan_id))]
    pub async fn subscribe_to(
        &self,
        plan: &Plan,
        term: Term,
        recurring: bool,
    ) -> Result<SubscriptionRecord, SubscriptionError> {
        let _lock = self.manager.lock_subscriber(&self.subscriber).await;

        let result = self.subscribe_locked(plan, term, recurring).await;
        observe("subscribe", &result);
        result
    }

    /// Subscribe for the plan's own duration, falling back to the configured
    /// default term.
    pub async fn subscribe_with_defaults(
        &self,
        plan: &Plan,
    ) -> Result<SubscriptionRecord, SubscriptionError> {
        let settings = self.manager.settings();
        let days = if plan.duration_days > 0 {
            i64::from(plan.duration_days)
        } else {
            settings.default_duration_days
        };
        self.subscribe_to(plan, Term::Days(days), settings.default_recurring)
            .await
    }

    async fn subscribe_locked(
        &self,
        plan: &Plan,
        term: Term,
        recurring: bool,
    ) -> Result<SubscriptionRecord, SubscriptionError> {
        let history = self.history().await?;
        let period = fresh_period(term, history.now())?;

        if history.active().is_some() {
            return Err(Rejection::ActiveSubscriptionExists.into());
        }

        self.create_subscription(plan, period, term, recurring, &history, self.payments.as_ref())
            .await
    }

    async fn create_subscription(
        &self,
        plan: &Plan,
        period: Period,
        term: Term,
        recurring: bool,
        history: &SubscriptionHistory,
        payments: Option<&PaymentCoordinator>,
    ) -> Result<SubscriptionRecord, SubscriptionError> {
        let now = history.now();

        let (charging_price, charging_currency) =
            self.charging_snapshot(payments, plan.price, &plan.currency);

        let mut record = NewSubscription {
            subscriber: self.subscriber.clone(),
            plan_id: plan.plan_id,
            starts_on: period.starts_on,
            expires_on: period.expires_on,
            payment_method: payments.map(|p| p.method()),
            is_paid: payments.is_none(),
            is_recurring: recurring,
            recurring_each_days: period.recurring_each_days,
            charging_price,
            charging_currency,
        }
        .into_record(now);

        let replaced = history.last_due().map(|due| due.subscription_id);
        let changes = match replaced {
            Some(due_id) => SubscriptionChanges::new().delete(due_id),
            None => SubscriptionChanges::new(),
        };
        self.commit(history, changes.insert(record.clone())).await?;
        if let Some(due_id) = replaced {
            info!(subscription_id = %due_id, "Replaced due subscription");
        }
        info!(
            subscription_id = %record.subscription_id,
            plan_id = %record.plan_id,
            expires_on = %record.expires_on,
            "Subscription created"
        );

        if let Some(payments) = payments {
            let ctx = self.charge_context(now);
            if let ChargeOutcome::Failed(reason) = payments.charge_new(&ctx, &mut record).await? {
                info!(
                    subscription_id = %record.subscription_id,
                    reason = %reason,
                    "Subscription left unpaid"
                );
            }
        }

        self.manager.events.emit(SubscriptionEvent::NewSubscription {
            subscription: record.clone(),
            until: term.until(),
        });

        Ok(record)
    }

    /// Extend the active subscription, either by moving its expiry
    /// (`start_from_now`) or by queueing a new record after it. Without an
    /// active subscription this subscribes again.
    #[instrument(skip(self), fields(subscriber = %self.subscriber))]
    pub async fn extend_current_subscription(
        &self,
        term: Term,
        start_from_now: bool,
        recurring: bool,
    ) -> Result<Extension, SubscriptionError> {
        let _lock = self.manager.lock_subscriber(&self.subscriber).await;

        let result = self.extend_locked(term, start_from_now, recurring).await;
        observe("extend", &result);
        result
    }

    async fn extend_locked(
        &self,
        term: Term,
        start_from_now: bool,
        recurring: bool,
    ) -> Result<Extension, SubscriptionError> {
        let history = self.history().await?;

        let Some(active) = history.active().cloned() else {
            let period = fresh_period(term, history.now())?;
            let (plan, kind) = self.fallback_plan(&history).await?;
            if kind == ExtensionKind::CatalogDefault {
                warn!(plan_id = %plan.plan_id, "No history; extending onto the first catalog plan");
            }
            let subscription = self
                .create_subscription(&plan, period, term, recurring, &history, self.payments.as_ref())
                .await?;
            return Ok(Extension { subscription, kind });
        };

        let planned = self.plan_extension(&history, active, term, start_from_now, recurring)?;
        self.commit(&history, planned.changes()).await?;
        Ok(self.finish_extension(planned, start_from_now, term))
    }

    async fn fallback_plan(
        &self,
        history: &SubscriptionHistory,
    ) -> Result<(Plan, ExtensionKind), SubscriptionError> {
        if let Some(previous) = history.last_active().or_else(|| history.last_subscription()) {
            let plan = self
                .manager
                .catalog
                .plan(previous.plan_id)
                .await?
                .ok_or(Rejection::PlanNotFound(previous.plan_id))?;
            return Ok((plan, ExtensionKind::Resubscribed));
        }

        let plan = self
            .manager
            .catalog
            .first_plan()
            .await?
            .ok_or(Rejection::EmptyCatalog)?;
        Ok((plan, ExtensionKind::CatalogDefault))
    }

    /// Work out an extension of `active` without writing anything.
    fn plan_extension(
        &self,
        history: &SubscriptionHistory,
        active: SubscriptionRecord,
        term: Term,
        start_from_now: bool,
        recurring: bool,
    ) -> Result<PlannedExtension, Rejection> {
        let now = history.now();

        if start_from_now {
            let expires_on = extended_expiry(term, active.expires_on, now)?;
            let shift = expires_on - active.expires_on;

            // Queued records move with the expiry so the chain stays contiguous.
            let shifted = history
                .successors_of(&active)
                .into_iter()
                .map(|successor| {
                    let mut successor = successor.clone();
                    successor.starts_on += shift;
                    successor.expires_on += shift;
                    successor.updated_utc = now;
                    successor
                })
                .collect();

            let mut record = active;
            record.expires_on = expires_on;
            record.updated_utc = now;
            return Ok(PlannedExtension {
                record,
                kind: ExtensionKind::InPlace,
                shifted,
            });
        }

        let period = chained_period(term, history.chain_end(&active))?;
        let payments = self.payments.as_ref();
        let (charging_price, charging_currency) =
            self.charging_snapshot(payments, active.charging_price, &active.charging_currency);

        let record = NewSubscription {
            subscriber: self.subscriber.clone(),
            plan_id: active.plan_id,
            starts_on: period.starts_on,
            expires_on: period.expires_on,
            payment_method: payments.map(|p| p.method()),
            is_paid: payments.is_none(),
            is_recurring: recurring,
            recurring_each_days: period.recurring_each_days,
            charging_price,
            charging_currency,
        }
        .into_record(now);

        Ok(PlannedExtension {
            record,
            kind: ExtensionKind::Chained,
            shifted: Vec::new(),
        })
    }

    /// Log and announce an extension that has been written.
    fn finish_extension(
        &self,
        planned: PlannedExtension,
        start_from_now: bool,
        term: Term,
    ) -> Extension {
        let record = planned.record;
        match planned.kind {
            ExtensionKind::Chained => info!(
                subscription_id = %record.subscription_id,
                starts_on = %record.starts_on,
                expires_on = %record.expires_on,
                "Subscription extension queued"
            ),
            _ => info!(
                subscription_id = %record.subscription_id,
                expires_on = %record.expires_on,
                shifted = planned.shifted.len(),
                "Subscription extended in place"
            ),
        }

        self.manager.events.emit(SubscriptionEvent::ExtendedSubscription {
            subscription: record.clone(),
            start_from_now,
            until: term.until(),
        });
        Extension {
            subscription: record,
            kind: planned.kind,
        }
    }

    /// Extend like `extend_current_subscription`, then move the resulting
    /// record onto `plan`. Usage stays with the record it was recorded on.
    #[instrument(skip(self, plan), fields(subscriber = %self.subscriber, plan_id = %plan.plan_id))]
    pub async fn upgrade_current_plan_to(
        &self,
        plan: &Plan,
        term: Term,
        start_from_now: bool,
        recurring: bool,
    ) -> Result<Extension, SubscriptionError> {
        let _lock = self.manager.lock_subscriber(&self.subscriber).await;

        let result = self
            .upgrade_locked(plan, term, start_from_now, recurring)
            .await;
        observe("upgrade", &result);
        result
    }

    async fn upgrade_locked(
        &self,
        plan: &Plan,
        term: Term,
        start_from_now: bool,
        recurring: bool,
    ) -> Result<Extension, SubscriptionError> {
        let history = self.history().await?;

        let Some(active) = history.active().cloned() else {
            let period = fresh_period(term, history.now())?;
            let subscription = self
                .create_subscription(plan, period, term, recurring, &history, self.payments.as_ref())
                .await?;
            return Ok(Extension {
                subscription,
                kind: ExtensionKind::Resubscribed,
            });
        };

        let from_plan_id = active.plan_id;
        let mut planned = self.plan_extension(&history, active, term, start_from_now, recurring)?;

        let record = &mut planned.record;
        record.plan_id = plan.plan_id;
        if planned.kind == ExtensionKind::Chained {
            let (price, currency) =
                self.charging_snapshot(self.payments.as_ref(), plan.price, &plan.currency);
            record.charging_price = price;
            record.charging_currency = currency;
        }

        self.commit(&history, planned.changes()).await?;
        if from_plan_id != plan.plan_id {
            info!(
                subscription_id = %planned.record.subscription_id,
                from_plan_id = %from_plan_id,
                to_plan_id = %plan.plan_id,
                "Subscription plan changed"
            );
        }
        let extension = self.finish_extension(planned, start_from_now, term);

        self.manager.events.emit(SubscriptionEvent::UpgradedSubscription {
            subscription: extension.subscription.clone(),
            from_plan_id,
            to_plan_id: plan.plan_id,
            start_from_now,
            until: term.until(),
        });

        Ok(extension)
    }

    /// Cancel the active subscription. Access continues until it expires.
    #[instrument(skip(self), fields(subscriber = %self.subscriber))]
    pub async fn cancel_current_subscription(
        &self,
    ) -> Result<SubscriptionRecord, SubscriptionError> {
        let _lock = self.manager.lock_subscriber(&self.subscriber).await;

        let result = self.cancel_locked().await;
        observe("cancel", &result);
        result
    }

    async fn cancel_locked(&self) -> Result<SubscriptionRecord, SubscriptionError> {
        let history = self.history().await?;
        let now = history.now();

        let mut record = history
            .active()
            .cloned()
            .ok_or(Rejection::NoActiveSubscription)?;
        if record.is_cancelled() {
            return Err(Rejection::AlreadyCancelled.into());
        }

        record.cancelled_on = Some(now);
        record.is_recurring = false;
        record.updated_utc = now;
        self.commit(&history, SubscriptionChanges::new().update(record.clone()))
            .await?;
        info!(
            subscription_id = %record.subscription_id,
            expires_on = %record.expires_on,
            "Subscription cancelled"
        );

        self.manager.events.emit(SubscriptionEvent::CancelledSubscription {
            subscription: record.clone(),
        });
        Ok(record)
    }

    /// Renew after the last subscription lapsed. A due subscription is
    /// charged; otherwise the last paid recurring subscription is repeated.
    #[instrument(skip(self, source_token), fields(subscriber = %self.subscriber))]
    pub async fn renew_subscription(
        &self,
        source_token: Option<String>,
    ) -> Result<SubscriptionRecord, SubscriptionError> {
        let _lock = self.manager.lock_subscriber(&self.subscriber).await;

        let result = self.renew_locked(source_token).await;
        observe("renew", &result);
        result
    }

    async fn renew_locked(
        &self,
        source_token: Option<String>,
    ) -> Result<SubscriptionRecord, SubscriptionError> {
        let history = self.history().await?;

        if history.is_empty() {
            return Err(Rejection::NoSubscriptionHistory.into());
        }
        if history.active().is_some() {
            return Err(Rejection::ActiveSubscriptionExists.into());
        }

        let with_token = |payments: &PaymentCoordinator| match &source_token {
            Some(token) => payments.clone().with_source_token(token.clone()),
            None => payments.clone(),
        };

        if history.has_due() {
            let payments = with_token(self.require_payments()?);
            return self.charge_due_locked(&history, &payments).await;
        }

        let last = history
            .last_active()
            .cloned()
            .ok_or(Rejection::NotRenewable)?;
        if !last.is_recurring || last.is_cancelled() {
            return Err(Rejection::NotRenewable.into());
        }

        let payments = match last.payment_method.as_deref() {
            None => None,
            Some(_) if !last.is_paid => return Err(Rejection::NotRenewable.into()),
            Some(method) => {
                let payments = self
                    .payments
                    .as_ref()
                    .filter(|p| p.method().as_str() == method)
                    .ok_or_else(|| Rejection::PaymentUnavailable(method.to_string()))?;
                Some(with_token(payments))
            }
        };

        let plan = self
            .manager
            .catalog
            .plan(last.plan_id)
            .await?
            .ok_or(Rejection::PlanNotFound(last.plan_id))?;

        let term = Term::Days(i64::from(last.recurring_each_days));
        let period = fresh_period(term, history.now())?;
        info!(
            previous_subscription_id = %last.subscription_id,
            plan_id = %plan.plan_id,
            days = last.recurring_each_days,
            "Renewing subscription"
        );

        self.create_subscription(&plan, period, term, true, &history, payments.as_ref())
            .await
    }

    /// Charge the due subscription through the payment coordinator. A failed
    /// charge is rejected with `PaymentFailed` and may be retried later.
    #[instrument(skip(self), fields(subscriber = %self.subscriber))]
    pub async fn charge_for_last_due_subscription(
        &self,
    ) -> Result<SubscriptionRecord, SubscriptionError> {
        let _lock = self.manager.lock_subscriber(&self.subscriber).await;

        let result = self.charge_due_entry().await;
        observe("charge_due", &result);
        result
    }

    async fn charge_due_entry(&self) -> Result<SubscriptionRecord, SubscriptionError> {
        let history = self.history().await?;
        if !history.has_due() {
            return Err(Rejection::NoDueSubscription.into());
        }
        let payments = self.require_payments()?;
        self.charge_due_locked(&history, payments).await
    }

    async fn charge_due_locked(
        &self,
        history: &SubscriptionHistory,
        payments: &PaymentCoordinator,
    ) -> Result<SubscriptionRecord, SubscriptionError> {
        let mut due = history
            .last_due()
            .cloned()
            .ok_or(Rejection::NoDueSubscription)?;

        let ctx = self.charge_context(history.now());
        match payments.charge_due(&ctx, &mut due).await? {
            ChargeOutcome::Paid(_) => Ok(due),
            ChargeOutcome::Failed(reason) => Err(Rejection::PaymentFailed(reason).into()),
        }
    }

    /// Mark the due subscription paid for a payment captured outside the
    /// gateway. Dates roll forward as for a successful due charge.
    #[instrument(skip(self, reference), fields(subscriber = %self.subscriber))]
    pub async fn settle_last_due_subscription(
        &self,
        reference: impl Into<String>,
    ) -> Result<SubscriptionRecord, SubscriptionError> {
        let reference = reference.into();
        let _lock = self.manager.lock_subscriber(&self.subscriber).await;

        let result = self.settle_locked(reference).await;
        observe("settle_due", &result);
        result
    }

    async fn settle_locked(
        &self,
        reference: String,
    ) -> Result<SubscriptionRecord, SubscriptionError> {
        let history = self.history().await?;
        let mut due = history
            .last_due()
            .cloned()
            .ok_or(Rejection::NoDueSubscription)?;

        settle_due_record(&mut due, history.now());
        self.commit(&history, SubscriptionChanges::new().update(due.clone()))
            .await?;
        record_charge(ChargeKind::Due.as_str(), "settled");
        info!(
            subscription_id = %due.subscription_id,
            reference = %reference,
            "Due subscription settled out of band"
        );

        self.manager.events.emit(SubscriptionEvent::ChargeSucceeded {
            kind: ChargeKind::Due,
            subscription: due.clone(),
            amount: due.charging_price,
            currency: due.charging_currency.clone(),
            charge_id: reference,
        });
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 8, 30, 0).unwrap()
    }

    #[test]
    fn test_fresh_period_starts_one_second_early() {
        let period = fresh_period(Term::Days(15), now()).unwrap();
        assert_eq!(period.starts_on, now() - Duration::seconds(1));
        assert_eq!(period.expires_on, now() + Duration::days(15));
        assert_eq!(period.recurring_each_days, 15);
    }

    #[test]
    fn test_fresh_period_rejects_bad_terms() {
        assert!(matches!(
            fresh_period(Term::Days(0), now()),
            Err(Rejection::InvalidDuration(0))
        ));
        assert!(matches!(
            fresh_period(Term::Days(-1), now()),
            Err(Rejection::InvalidDuration(-1))
        ));
        assert!(matches!(
            fresh_period(Term::Until(now() - Duration::days(1)), now()),
            Err(Rejection::DateNotInFuture)
        ));
        assert!(matches!(
            fresh_period(Term::Days(i64::MAX), now()),
            Err(Rejection::InvalidDuration(_))
        ));
    }

    #[test]
    fn test_until_period_counts_days_from_start() {
        let period = fresh_period(Term::Until(now() + Duration::days(30)), now()).unwrap();
        assert_eq!(period.expires_on, now() + Duration::days(30));
        assert_eq!(period.recurring_each_days, 30);
    }

    #[test]
    fn test_chained_period_starts_at_anchor() {
        let anchor = now() + Duration::days(14);
        let period = chained_period(Term::Days(30), anchor).unwrap();
        assert_eq!(period.starts_on, anchor);
        assert_eq!(period.expires_on, anchor + Duration::days(30));

        let until = chained_period(Term::Until(anchor + Duration::days(10)), anchor).unwrap();
        assert_eq!(until.recurring_each_days, 10);

        assert!(matches!(
            chained_period(Term::Until(anchor), anchor),
            Err(Rejection::DateBeforeExpiry)
        ));
    }

    #[test]
    fn test_extended_expiry_for_until_replaces_date() {
        let current = now() + Duration::days(5);
        let target = now() + Duration::days(2);
        assert_eq!(extended_expiry(Term::Until(target), current, now()).unwrap(), target);
        assert!(matches!(
            extended_expiry(Term::Until(now()), current, now()),
            Err(Rejection::DateNotInFuture)
        ));
        assert_eq!(
            extended_expiry(Term::Days(30), current, now()).unwrap(),
            current + Duration::days(30)
        );
    }

    fn manager() -> LifecycleManager {
        use crate::clock::ManualClock;
        use crate::services::events::TracingEventSink;
        use crate::services::memory::{InMemoryCatalog, InMemoryStore};

        LifecycleManager::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryCatalog::new()),
            Arc::new(TracingEventSink),
            Arc::new(ManualClock::new(now())),
            LifecycleSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_subscriber_locks_are_released_after_use() {
        let manager = manager();

        for id in 0..100 {
            let account = manager.account(SubscriberRef::new("user", id.to_string()));
            let err = account.cancel_current_subscription().await.unwrap_err();
            assert!(matches!(
                err,
                SubscriptionError::Rejected(Rejection::NoActiveSubscription)
            ));
        }

        assert_eq!(manager.locked_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_lock_survives_while_awaited() {
        let manager = manager();
        let subscriber = SubscriberRef::new("user", "1");

        let held = manager.lock_subscriber(&subscriber).await;
        let waiter = {
            let manager = manager.clone();
            let subscriber = subscriber.clone();
            tokio::spawn(async move {
                let _lock = manager.lock_subscriber(&subscriber).await;
            })
        };
        // Wait until the second caller holds a reference to the same mutex.
        while Arc::strong_count(&held.mutex) < 4 {
            tokio::task::yield_now().await;
        }

        drop(held);
        assert_eq!(manager.locked_subscribers(), 1);

        waiter.await.unwrap();
        assert_eq!(manager.locked_subscribers(), 0);
    }
}
