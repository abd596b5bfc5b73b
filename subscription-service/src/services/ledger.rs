//! Per-feature usage counters for one subscription.
//!
//! The limit check and the increment happen in a single store operation
//! (`SubscriptionStore::consume_usage`). Reading `used`, comparing and then
//! writing back from here would let concurrent consumers overshoot the limit.

use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::MeteringError;
use crate::models::{ConsumeOutcome, FeatureLimit, Remaining, UsageChange, UsageRecord};
use crate::services::catalog::{FeatureCatalog, FeatureLookup};
use crate::services::events::{EventSink, SubscriptionEvent};
use crate::services::metrics::record_usage_operation;
use crate::services::store::SubscriptionStore;

/// Decimal places a usage counter keeps; matches the `used` column.
pub const USAGE_SCALE: u32 = 4;

fn ensure_amount(amount: Decimal) -> Result<(), MeteringError> {
    if amount <= Decimal::ZERO || amount.normalize().scale() > USAGE_SCALE {
        return Err(MeteringError::InvalidAmount(amount));
    }
    Ok(())
}

fn remaining(limit: FeatureLimit, used: Decimal) -> Remaining {
    match limit {
        FeatureLimit::Unbounded => Remaining::Unbounded,
        FeatureLimit::Capped(limit) => Remaining::Amount(Decimal::from(limit) - used),
    }
}

fn ceiling(limit: FeatureLimit) -> Option<Decimal> {
    match limit {
        FeatureLimit::Unbounded => None,
        FeatureLimit::Capped(limit) => Some(Decimal::from(limit)),
    }
}

/// Usage ledger scoped to one subscription record.
#[derive(Clone)]
pub struct UsageLedger {
    subscription_id: Uuid,
    features: FeatureCatalog,
    store: Arc<dyn SubscriptionStore>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl UsageLedger {
    pub fn new(
        subscription_id: Uuid,
        features: FeatureCatalog,
        store: Arc<dyn SubscriptionStore>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            subscription_id,
            features,
            store,
            events,
            clock,
        }
    }

    pub fn subscription_id(&self) -> Uuid {
        self.subscription_id
    }

    pub fn features(&self) -> &FeatureCatalog {
        &self.features
    }

    async fn bounded(&self, code: &str) -> Result<FeatureLimit, MeteringError> {
        match self.features.lookup(code).await? {
            FeatureLookup::Bounded(_, limit) => Ok(limit),
            FeatureLookup::Boolean(_) => Err(MeteringError::NotBounded(code.to_string())),
            FeatureLookup::Missing => Err(MeteringError::FeatureNotFound(code.to_string())),
        }
    }

    /// Consume `amount` of a bounded feature. Refused without mutation when
    /// the limit would be crossed.
    #[instrument(skip(self), fields(subscription_id = %self.subscription_id))]
    pub async fn consume(&self, code: &str, amount: Decimal) -> Result<UsageChange, MeteringError> {
        let result = self.try_consume(code, amount).await;
        match &result {
            Ok(_) => record_usage_operation("consume", "ok"),
            Err(e) => record_usage_operation("consume", e.label()),
        }
        result
    }

    async fn try_consume(&self, code: &str, amount: Decimal) -> Result<UsageChange, MeteringError> {
        ensure_amount(amount)?;
        let limit = self.bounded(code).await?;

        let outcome = self
            .store
            .consume_usage(
                self.subscription_id,
                code,
                amount,
                ceiling(limit),
                self.clock.now(),
            )
            .await?;

        let record = match outcome {
            ConsumeOutcome::Applied(record) => record,
            ConsumeOutcome::WouldExceed(record) => {
                let left = remaining(limit, record.used).as_decimal();
                warn!(feature_code = %code, requested = %amount, remaining = %left, "Usage limit reached");
                return Err(MeteringError::LimitExceeded {
                    code: code.to_string(),
                    requested: amount,
                    remaining: left,
                });
            }
        };

        let left = remaining(limit, record.used);
        info!(feature_code = %code, amount = %amount, used = %record.used, "Feature consumed");

        self.events.emit(SubscriptionEvent::FeatureConsumed {
            subscription_id: self.subscription_id,
            code: code.to_string(),
            amount,
            remaining: left.as_decimal(),
        });

        Ok(UsageChange {
            subscription_id: self.subscription_id,
            code: code.to_string(),
            amount,
            used: record.used,
            remaining: left,
            clamped: false,
        })
    }

    /// Give back `amount` of a bounded feature. `used` is floored at zero;
    /// `UsageChange::clamped` reports when that happened.
    #[instrument(skip(self), fields(subscription_id = %self.subscription_id))]
    pub async fn unconsume(
        &self,
        code: &str,
        amount: Decimal,
    ) -> Result<UsageChange, MeteringError> {
        let result = self.try_unconsume(code, amount).await;
        match &result {
            Ok(change) if change.clamped => record_usage_operation("unconsume", "clamped"),
            Ok(_) => record_usage_operation("unconsume", "ok"),
            Err(e) => record_usage_operation("unconsume", e.label()),
        }
        result
    }

    async fn try_unconsume(
        &self,
        code: &str,
        amount: Decimal,
    ) -> Result<UsageChange, MeteringError> {
        ensure_amount(amount)?;
        let limit = self.bounded(code).await?;

        let outcome = self
            .store
            .release_usage(self.subscription_id, code, amount, self.clock.now())
            .await?;

        let clamped = outcome.clamped(amount);
        if clamped {
            warn!(
                feature_code = %code,
                requested = %amount,
                previous_used = %outcome.previous_used,
                "Unconsume exceeded recorded usage; clamped at zero"
            );
        }

        let left = remaining(limit, outcome.record.used);
        info!(feature_code = %code, amount = %amount, used = %outcome.record.used, "Feature unconsumed");

        self.events.emit(SubscriptionEvent::FeatureUnconsumed {
            subscription_id: self.subscription_id,
            code: code.to_string(),
            amount,
            remaining: left.as_decimal(),
            clamped,
        });

        Ok(UsageChange {
            subscription_id: self.subscription_id,
            code: code.to_string(),
            amount,
            used: outcome.record.used,
            remaining: left,
            clamped,
        })
    }

    /// Amount consumed so far. `None` for missing or boolean features.
    pub async fn usage_of(&self, code: &str) -> Result<Option<Decimal>, AppError> {
        match self.features.lookup(code).await? {
            FeatureLookup::Bounded(..) => {}
            _ => return Ok(None),
        }

        let used = self
            .store
            .usage(self.subscription_id, code)
            .await?
            .map(|usage| usage.used)
            .unwrap_or(Decimal::ZERO);
        Ok(Some(used))
    }

    /// Headroom left, or `None` for missing or boolean features.
    pub async fn remaining(&self, code: &str) -> Result<Option<Remaining>, AppError> {
        let FeatureLookup::Bounded(_, limit) = self.features.lookup(code).await? else {
            debug!(feature_code = %code, "No bounded feature for remaining lookup");
            return Ok(None);
        };

        let used = self
            .store
            .usage(self.subscription_id, code)
            .await?
            .map(|usage| usage.used)
            .unwrap_or(Decimal::ZERO);
        Ok(Some(remaining(limit, used)))
    }

    /// Numeric headroom: the full limit before any usage, -1 when unbounded,
    /// 0 for missing or boolean features.
    pub async fn remaining_of(&self, code: &str) -> Result<Decimal, AppError> {
        Ok(self
            .remaining(code)
            .await?
            .map(|left| left.as_decimal())
            .unwrap_or(Decimal::ZERO))
    }

    pub async fn usages(&self) -> Result<Vec<UsageRecord>, AppError> {
        self.store.usages(self.subscription_id).await
    }
}
