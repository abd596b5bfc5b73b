//! Usage model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Consumption counter for one feature code within one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UsageRecord {
    pub usage_id: Uuid,
    pub subscription_id: Uuid,
    pub code: String,
    pub used: Decimal,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(subscription_id: Uuid, code: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            usage_id: Uuid::new_v4(),
            subscription_id,
            code: code.into(),
            used: Decimal::ZERO,
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// Headroom left on a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Remaining {
    Unbounded,
    Amount(Decimal),
}

impl Remaining {
    /// Numeric form, with -1 standing for "no ceiling".
    pub fn as_decimal(&self) -> Decimal {
        match self {
            Remaining::Unbounded => Decimal::NEGATIVE_ONE,
            Remaining::Amount(amount) => *amount,
        }
    }
}

/// Result of a successful consume/unconsume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageChange {
    pub subscription_id: Uuid,
    pub code: String,
    pub amount: Decimal,
    pub used: Decimal,
    pub remaining: Remaining,
    /// Set when an unconsume asked for more than was recorded and `used`
    /// was floored at zero.
    pub clamped: bool,
}

/// Store-level outcome of an atomic consume attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    Applied(UsageRecord),
    /// The ceiling would be crossed; the record is returned untouched.
    WouldExceed(UsageRecord),
}

/// Store-level outcome of an atomic release.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseOutcome {
    pub record: UsageRecord,
    pub previous_used: Decimal,
}

impl ReleaseOutcome {
    pub fn clamped(&self, amount: Decimal) -> bool {
        amount > self.previous_used
    }
}
