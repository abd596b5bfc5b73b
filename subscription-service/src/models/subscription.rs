//! Subscription model.
//!
//! Status is never stored. Every predicate is a function of the record's
//! timestamps and the instant it is evaluated at.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use super::PaymentMethod;

/// Polymorphic reference to the billable entity owning subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberRef {
    pub subscriber_type: String,
    pub subscriber_id: String,
}

impl SubscriberRef {
    pub fn new(subscriber_type: impl Into<String>, subscriber_id: impl Into<String>) -> Self {
        Self {
            subscriber_type: subscriber_type.into(),
            subscriber_id: subscriber_id.into(),
        }
    }
}

impl fmt::Display for SubscriberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subscriber_type, self.subscriber_id)
    }
}

/// One subscription period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SubscriptionRecord {
    pub subscription_id: Uuid,
    pub subscriber_type: String,
    pub subscriber_id: String,
    pub plan_id: Uuid,
    pub starts_on: DateTime<Utc>,
    pub expires_on: DateTime<Utc>,
    pub cancelled_on: Option<DateTime<Utc>>,
    pub payment_method: Option<String>,
    pub is_paid: bool,
    pub is_recurring: bool,
    pub recurring_each_days: i32,
    pub charging_price: Decimal,
    pub charging_currency: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl SubscriptionRecord {
    pub fn subscriber(&self) -> SubscriberRef {
        SubscriberRef::new(&self.subscriber_type, &self.subscriber_id)
    }

    pub fn belongs_to(&self, subscriber: &SubscriberRef) -> bool {
        self.subscriber_type == subscriber.subscriber_type
            && self.subscriber_id == subscriber.subscriber_id
    }

    pub fn payment_method(&self) -> Option<PaymentMethod> {
        self.payment_method.as_deref().and_then(|m| m.parse().ok())
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        now >= self.starts_on
    }

    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_on
    }

    /// Started and not expired, whatever the payment or cancellation state.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.has_started(now) && !self.has_expired(now)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled_on.is_some()
    }

    pub fn is_pending_cancellation(&self, now: DateTime<Utc>) -> bool {
        self.is_cancelled() && self.is_active(now)
    }

    /// Whole days left; partial days are dropped.
    pub fn remaining_days(&self, now: DateTime<Utc>) -> i64 {
        if self.has_expired(now) {
            return 0;
        }

        (self.expires_on - now).num_days()
    }
}

/// Input for creating a subscription record.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub subscriber: SubscriberRef,
    pub plan_id: Uuid,
    pub starts_on: DateTime<Utc>,
    pub expires_on: DateTime<Utc>,
    pub payment_method: Option<PaymentMethod>,
    pub is_paid: bool,
    pub is_recurring: bool,
    pub recurring_each_days: i32,
    pub charging_price: Decimal,
    pub charging_currency: String,
}

impl NewSubscription {
    /// Materialise the record, stamping ids and audit timestamps.
    pub fn into_record(self, created_utc: DateTime<Utc>) -> SubscriptionRecord {
        SubscriptionRecord {
            subscription_id: Uuid::new_v4(),
            subscriber_type: self.subscriber.subscriber_type,
            subscriber_id: self.subscriber.subscriber_id,
            plan_id: self.plan_id,
            starts_on: self.starts_on,
            expires_on: self.expires_on,
            cancelled_on: None,
            payment_method: self.payment_method.map(|m| m.as_str().to_string()),
            is_paid: self.is_paid,
            is_recurring: self.is_recurring,
            recurring_each_days: self.recurring_each_days,
            charging_price: self.charging_price,
            charging_currency: self.charging_currency,
            created_utc,
            updated_utc: created_utc,
        }
    }
}
