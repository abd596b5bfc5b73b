//! Domain notifications.
//!
//! Sinks are fire-and-forget. A failed delivery is logged and never rolls
//! back the operation that produced the event.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::SubscriptionRecord;
use crate::services::payment::ChargeKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SubscriptionEvent {
    NewSubscription {
        subscription: SubscriptionRecord,
        until: Option<DateTime<Utc>>,
    },
    ExtendedSubscription {
        subscription: SubscriptionRecord,
        start_from_now: bool,
        until: Option<DateTime<Utc>>,
    },
    UpgradedSubscription {
        subscription: SubscriptionRecord,
        from_plan_id: Uuid,
        to_plan_id: Uuid,
        start_from_now: bool,
        until: Option<DateTime<Utc>>,
    },
    CancelledSubscription {
        subscription: SubscriptionRecord,
    },
    FeatureConsumed {
        subscription_id: Uuid,
        code: String,
        amount: Decimal,
        /// -1 when the feature has no ceiling.
        remaining: Decimal,
    },
    FeatureUnconsumed {
        subscription_id: Uuid,
        code: String,
        amount: Decimal,
        remaining: Decimal,
        clamped: bool,
    },
    ChargeSucceeded {
        kind: ChargeKind,
        subscription: SubscriptionRecord,
        amount: Decimal,
        currency: String,
        charge_id: String,
    },
    ChargeFailed {
        kind: ChargeKind,
        subscription: SubscriptionRecord,
        amount: Decimal,
        currency: String,
        reason: String,
    },
}

impl SubscriptionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SubscriptionEvent::NewSubscription { .. } => "subscription.created",
            SubscriptionEvent::ExtendedSubscription { until: None, .. } => "subscription.extended",
            SubscriptionEvent::ExtendedSubscription { .. } => "subscription.extended_until",
            SubscriptionEvent::UpgradedSubscription { until: None, .. } => "subscription.upgraded",
            SubscriptionEvent::UpgradedSubscription { .. } => "subscription.upgraded_until",
            SubscriptionEvent::CancelledSubscription { .. } => "subscription.cancelled",
            SubscriptionEvent::FeatureConsumed { .. } => "feature.consumed",
            SubscriptionEvent::FeatureUnconsumed { .. } => "feature.unconsumed",
            SubscriptionEvent::ChargeSucceeded { kind: ChargeKind::Immediate, .. } => {
                "charge.succeeded"
            }
            SubscriptionEvent::ChargeSucceeded { .. } => "charge.due_succeeded",
            SubscriptionEvent::ChargeFailed { kind: ChargeKind::Immediate, .. } => "charge.failed",
            SubscriptionEvent::ChargeFailed { .. } => "charge.due_failed",
        }
    }

    pub fn subscription_id(&self) -> Uuid {
        match self {
            SubscriptionEvent::NewSubscription { subscription, .. }
            | SubscriptionEvent::ExtendedSubscription { subscription, .. }
            | SubscriptionEvent::UpgradedSubscription { subscription, .. }
            | SubscriptionEvent::CancelledSubscription { subscription }
            | SubscriptionEvent::ChargeSucceeded { subscription, .. }
            | SubscriptionEvent::ChargeFailed { subscription, .. } => subscription.subscription_id,
            SubscriptionEvent::FeatureConsumed { subscription_id, .. }
            | SubscriptionEvent::FeatureUnconsumed { subscription_id, .. } => *subscription_id,
        }
    }
}

/// Receiver of domain notifications.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SubscriptionEvent);
}

/// Writes every event to the log as structured JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: SubscriptionEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => info!(
                event = event.name(),
                subscription_id = %event.subscription_id(),
                payload = %payload,
                "Subscription event"
            ),
            Err(e) => warn!(event = event.name(), error = %e, "Failed to serialize event"),
        }
    }
}

/// Forwards events to a bounded channel. Events are dropped when the
/// receiver lags or has gone away.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::Sender<SubscriptionEvent>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SubscriptionEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: SubscriptionEvent) {
        let name = event.name();
        if let Err(e) = self.sender.try_send(event) {
            warn!(event = name, error = %e, "Dropping subscription event");
        }
    }
}
