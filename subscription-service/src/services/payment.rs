//! Payment coordination around an external gateway.
//!
//! The coordinator is composed alongside a subscriber account. Gateway errors
//! never escape it: a failed charge leaves the record unpaid, emits a failure
//! event and reports `ChargeOutcome::Failed`.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::PaymentSettings;
use crate::error::SubscriptionError;
use crate::models::{CustomerRecord, PaymentMethod, SubscriberRef, SubscriptionRecord};
use crate::services::events::{EventSink, SubscriptionEvent};
use crate::services::metrics::{record_charge, record_charge_amount};
use crate::services::store::SubscriptionStore;

/// Currencies the gateway expects in whole units rather than cents.
const ZERO_DECIMAL_CURRENCIES: [&str; 16] = [
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV",
    "XAF", "XOF", "XPF",
];

pub fn is_zero_decimal(currency: &str) -> bool {
    ZERO_DECIMAL_CURRENCIES
        .iter()
        .any(|c| c.eq_ignore_ascii_case(currency))
}

/// Convert an amount to the gateway's smallest currency unit.
/// `None` when the result does not fit an `i64`.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Option<i64> {
    let scaled = if is_zero_decimal(currency) {
        amount
    } else {
        amount.checked_mul(Decimal::ONE_HUNDRED)?
    };
    scaled.round().to_i64()
}

pub fn from_minor_units(units: i64, currency: &str) -> Decimal {
    if is_zero_decimal(currency) {
        Decimal::from(units)
    } else {
        Decimal::new(units, 2)
    }
}

/// Which flow a charge belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeKind {
    /// Charged while creating a subscription.
    Immediate,
    /// Charged against the subscriber's due subscription.
    Due,
}

impl ChargeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeKind::Immediate => "immediate",
            ChargeKind::Due => "due",
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("charge declined: {0}")]
    Declined(String),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),

    #[error("amount {amount} {currency} cannot be expressed in minor units")]
    InvalidAmount { amount: Decimal, currency: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargeRequest {
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub currency: String,
    /// `amount` in the currency's smallest unit.
    pub minor_units: i64,
    pub description: String,
    pub customer_id: Option<String>,
    pub source_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChargeReceipt {
    pub charge_id: String,
}

/// Payment gateway client.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError>;

    /// Create a customer at the gateway and return its id.
    async fn create_customer(&self, subscriber: &SubscriberRef) -> Result<String, GatewayError>;

    async fn delete_customer(&self, customer_id: &str) -> Result<bool, GatewayError>;
}

/// Result of a charge attempt against a subscription record.
#[derive(Debug, Clone, PartialEq)]
pub enum ChargeOutcome {
    Paid(ChargeReceipt),
    Failed(String),
}

/// Collaborators a charge needs besides the gateway.
pub(crate) struct ChargeContext<'a> {
    pub store: &'a dyn SubscriptionStore,
    pub events: &'a dyn EventSink,
    pub subscriber: &'a SubscriberRef,
    pub now: DateTime<Utc>,
}

/// Mark a due record paid and restart its period at `now`.
pub(crate) fn settle_due_record(record: &mut SubscriptionRecord, now: DateTime<Utc>) {
    record.is_paid = true;
    record.starts_on = now;
    record.expires_on = now + ChronoDuration::days(i64::from(record.recurring_each_days));
    record.updated_utc = now;
}

/// Gateway capability attached to one subscriber account.
#[derive(Clone)]
pub struct PaymentCoordinator {
    gateway: Arc<dyn PaymentGateway>,
    method: PaymentMethod,
    source_token: Option<String>,
    charging_override: Option<(Decimal, String)>,
    timeout: Duration,
}

impl PaymentCoordinator {
    /// Fails with `UnsupportedPaymentMethod` when `method` is not allow-listed.
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        method: PaymentMethod,
        settings: &PaymentSettings,
    ) -> Result<Self, SubscriptionError> {
        method.ensure_supported(&settings.supported_methods)?;
        Ok(Self {
            gateway,
            method,
            source_token: None,
            charging_override: None,
            timeout: settings.gateway_timeout(),
        })
    }

    pub fn with_source_token(mut self, token: impl Into<String>) -> Self {
        self.source_token = Some(token.into());
        self
    }

    /// Charge this price instead of the plan's.
    pub fn with_charging_price(mut self, price: Decimal, currency: impl Into<String>) -> Self {
        self.charging_override = Some((price, currency.into()));
        self
    }

    pub fn method(&self) -> PaymentMethod {
        self.method
    }

    pub fn source_token(&self) -> Option<&str> {
        self.source_token.as_deref()
    }

    pub fn charging_override(&self) -> Option<(Decimal, &str)> {
        self.charging_override
            .as_ref()
            .map(|(price, currency)| (*price, currency.as_str()))
    }

    /// The price to snapshot onto a new record.
    pub(crate) fn charging_price_for(&self, price: Decimal, currency: &str) -> (Decimal, String) {
        match &self.charging_override {
            Some((price, currency)) => (*price, currency.clone()),
            None => (price, currency.to_string()),
        }
    }

    async fn with_timeout<T>(
        &self,
        call: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or(Err(GatewayError::Timeout(self.timeout)))
    }

    pub async fn customer(
        &self,
        store: &dyn SubscriptionStore,
        subscriber: &SubscriberRef,
    ) -> Result<Option<CustomerRecord>, AppError> {
        store.customer(subscriber).await
    }

    pub async fn is_customer(
        &self,
        store: &dyn SubscriptionStore,
        subscriber: &SubscriberRef,
    ) -> Result<bool, AppError> {
        Ok(store.customer(subscriber).await?.is_some())
    }

    /// Return the subscriber's customer record, creating one at the gateway
    /// if none exists.
    #[instrument(skip(self, store), fields(subscriber = %subscriber, method = %self.method))]
    pub async fn create_customer(
        &self,
        store: &dyn SubscriptionStore,
        subscriber: &SubscriberRef,
    ) -> Result<CustomerRecord, AppError> {
        if let Some(existing) = store.customer(subscriber).await? {
            return Ok(existing);
        }

        let customer_id = self
            .with_timeout(self.gateway.create_customer(subscriber))
            .await
            .map_err(|e| AppError::BadGateway(format!("Failed to create customer: {}", e)))?;

        let record = CustomerRecord::new(subscriber, customer_id);
        store.insert_customer(&record).await?;
        info!(customer_id = %record.customer_id, "Customer record created");

        Ok(record)
    }

    /// Delete the gateway customer and its local record. Returns false when
    /// the subscriber has no customer record.
    #[instrument(skip(self, store), fields(subscriber = %subscriber, method = %self.method))]
    pub async fn delete_customer(
        &self,
        store: &dyn SubscriptionStore,
        subscriber: &SubscriberRef,
    ) -> Result<bool, AppError> {
        let Some(existing) = store.customer(subscriber).await? else {
            return Ok(false);
        };

        let deleted = self
            .with_timeout(self.gateway.delete_customer(&existing.customer_id))
            .await
            .map_err(|e| AppError::BadGateway(format!("Failed to delete customer: {}", e)))?;

        if !deleted {
            warn!(customer_id = %existing.customer_id, "Gateway did not delete customer");
            return Ok(false);
        }

        store.delete_customer(subscriber).await
    }

    /// Charge a freshly created record at its snapshotted price.
    pub(crate) async fn charge_new(
        &self,
        ctx: &ChargeContext<'_>,
        record: &mut SubscriptionRecord,
    ) -> Result<ChargeOutcome, AppError> {
        let amount = record.charging_price;
        let currency = record.charging_currency.clone();
        self.charge_record(ctx, record, ChargeKind::Immediate, amount, currency)
            .await
    }

    /// Charge the due record. On success its period restarts at `now`.
    pub(crate) async fn charge_due(
        &self,
        ctx: &ChargeContext<'_>,
        record: &mut SubscriptionRecord,
    ) -> Result<ChargeOutcome, AppError> {
        let (amount, currency) =
            self.charging_price_for(record.charging_price, &record.charging_currency);
        self.charge_record(ctx, record, ChargeKind::Due, amount, currency)
            .await
    }

    #[instrument(
        skip(self, ctx, record),
        fields(subscription_id = %record.subscription_id, kind = kind.as_str(), method = %self.method)
    )]
    async fn charge_record(
        &self,
        ctx: &ChargeContext<'_>,
        record: &mut SubscriptionRecord,
        kind: ChargeKind,
        amount: Decimal,
        currency: String,
    ) -> Result<ChargeOutcome, AppError> {
        let result = self.charge(ctx, record, kind, amount, &currency).await;

        match result {
            Ok(receipt) => {
                match kind {
                    ChargeKind::Immediate => {
                        record.is_paid = true;
                        record.updated_utc = ctx.now;
                    }
                    ChargeKind::Due => settle_due_record(record, ctx.now),
                }
                ctx.store.update_subscription(record).await?;

                record_charge(kind.as_str(), "succeeded");
                record_charge_amount(&currency, kind.as_str(), amount.to_f64().unwrap_or(0.0));
                info!(charge_id = %receipt.charge_id, amount = %amount, currency = %currency, "Charge succeeded");

                ctx.events.emit(SubscriptionEvent::ChargeSucceeded {
                    kind,
                    subscription: record.clone(),
                    amount,
                    currency,
                    charge_id: receipt.charge_id.clone(),
                });
                Ok(ChargeOutcome::Paid(receipt))
            }
            Err(e) => {
                let reason = e.to_string();
                record_charge(kind.as_str(), "failed");
                warn!(error = %reason, amount = %amount, currency = %currency, "Charge failed");

                ctx.events.emit(SubscriptionEvent::ChargeFailed {
                    kind,
                    subscription: record.clone(),
                    amount,
                    currency,
                    reason: reason.clone(),
                });
                Ok(ChargeOutcome::Failed(reason))
            }
        }
    }

    async fn charge(
        &self,
        ctx: &ChargeContext<'_>,
        record: &SubscriptionRecord,
        kind: ChargeKind,
        amount: Decimal,
        currency: &str,
    ) -> Result<ChargeReceipt, GatewayError> {
        let minor_units =
            to_minor_units(amount, currency).ok_or_else(|| GatewayError::InvalidAmount {
                amount,
                currency: currency.to_string(),
            })?;

        let customer_id = match self.create_customer(ctx.store, ctx.subscriber).await {
            Ok(customer) => Some(customer.customer_id),
            Err(e) => {
                warn!(error = %e, "Charging without a customer record");
                None
            }
        };

        let request = ChargeRequest {
            method: self.method,
            amount,
            currency: currency.to_string(),
            minor_units,
            description: format!(
                "{} charge for subscription {}",
                kind.as_str(),
                record.subscription_id
            ),
            customer_id,
            source_token: self.source_token.clone(),
        };

        self.with_timeout(self.gateway.charge(&request)).await
    }
}

impl std::fmt::Debug for PaymentCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentCoordinator")
            .field("method", &self.method)
            .field("has_source_token", &self.source_token.is_some())
            .field("charging_override", &self.charging_override)
            .field("timeout", &self.timeout)
            .finish()
    }
}
