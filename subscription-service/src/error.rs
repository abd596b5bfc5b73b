//! Error types for lifecycle and metering operations.
//!
//! Business refusals are values (`Rejected`, `LimitExceeded`, ...) that leave
//! persisted state untouched. Infrastructure failures arrive as `AppError`.

use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

/// Broad category of a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// Caller input is invalid. Retrying with the same input will fail again.
    Validation,
    /// The subscriber's current state forbids the operation.
    Conflict,
    /// Nothing to act on.
    NotFound,
    /// The payment gateway refused or failed the charge.
    Gateway,
}

/// Reason a lifecycle operation was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("duration must be at least one day, got {0}")]
    InvalidDuration(i64),

    #[error("target date must be in the future")]
    DateNotInFuture,

    #[error("target date is earlier than the current expiry")]
    DateBeforeExpiry,

    #[error("subscriber already has an active subscription")]
    ActiveSubscriptionExists,

    #[error("subscriber has no active subscription")]
    NoActiveSubscription,

    #[error("subscription is already cancelled")]
    AlreadyCancelled,

    #[error("subscriber has no subscription history")]
    NoSubscriptionHistory,

    #[error("subscriber has no due subscription")]
    NoDueSubscription,

    #[error("last subscription is not eligible for renewal")]
    NotRenewable,

    #[error("plan {0} not found")]
    PlanNotFound(Uuid),

    #[error("plan catalog is empty")]
    EmptyCatalog,

    #[error("no payment coordinator configured for {0}")]
    PaymentUnavailable(String),

    #[error("charge failed: {0}")]
    PaymentFailed(String),
}

impl Rejection {
    pub fn kind(&self) -> RejectionKind {
        match self {
            Rejection::InvalidDuration(_)
            | Rejection::DateNotInFuture
            | Rejection::DateBeforeExpiry
            | Rejection::PaymentUnavailable(_) => RejectionKind::Validation,
            Rejection::ActiveSubscriptionExists
            | Rejection::AlreadyCancelled
            | Rejection::NotRenewable => RejectionKind::Conflict,
            Rejection::NoActiveSubscription
            | Rejection::NoSubscriptionHistory
            | Rejection::NoDueSubscription
            | Rejection::PlanNotFound(_)
            | Rejection::EmptyCatalog => RejectionKind::NotFound,
            Rejection::PaymentFailed(_) => RejectionKind::Gateway,
        }
    }

    /// Label used for the outcome dimension of operation metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::InvalidDuration(_) => "invalid_duration",
            Rejection::DateNotInFuture => "date_not_in_future",
            Rejection::DateBeforeExpiry => "date_before_expiry",
            Rejection::ActiveSubscriptionExists => "active_exists",
            Rejection::NoActiveSubscription => "no_active",
            Rejection::AlreadyCancelled => "already_cancelled",
            Rejection::NoSubscriptionHistory => "no_history",
            Rejection::NoDueSubscription => "no_due",
            Rejection::NotRenewable => "not_renewable",
            Rejection::PlanNotFound(_) => "plan_not_found",
            Rejection::EmptyCatalog => "empty_catalog",
            Rejection::PaymentUnavailable(_) => "payment_unavailable",
            Rejection::PaymentFailed(_) => "payment_failed",
        }
    }
}

/// Error returned by lifecycle operations.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("The payment method ({0}) is not supported")]
    UnsupportedPaymentMethod(String),

    #[error(transparent)]
    Store(#[from] AppError),
}

impl SubscriptionError {
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            SubscriptionError::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.rejection().is_some()
    }
}

/// Error returned by the usage ledger's write path.
#[derive(Debug, Error)]
pub enum MeteringError {
    #[error("feature {0} is not part of the plan")]
    FeatureNotFound(String),

    #[error("feature {0} is not metered")]
    NotBounded(String),

    #[error("consuming {requested} of {code} exceeds the remaining {remaining}")]
    LimitExceeded {
        code: String,
        requested: Decimal,
        remaining: Decimal,
    },

    #[error("amount must be positive with at most 4 decimal places, got {0}")]
    InvalidAmount(Decimal),

    #[error(transparent)]
    Store(#[from] AppError),
}

impl MeteringError {
    pub fn label(&self) -> &'static str {
        match self {
            MeteringError::FeatureNotFound(_) => "feature_not_found",
            MeteringError::NotBounded(_) => "not_bounded",
            MeteringError::LimitExceeded { .. } => "limit_exceeded",
            MeteringError::InvalidAmount(_) => "invalid_amount",
            MeteringError::Store(_) => "store_error",
        }
    }
}
