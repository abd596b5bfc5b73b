//! Payment method allow-list.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SubscriptionError;

/// Payment methods a subscription may be charged through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Stripe,
    Razorpay,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Stripe => "stripe",
            PaymentMethod::Razorpay => "razorpay",
        }
    }

    /// Parse `value` and check it against the configured allow-list.
    pub fn parse_supported(value: &str, supported: &[String]) -> Result<Self, SubscriptionError> {
        let method: PaymentMethod = value.parse()?;
        method.ensure_supported(supported)?;
        Ok(method)
    }

    pub fn ensure_supported(&self, supported: &[String]) -> Result<(), SubscriptionError> {
        if supported.iter().any(|s| s.eq_ignore_ascii_case(self.as_str())) {
            Ok(())
        } else {
            Err(SubscriptionError::UnsupportedPaymentMethod(
                self.as_str().to_string(),
            ))
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = SubscriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stripe" => Ok(PaymentMethod::Stripe),
            "razorpay" => Ok(PaymentMethod::Razorpay),
            _ => Err(SubscriptionError::UnsupportedPaymentMethod(s.to_string())),
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
