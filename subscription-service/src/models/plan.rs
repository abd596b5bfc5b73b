//! Plan model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Catalog plan. Never mutated once a subscription has snapshotted its price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub plan_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub currency: String,
    pub duration_days: i32,
    pub metadata: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
}

impl Plan {
    pub fn new(
        name: impl Into<String>,
        price: Decimal,
        currency: impl Into<String>,
        duration_days: i32,
    ) -> Self {
        Self {
            plan_id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            price,
            currency: currency.into(),
            duration_days,
            metadata: None,
            created_utc: Utc::now(),
        }
    }
}
