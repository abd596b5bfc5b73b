//! Payment gateway customer record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::SubscriberRef;

/// Links a subscriber to its customer id at the payment gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CustomerRecord {
    pub customer_record_id: Uuid,
    pub subscriber_type: String,
    pub subscriber_id: String,
    pub customer_id: String,
    pub created_utc: DateTime<Utc>,
}

impl CustomerRecord {
    pub fn new(subscriber: &SubscriberRef, customer_id: impl Into<String>) -> Self {
        Self {
            customer_record_id: Uuid::new_v4(),
            subscriber_type: subscriber.subscriber_type.clone(),
            subscriber_id: subscriber.subscriber_id.clone(),
            customer_id: customer_id.into(),
            created_utc: Utc::now(),
        }
    }
}
