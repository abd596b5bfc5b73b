//! Resolution of a subscriber's current, last and due subscriptions.

use chrono::{DateTime, Utc};

use crate::models::SubscriptionRecord;

/// One subscriber's records evaluated at a fixed instant.
///
/// "Most recent" means latest `starts_on`; ties go to the record inserted
/// later. Records must be supplied in insertion order.
#[derive(Debug, Clone)]
pub struct SubscriptionHistory {
    records: Vec<SubscriptionRecord>,
    now: DateTime<Utc>,
}

fn latest<'a>(
    records: impl Iterator<Item = &'a SubscriptionRecord>,
) -> Option<&'a SubscriptionRecord> {
    records.fold(None, |best, record| match best {
        Some(best) if best.starts_on > record.starts_on => Some(best),
        _ => Some(record),
    })
}

impl SubscriptionHistory {
    pub fn new(records: Vec<SubscriptionRecord>, now: DateTime<Utc>) -> Self {
        Self { records, now }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn records(&self) -> &[SubscriptionRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<SubscriptionRecord> {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// The paid record whose window contains `now`. Cancelled records stay
    /// active until they expire; unpaid records in their window are due, not
    /// active.
    pub fn active(&self) -> Option<&SubscriptionRecord> {
        latest(
            self.records
                .iter()
                .filter(|r| r.is_paid && r.is_active(self.now)),
        )
    }

    /// Most recent paid, non-cancelled record, expired or not.
    pub fn last_active(&self) -> Option<&SubscriptionRecord> {
        latest(self.records.iter().filter(|r| r.is_paid && !r.is_cancelled()))
    }

    pub fn last_subscription(&self) -> Option<&SubscriptionRecord> {
        latest(self.records.iter())
    }

    /// Most recent unpaid, non-cancelled record.
    pub fn last_unpaid(&self) -> Option<&SubscriptionRecord> {
        latest(self.records.iter().filter(|r| !r.is_paid && !r.is_cancelled()))
    }

    /// The record the subscriber owes payment for.
    ///
    /// When the newest record is itself the last paid one it simply lapsed,
    /// and nothing is due. Only a newer unpaid attempt, or an unpaid record
    /// with no paid history at all, counts.
    pub fn last_due(&self) -> Option<&SubscriptionRecord> {
        if self.is_empty() || self.active().is_some() {
            return None;
        }

        let Some(last_active) = self.last_active() else {
            return self.last_unpaid();
        };

        match self.last_subscription() {
            Some(last) if last.subscription_id == last_active.subscription_id => None,
            _ => self.last_unpaid(),
        }
    }

    pub fn has_due(&self) -> bool {
        self.last_due().is_some()
    }

    /// Non-cancelled records queued to start once `record` ends.
    pub fn successors_of(&self, record: &SubscriptionRecord) -> Vec<&SubscriptionRecord> {
        self.records
            .iter()
            .filter(|r| {
                r.subscription_id != record.subscription_id
                    && !r.is_cancelled()
                    && r.starts_on >= record.expires_on
            })
            .collect()
    }

    /// Where the chain starting at `record` ends.
    pub fn chain_end(&self, record: &SubscriptionRecord) -> DateTime<Utc> {
        self.successors_of(record)
            .into_iter()
            .map(|r| r.expires_on)
            .fold(record.expires_on, |end, expires_on| end.max(expires_on))
    }
}
