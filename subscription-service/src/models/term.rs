use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Length of a subscription period: a day count or an explicit end date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Term {
    Days(i64),
    Until(DateTime<Utc>),
}

impl Term {
    /// The target date for `Until`, used to pick the event variant.
    pub fn until(&self) -> Option<DateTime<Utc>> {
        match self {
            Term::Days(_) => None,
            Term::Until(date) => Some(*date),
        }
    }
}
