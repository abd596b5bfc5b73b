//! Plan feature model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Feature type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// On/off entitlement. Never metered.
    Boolean,
    /// Metered against a limit.
    Bounded,
}

impl FeatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKind::Boolean => "feature",
            FeatureKind::Bounded => "limit",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "limit" => FeatureKind::Bounded,
            _ => FeatureKind::Boolean,
        }
    }
}

/// Ceiling of a bounded feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureLimit {
    Unbounded,
    Capped(i64),
}

/// A feature attached to exactly one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Feature {
    pub feature_id: Uuid,
    pub plan_id: Uuid,
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    pub feature_type: String,
    /// Only meaningful for bounded features; negative means unbounded.
    pub usage_limit: i64,
    pub metadata: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
}

impl Feature {
    /// A metered feature. Pass a negative `limit` for no ceiling.
    pub fn bounded(plan_id: Uuid, code: impl Into<String>, limit: i64) -> Self {
        Self::build(plan_id, code.into(), FeatureKind::Bounded, limit)
    }

    /// An on/off feature.
    pub fn boolean(plan_id: Uuid, code: impl Into<String>) -> Self {
        Self::build(plan_id, code.into(), FeatureKind::Boolean, 0)
    }

    fn build(plan_id: Uuid, code: String, kind: FeatureKind, usage_limit: i64) -> Self {
        Self {
            feature_id: Uuid::new_v4(),
            plan_id,
            name: code.clone(),
            code,
            description: None,
            feature_type: kind.as_str().to_string(),
            usage_limit,
            metadata: None,
            created_utc: Utc::now(),
        }
    }

    pub fn kind(&self) -> FeatureKind {
        FeatureKind::from_string(&self.feature_type)
    }

    /// The ceiling, or `None` for boolean features.
    pub fn limit(&self) -> Option<FeatureLimit> {
        match self.kind() {
            FeatureKind::Boolean => None,
            FeatureKind::Bounded if self.usage_limit < 0 => Some(FeatureLimit::Unbounded),
            FeatureKind::Bounded => Some(FeatureLimit::Capped(self.usage_limit)),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self.limit(), Some(FeatureLimit::Unbounded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_limit_is_unbounded() {
        let feature = Feature::bounded(Uuid::new_v4(), "users.amount", -1);
        assert_eq!(feature.kind(), FeatureKind::Bounded);
        assert_eq!(feature.limit(), Some(FeatureLimit::Unbounded));
        assert!(feature.is_unlimited());
    }

    #[test]
    fn test_boolean_feature_has_no_limit() {
        let feature = Feature::boolean(Uuid::new_v4(), "vault.access");
        assert_eq!(feature.feature_type, "feature");
        assert_eq!(feature.limit(), None);
        assert!(!feature.is_unlimited());
    }

    #[test]
    fn test_zero_limit_is_capped() {
        let feature = Feature::bounded(Uuid::new_v4(), "seats", 0);
        assert_eq!(feature.limit(), Some(FeatureLimit::Capped(0)));
    }
}
