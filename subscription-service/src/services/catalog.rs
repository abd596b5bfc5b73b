//! Plan feature lookup by code.

use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{Feature, FeatureLimit};
use crate::services::store::PlanCatalog;

/// How a feature code resolves on a plan.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureLookup {
    Missing,
    Boolean(Feature),
    Bounded(Feature, FeatureLimit),
}

/// Read-only view of one plan's features.
#[derive(Clone)]
pub struct FeatureCatalog {
    catalog: Arc<dyn PlanCatalog>,
    plan_id: Uuid,
}

impl FeatureCatalog {
    pub fn new(catalog: Arc<dyn PlanCatalog>, plan_id: Uuid) -> Self {
        Self { catalog, plan_id }
    }

    pub fn plan_id(&self) -> Uuid {
        self.plan_id
    }

    pub async fn features(&self) -> Result<Vec<Feature>, AppError> {
        self.catalog.features(self.plan_id).await
    }

    pub async fn lookup(&self, code: &str) -> Result<FeatureLookup, AppError> {
        let Some(feature) = self.catalog.feature(self.plan_id, code).await? else {
            return Ok(FeatureLookup::Missing);
        };

        Ok(match feature.limit() {
            None => FeatureLookup::Boolean(feature),
            Some(limit) => FeatureLookup::Bounded(feature, limit),
        })
    }

    /// Whether the plan grants `code` at all, metered or not.
    pub async fn has_feature(&self, code: &str) -> Result<bool, AppError> {
        Ok(!matches!(self.lookup(code).await?, FeatureLookup::Missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Plan;
    use crate::services::memory::InMemoryCatalog;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn test_lookup_classifies_features() {
        let catalog = InMemoryCatalog::new();
        let plan = Plan::new("Team", Decimal::from(20), "USD", 30);
        let plan_id = plan.plan_id;
        catalog.insert_plan(plan).unwrap();
        catalog.insert_feature(Feature::bounded(plan_id, "seats", 10)).unwrap();
        catalog.insert_feature(Feature::bounded(plan_id, "api.calls", -1)).unwrap();
        catalog.insert_feature(Feature::boolean(plan_id, "sso")).unwrap();

        let features = FeatureCatalog::new(Arc::new(catalog), plan_id);

        assert!(matches!(
            features.lookup("seats").await.unwrap(),
            FeatureLookup::Bounded(_, FeatureLimit::Capped(10))
        ));
        assert!(matches!(
            features.lookup("api.calls").await.unwrap(),
            FeatureLookup::Bounded(_, FeatureLimit::Unbounded)
        ));
        assert!(matches!(features.lookup("sso").await.unwrap(), FeatureLookup::Boolean(_)));
        assert_eq!(features.lookup("storage").await.unwrap(), FeatureLookup::Missing);
        assert!(features.has_feature("sso").await.unwrap());
    }
}
