//! Wiring of the lifecycle manager from configuration.

use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::SubscriptionConfig;
use crate::error::SubscriptionError;
use crate::models::PaymentMethod;
use crate::services::{
    init_metrics, Database, EventSink, InMemoryCatalog, InMemoryStore, LifecycleManager,
    PaymentCoordinator, PaymentGateway, PlanCatalog, SubscriptionStore,
};

/// Install tracing as configured.
pub fn init_observability(config: &SubscriptionConfig) -> Result<(), AppError> {
    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )
}

/// Persistence the manager was built on.
pub enum Backend {
    Postgres(Database),
    InMemory {
        store: Arc<InMemoryStore>,
        catalog: Arc<InMemoryCatalog>,
    },
}

impl Backend {
    pub fn store(&self) -> Arc<dyn SubscriptionStore> {
        match self {
            Backend::Postgres(db) => Arc::new(db.clone()),
            Backend::InMemory { store, .. } => store.clone(),
        }
    }

    pub fn catalog(&self) -> Arc<dyn PlanCatalog> {
        match self {
            Backend::Postgres(db) => Arc::new(db.clone()),
            Backend::InMemory { catalog, .. } => catalog.clone(),
        }
    }
}

/// A configured lifecycle manager and the backend behind it.
pub struct Application {
    config: SubscriptionConfig,
    manager: LifecycleManager,
    backend: Backend,
}

impl Application {
    /// Connect to Postgres and run migrations when a database is configured,
    /// otherwise fall back to the in-memory store.
    pub async fn build(
        config: SubscriptionConfig,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        init_metrics()?;

        let backend = match &config.database {
            Some(database) => {
                let db = Database::new(
                    &database.url,
                    database.max_connections,
                    database.min_connections,
                )
                .await?;
                db.run_migrations().await?;
                Backend::Postgres(db)
            }
            None => {
                warn!("No database configured, subscriptions are kept in memory");
                Backend::InMemory {
                    store: Arc::new(InMemoryStore::new()),
                    catalog: Arc::new(InMemoryCatalog::new()),
                }
            }
        };

        let manager = LifecycleManager::new(
            backend.store(),
            backend.catalog(),
            events,
            clock,
            config.subscriptions.clone(),
        );

        info!(
            service_name = %config.service_name,
            supported_methods = ?config.payments.supported_methods,
            gateway_timeout_secs = config.payments.gateway_timeout_secs,
            "Subscription lifecycle manager ready"
        );

        Ok(Self {
            config,
            manager,
            backend,
        })
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    pub fn manager(&self) -> &LifecycleManager {
        &self.manager
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Build a coordinator for a payment method name, checked against the
    /// configured allow-list.
    pub fn payment_coordinator(
        &self,
        gateway: Arc<dyn PaymentGateway>,
        method: &str,
    ) -> Result<PaymentCoordinator, SubscriptionError> {
        let supported = &self.config.payments.supported_methods;
        let method = PaymentMethod::parse_supported(method, supported)?;
        PaymentCoordinator::new(gateway, method, &self.config.payments)
    }
}
