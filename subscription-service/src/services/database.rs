//! Database service for subscription-service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgExecutor, PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{
    ConsumeOutcome, CustomerRecord, Feature, Plan, ReleaseOutcome, SubscriberRef,
    SubscriptionRecord, UsageRecord,
};
use crate::services::metrics::query_timer;
use crate::services::store::{PlanCatalog, SubscriptionChanges, SubscriptionStore};

const PLAN_COLUMNS: &str =
    "plan_id, name, description, price, currency, duration_days, metadata, created_utc";

const FEATURE_COLUMNS: &str =
    "feature_id, plan_id, name, code, description, feature_type, usage_limit, metadata, created_utc";

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, subscriber_type, subscriber_id, plan_id, \
     starts_on, expires_on, cancelled_on, payment_method, is_paid, is_recurring, \
     recurring_each_days, charging_price, charging_currency, created_utc, updated_utc";

const USAGE_COLUMNS: &str = "usage_id, subscription_id, code, used, created_utc, updated_utc";

const CUSTOMER_COLUMNS: &str =
    "customer_record_id, subscriber_type, subscriber_id, customer_id, created_utc";

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

async fn insert_subscription_row<'e>(
    executor: impl PgExecutor<'e>,
    record: &SubscriptionRecord,
) -> Result<(), AppError> {
    sqlx::query(&format!(
        "INSERT INTO subscriptions ({SUBSCRIPTION_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
    ))
    .bind(record.subscription_id)
    .bind(&record.subscriber_type)
    .bind(&record.subscriber_id)
    .bind(record.plan_id)
    .bind(record.starts_on)
    .bind(record.expires_on)
    .bind(record.cancelled_on)
    .bind(&record.payment_method)
    .bind(record.is_paid)
    .bind(record.is_recurring)
    .bind(record.recurring_each_days)
    .bind(record.charging_price)
    .bind(&record.charging_currency)
    .bind(record.created_utc)
    .bind(record.updated_utc)
    .execute(executor)
    .await
    .map_err(|e| db_error("Failed to insert subscription", e))?;

    Ok(())
}

async fn update_subscription_row<'e>(
    executor: impl PgExecutor<'e>,
    record: &SubscriptionRecord,
) -> Result<(), AppError> {
    let result = sqlx::query(
        r#"
        UPDATE subscriptions
        SET plan_id = $2, starts_on = $3, expires_on = $4, cancelled_on = $5,
            payment_method = $6, is_paid = $7, is_recurring = $8, recurring_each_days = $9,
            charging_price = $10, charging_currency = $11, updated_utc = $12
        WHERE subscription_id = $1 AND subscriber_type = $13 AND subscriber_id = $14
        "#,
    )
    .bind(record.subscription_id)
    .bind(record.plan_id)
    .bind(record.starts_on)
    .bind(record.expires_on)
    .bind(record.cancelled_on)
    .bind(&record.payment_method)
    .bind(record.is_paid)
    .bind(record.is_recurring)
    .bind(record.recurring_each_days)
    .bind(record.charging_price)
    .bind(&record.charging_currency)
    .bind(record.updated_utc)
    .bind(&record.subscriber_type)
    .bind(&record.subscriber_id)
    .execute(executor)
    .await
    .map_err(|e| db_error("Failed to update subscription", e))?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "subscription {} not found",
            record.subscription_id
        )));
    }
    Ok(())
}

async fn subscriptions_of_subscriber<'e>(
    executor: impl PgExecutor<'e>,
    subscriber: &SubscriberRef,
) -> Result<Vec<SubscriptionRecord>, AppError> {
    sqlx::query_as::<_, SubscriptionRecord>(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
         WHERE subscriber_type = $1 AND subscriber_id = $2 ORDER BY insert_seq"
    ))
    .bind(&subscriber.subscriber_type)
    .bind(&subscriber.subscriber_id)
    .fetch_all(executor)
    .await
    .map_err(|e| db_error("Failed to list subscriptions", e))
}

#[derive(FromRow)]
struct ReleasedUsage {
    #[sqlx(flatten)]
    record: UsageRecord,
    previous_used: Decimal,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "subscription-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| db_error("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let _timer = query_timer("health_check");

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Catalog seeding
    // =========================================================================

    #[instrument(skip(self, plan), fields(plan_id = %plan.plan_id))]
    pub async fn create_plan(&self, plan: &Plan) -> Result<Plan, AppError> {
        let _timer = query_timer("create_plan");

        let created = sqlx::query_as::<_, Plan>(&format!(
            "INSERT INTO plans ({PLAN_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {PLAN_COLUMNS}"
        ))
        .bind(plan.plan_id)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price)
        .bind(&plan.currency)
        .bind(plan.duration_days)
        .bind(&plan.metadata)
        .bind(plan.created_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create plan", e))?;

        info!(plan_id = %created.plan_id, name = %created.name, "Plan created");
        Ok(created)
    }

    #[instrument(skip(self, feature), fields(plan_id = %feature.plan_id, code = %feature.code))]
    pub async fn create_feature(&self, feature: &Feature) -> Result<Feature, AppError> {
        let _timer = query_timer("create_feature");

        sqlx::query_as::<_, Feature>(&format!(
            "INSERT INTO plan_features ({FEATURE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {FEATURE_COLUMNS}"
        ))
        .bind(feature.feature_id)
        .bind(feature.plan_id)
        .bind(&feature.name)
        .bind(&feature.code)
        .bind(&feature.description)
        .bind(&feature.feature_type)
        .bind(feature.usage_limit)
        .bind(&feature.metadata)
        .bind(feature.created_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create feature", e))
    }

    async fn fetch_usage(
        &self,
        subscription_id: Uuid,
        code: &str,
    ) -> Result<Option<UsageRecord>, AppError> {
        sqlx::query_as::<_, UsageRecord>(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records WHERE subscription_id = $1 AND code = $2"
        ))
        .bind(subscription_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get usage", e))
    }

    async fn ensure_usage(
        &self,
        subscription_id: Uuid,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO usage_records (usage_id, subscription_id, code, used, created_utc, updated_utc)
            VALUES ($1, $2, $3, 0, $4, $4)
            ON CONFLICT (subscription_id, code) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription_id)
        .bind(code)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create usage record", e))?;
        Ok(())
    }
}

#[async_trait]
impl PlanCatalog for Database {
    #[instrument(skip(self), fields(plan_id = %plan_id))]
    async fn plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError> {
        let _timer = query_timer("get_plan");

        sqlx::query_as::<_, Plan>(&format!("SELECT {PLAN_COLUMNS} FROM plans WHERE plan_id = $1"))
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to get plan", e))
    }

    #[instrument(skip(self))]
    async fn first_plan(&self) -> Result<Option<Plan>, AppError> {
        let _timer = query_timer("first_plan");

        sqlx::query_as::<_, Plan>(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans ORDER BY created_utc, plan_id LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get first plan", e))
    }

    #[instrument(skip(self), fields(plan_id = %plan_id))]
    async fn features(&self, plan_id: Uuid) -> Result<Vec<Feature>, AppError> {
        let _timer = query_timer("get_features");

        sqlx::query_as::<_, Feature>(&format!(
            "SELECT {FEATURE_COLUMNS} FROM plan_features WHERE plan_id = $1 ORDER BY created_utc, code"
        ))
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get features", e))
    }

    #[instrument(skip(self), fields(plan_id = %plan_id, code = %code))]
    async fn feature(&self, plan_id: Uuid, code: &str) -> Result<Option<Feature>, AppError> {
        let _timer = query_timer("get_feature");

        sqlx::query_as::<_, Feature>(&format!(
            "SELECT {FEATURE_COLUMNS} FROM plan_features WHERE plan_id = $1 AND code = $2"
        ))
        .bind(plan_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get feature", e))
    }
}

#[async_trait]
impl SubscriptionStore for Database {
    #[instrument(skip(self, record), fields(subscription_id = %record.subscription_id))]
    async fn insert_subscription(&self, record: &SubscriptionRecord) -> Result<(), AppError> {
        let _timer = query_timer("insert_subscription");
        insert_subscription_row(&self.pool, record).await
    }

    /// Runs in one transaction holding a transaction-scoped advisory lock on
    /// the subscriber, so writers in other processes are serialized too.
    #[instrument(skip(self, seen, changes), fields(subscriber = %subscriber))]
    async fn apply_changes(
        &self,
        subscriber: &SubscriberRef,
        seen: &[SubscriptionRecord],
        changes: &SubscriptionChanges,
    ) -> Result<(), AppError> {
        let _timer = query_timer("apply_subscription_changes");
        changes.ensure_owned_by(subscriber)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::TEXT || ':' || $2::TEXT))")
            .bind(&subscriber.subscriber_type)
            .bind(&subscriber.subscriber_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to lock subscriber", e))?;

        let current = subscriptions_of_subscriber(&mut *tx, subscriber).await?;
        if current != seen {
            tx.rollback().await.ok();
            return Err(AppError::Conflict(anyhow::anyhow!(
                "subscriptions of {} changed concurrently",
                subscriber
            )));
        }

        // Dropping `tx` on an early return rolls everything back.
        for subscription_id in &changes.deleted {
            let result = sqlx::query(
                "DELETE FROM subscriptions \
                 WHERE subscription_id = $1 AND subscriber_type = $2 AND subscriber_id = $3",
            )
            .bind(subscription_id)
            .bind(&subscriber.subscriber_type)
            .bind(&subscriber.subscriber_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete subscription", e))?;

            if result.rows_affected() == 0 {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "subscription {} not found",
                    subscription_id
                )));
            }
        }
        for record in &changes.updated {
            update_subscription_row(&mut *tx, record).await?;
        }
        for record in &changes.inserted {
            insert_subscription_row(&mut *tx, record).await?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit subscription changes", e))?;

        info!(
            deleted = changes.deleted.len(),
            updated = changes.updated.len(),
            inserted = changes.inserted.len(),
            "Subscription changes committed"
        );
        Ok(())
    }

    #[instrument(skip(self, record), fields(subscription_id = %record.subscription_id))]
    async fn update_subscription(&self, record: &SubscriptionRecord) -> Result<(), AppError> {
        let _timer = query_timer("update_subscription");
        update_subscription_row(&self.pool, record).await
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn delete_subscription(&self, subscription_id: Uuid) -> Result<bool, AppError> {
        let _timer = query_timer("delete_subscription");

        let result = sqlx::query("DELETE FROM subscriptions WHERE subscription_id = $1")
            .bind(subscription_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to delete subscription", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<SubscriptionRecord>, AppError> {
        let _timer = query_timer("get_subscription");

        sqlx::query_as::<_, SubscriptionRecord>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE subscription_id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get subscription", e))
    }

    #[instrument(skip(self), fields(subscriber = %subscriber))]
    async fn subscriptions_of(
        &self,
        subscriber: &SubscriberRef,
    ) -> Result<Vec<SubscriptionRecord>, AppError> {
        let _timer = query_timer("list_subscriptions");
        subscriptions_of_subscriber(&self.pool, subscriber).await
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id, code = %code))]
    async fn usage(
        &self,
        subscription_id: Uuid,
        code: &str,
    ) -> Result<Option<UsageRecord>, AppError> {
        let _timer = query_timer("get_usage");
        self.fetch_usage(subscription_id, code).await
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn usages(&self, subscription_id: Uuid) -> Result<Vec<UsageRecord>, AppError> {
        let _timer = query_timer("list_usage");

        sqlx::query_as::<_, UsageRecord>(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records WHERE subscription_id = $1 ORDER BY code"
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list usage", e))
    }

    /// The ceiling is checked inside the UPDATE's WHERE clause, so concurrent
    /// consumers are serialized by the row lock.
    #[instrument(skip(self, now), fields(subscription_id = %subscription_id, code = %code))]
    async fn consume_usage(
        &self,
        subscription_id: Uuid,
        code: &str,
        amount: Decimal,
        ceiling: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, AppError> {
        let _timer = query_timer("consume_usage");

        self.ensure_usage(subscription_id, code, now).await?;

        let applied = sqlx::query_as::<_, UsageRecord>(&format!(
            "UPDATE usage_records SET used = used + $3, updated_utc = $5 \
             WHERE subscription_id = $1 AND code = $2 \
               AND ($4::NUMERIC IS NULL OR used + $3 <= $4::NUMERIC) \
             RETURNING {USAGE_COLUMNS}"
        ))
        .bind(subscription_id)
        .bind(code)
        .bind(amount)
        .bind(ceiling)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to consume usage", e))?;

        if let Some(record) = applied {
            return Ok(ConsumeOutcome::Applied(record));
        }

        let current = self
            .fetch_usage(subscription_id, code)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("usage record {} vanished", code)))?;
        Ok(ConsumeOutcome::WouldExceed(current))
    }

    #[instrument(skip(self, now), fields(subscription_id = %subscription_id, code = %code))]
    async fn release_usage(
        &self,
        subscription_id: Uuid,
        code: &str,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, AppError> {
        let _timer = query_timer("release_usage");

        self.ensure_usage(subscription_id, code, now).await?;

        let released = sqlx::query_as::<_, ReleasedUsage>(
            r#"
            UPDATE usage_records u
            SET used = GREATEST(u.used - $3, 0), updated_utc = $4
            FROM (
                SELECT usage_id, used AS previous_used
                FROM usage_records
                WHERE subscription_id = $1 AND code = $2
                FOR UPDATE
            ) prev
            WHERE u.usage_id = prev.usage_id
            RETURNING u.usage_id, u.subscription_id, u.code, u.used, u.created_utc,
                      u.updated_utc, prev.previous_used
            "#,
        )
        .bind(subscription_id)
        .bind(code)
        .bind(amount)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to release usage", e))?;

        Ok(ReleaseOutcome {
            record: released.record,
            previous_used: released.previous_used,
        })
    }

    #[instrument(skip(self), fields(subscriber = %subscriber))]
    async fn customer(
        &self,
        subscriber: &SubscriberRef,
    ) -> Result<Option<CustomerRecord>, AppError> {
        let _timer = query_timer("get_customer");

        sqlx::query_as::<_, CustomerRecord>(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customer_records \
             WHERE subscriber_type = $1 AND subscriber_id = $2"
        ))
        .bind(&subscriber.subscriber_type)
        .bind(&subscriber.subscriber_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get customer record", e))
    }

    #[instrument(skip(self, record), fields(customer_id = %record.customer_id))]
    async fn insert_customer(&self, record: &CustomerRecord) -> Result<(), AppError> {
        let _timer = query_timer("insert_customer");

        sqlx::query(&format!(
            "INSERT INTO customer_records ({CUSTOMER_COLUMNS}) VALUES ($1, $2, $3, $4, $5)"
        ))
        .bind(record.customer_record_id)
        .bind(&record.subscriber_type)
        .bind(&record.subscriber_id)
        .bind(&record.customer_id)
        .bind(record.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to insert customer record", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(subscriber = %subscriber))]
    async fn delete_customer(&self, subscriber: &SubscriberRef) -> Result<bool, AppError> {
        let _timer = query_timer("delete_customer");

        let result = sqlx::query(
            "DELETE FROM customer_records WHERE subscriber_type = $1 AND subscriber_id = $2",
        )
        .bind(&subscriber.subscriber_type)
        .bind(&subscriber.subscriber_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to delete customer record", e))?;

        Ok(result.rows_affected() > 0)
    }
}
