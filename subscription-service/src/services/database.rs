//! Database service for subscription-service.

use crate::config::BillingSettings;
use crate::error::BillingResult;
use crate::services::metrics::{record_uow_queries, start_query_timer};
use crate::uow::UnitOfWork;
use futures::future::BoxFuture;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    settings: BillingSettings,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url, settings), fields(service = "subscription-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        settings: BillingSettings,
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
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool, settings })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, settings: BillingSettings) -> Self {
        Self { pool, settings }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn settings(&self) -> &BillingSettings {
        &self.settings
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = start_query_timer("health_check");

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
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

    /// Open a unit of work. The caller owns commit and rollback.
    pub async fn begin(&self) -> BillingResult<UnitOfWork> {
        UnitOfWork::begin(&self.pool, &self.settings.default_currency).await
    }

    /// Run `operation` inside one unit of work: commit when it returns `Ok`,
    /// roll back when it returns `Err`.
    ///
    /// ```ignore
    /// let user = db
    ///     .unit_of_work("register_user", |uow| {
    ///         Box::pin(async move { uow.users().create_user(input).await })
    ///     })
    ///     .await?;
    /// ```
    pub async fn unit_of_work<F, T>(&self, name: &'static str, operation: F) -> BillingResult<T>
    where
        F: for<'u> FnOnce(&'u UnitOfWork) -> BoxFuture<'u, BillingResult<T>>,
    {
        let uow = self.begin().await?;
        let result = operation(&uow).await;

        let queries = uow.query_count();
        record_uow_queries(queries);
        if queries > self.settings.n_plus_one_threshold {
            warn!(
                unit_of_work = name,
                queries = queries,
                threshold = self.settings.n_plus_one_threshold,
                "Possible N+1 query pattern"
            );
        }

        match result {
            Ok(value) => {
                uow.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(
                        unit_of_work = name,
                        error = %rollback_err,
                        "Rollback failed"
                    );
                }
                Err(e)
            }
        }
    }
}
