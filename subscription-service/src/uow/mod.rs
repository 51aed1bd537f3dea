//! Unit of Work: one transaction, lazily built repositories, atomic commit.

mod session;

pub use session::{Session, SessionConnection};

use crate::error::BillingResult;
use crate::repositories::{PgSubscriptionRepository, PgUserRepository};
use once_cell::sync::OnceCell;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{instrument, warn};

/// A transactional scope over every repository.
///
/// Repositories are created on first access and live as long as the scope.
/// Dropping a unit of work without committing rolls the transaction back.
pub struct UnitOfWork {
    session: Arc<Session>,
    default_currency: String,
    users: OnceCell<PgUserRepository>,
    subscriptions: OnceCell<PgSubscriptionRepository>,
}

impl UnitOfWork {
    pub async fn begin(pool: &PgPool, default_currency: &str) -> BillingResult<Self> {
        let session = Session::begin(pool).await?;
        Ok(Self {
            session: Arc::new(session),
            default_currency: default_currency.to_string(),
            users: OnceCell::new(),
            subscriptions: OnceCell::new(),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn users(&self) -> &PgUserRepository {
        self.users
            .get_or_init(|| PgUserRepository::new(Arc::clone(&self.session)))
    }

    pub fn subscriptions(&self) -> &PgSubscriptionRepository {
        self.subscriptions.get_or_init(|| {
            PgSubscriptionRepository::new(
                Arc::clone(&self.session),
                self.users().clone(),
                &self.default_currency,
            )
        })
    }

    /// Reads issued so far in this scope.
    pub fn query_count(&self) -> usize {
        self.session.query_count()
    }

    /// Commit every change made in this scope. A failed commit is rolled back
    /// before the error is returned.
    #[instrument(skip(self), fields(queries = self.query_count()))]
    pub async fn commit(self) -> BillingResult<()> {
        if let Err(e) = self.session.commit().await {
            if let Err(rollback_err) = self.session.rollback().await {
                warn!(error = %rollback_err, "Rollback after failed commit failed");
            }
            return Err(e);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(queries = self.query_count()))]
    pub async fn rollback(self) -> BillingResult<()> {
        self.session.rollback().await
    }
}
