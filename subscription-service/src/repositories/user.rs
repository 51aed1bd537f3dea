//! User repository: lookups, registration, and the subscription cache.

use super::base::BaseRepository;
use super::query::Fields;
use crate::error::{read_error, BillingError, BillingResult};
use crate::models::{CreateUser, SubscriptionTier, User};
use crate::services::metrics::start_query_timer;
use crate::uow::Session;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument};

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_by_id(&self, id: i64) -> BillingResult<Option<User>>;

    async fn get_by_telegram_id(&self, telegram_id: i64) -> BillingResult<Option<User>>;

    async fn create_user(&self, input: CreateUser) -> BillingResult<User>;

    /// Lock the user row until the transaction ends. Settlements for one user
    /// serialize on this lock.
    async fn lock_for_update(&self, id: i64) -> BillingResult<User>;

    /// Recompute `subscription_tier` / `subscription_expires_at` from the
    /// user's active subscription, or reset to free when there is none.
    async fn sync_subscription_cache(&self, user_id: i64, now: DateTime<Utc>)
        -> BillingResult<User>;
}

#[derive(Clone)]
pub struct PgUserRepository {
    users: BaseRepository<User>,
}

impl PgUserRepository {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            users: BaseRepository::new(session),
        }
    }

    /// Generic access to the users table.
    pub fn base(&self) -> &BaseRepository<User> {
        &self.users
    }

    async fn active_tier(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<(SubscriptionTier, DateTime<Utc>)>> {
        let timer = start_query_timer("active_tier_subscriptions");
        let mut conn = self.users.session().read().await?;
        let row = sqlx::query_as::<_, (SubscriptionTier, DateTime<Utc>)>(
            r#"
            SELECT tier, expires_at
            FROM subscriptions
            WHERE user_id = $1 AND is_cancelled = FALSE AND expires_at > $2
            ORDER BY expires_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| read_error("load active subscription", e))?;
        timer.observe_duration();
        Ok(row)
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn get_by_id(&self, id: i64) -> BillingResult<Option<User>> {
        self.users.get_by_id(id).await
    }

    async fn get_by_telegram_id(&self, telegram_id: i64) -> BillingResult<Option<User>> {
        self.users
            .find_one(Fields::new().set("telegram_id", telegram_id))
            .await
    }

    #[instrument(skip(self, input), fields(telegram_id = input.telegram_id))]
    async fn create_user(&self, input: CreateUser) -> BillingResult<User> {
        let mut fields = Fields::new()
            .set("telegram_id", input.telegram_id)
            .set("username", input.username)
            .set("first_name", input.first_name);
        if let Some(language_code) = input.language_code {
            fields = fields.set("language_code", language_code);
        }

        let user = self.users.create(fields).await?;

        info!(user_id = user.id, telegram_id = user.telegram_id, "User created");

        Ok(user)
    }

    async fn lock_for_update(&self, id: i64) -> BillingResult<User> {
        self.users
            .get_for_update(id)
            .await?
            .ok_or_else(|| BillingError::not_found("User", id))
    }

    #[instrument(skip(self), fields(user_id = user_id))]
    async fn sync_subscription_cache(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<User> {
        let (tier, expires_at) = match self.active_tier(user_id, now).await? {
            Some((tier, expires_at)) => (tier, Some(expires_at)),
            None => (SubscriptionTier::Free, None),
        };

        let user = self
            .users
            .update(
                user_id,
                Fields::new()
                    .set("subscription_tier", tier)
                    .set("subscription_expires_at", expires_at),
            )
            .await?
            .ok_or_else(|| BillingError::not_found("User", user_id))?;

        info!(
            user_id = user_id,
            tier = %tier,
            "User subscription cache synchronized"
        );

        Ok(user)
    }
}
