//! Bot user with a denormalized cache of the active subscription.

use super::SubscriptionTier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// `subscription_tier` and `subscription_expires_at` mirror the user's active
/// subscription. They are written only by the user repository's cache sync.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub language_code: String,
    pub subscription_tier: SubscriptionTier,
    pub subscription_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn has_active_subscription(&self, now: DateTime<Utc>) -> bool {
        self.subscription_tier.is_paid()
            && matches!(self.subscription_expires_at, Some(expires) if expires > now)
    }

    /// Tier the user is entitled to right now, falling back to free once the cache is stale.
    pub fn effective_tier(&self, now: DateTime<Utc>) -> SubscriptionTier {
        if self.has_active_subscription(now) {
            self.subscription_tier
        } else {
            SubscriptionTier::Free
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateUser {
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub language_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user(tier: SubscriptionTier, expires: Option<DateTime<Utc>>) -> User {
        let now = Utc::now();
        User {
            id: 7,
            telegram_id: 700,
            username: None,
            first_name: None,
            language_code: "ru".to_string(),
            subscription_tier: tier,
            subscription_expires_at: expires,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn stale_cache_falls_back_to_free() {
        let now = Utc::now();
        let expired = user(SubscriptionTier::Premium, Some(now - Duration::hours(1)));
        assert!(!expired.has_active_subscription(now));
        assert_eq!(expired.effective_tier(now), SubscriptionTier::Free);

        let active = user(SubscriptionTier::Premium, Some(now + Duration::days(3)));
        assert_eq!(active.effective_tier(now), SubscriptionTier::Premium);
    }

    #[test]
    fn free_user_has_no_subscription() {
        let now = Utc::now();
        assert!(!user(SubscriptionTier::Free, None).has_active_subscription(now));
    }
}
