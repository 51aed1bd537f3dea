//! Subscription, tier and plan catalogue models.

use crate::error::{BillingError, BillingResult};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Longest period a single purchase, grant, extension or report window may span.
pub const MAX_PERIOD_DAYS: i64 = 3660;

/// `at + days`, rejecting periods outside `1..=MAX_PERIOD_DAYS` and results
/// that do not fit a timestamp.
pub fn add_period(at: DateTime<Utc>, days: i64) -> BillingResult<DateTime<Utc>> {
    if !(1..=MAX_PERIOD_DAYS).contains(&days) {
        return Err(BillingError::validation(format!(
            "Period must be between 1 and {} days, got {}",
            MAX_PERIOD_DAYS, days
        )));
    }
    Duration::try_days(days)
        .and_then(|period| at.checked_add_signed(period))
        .ok_or_else(|| BillingError::validation(format!("{} days from {} is out of range", days, at)))
}

/// Subscription tiers, ordered from least to most privileged.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Basic,
    Premium,
    Vip,
}

impl SubscriptionTier {
    pub const ALL: [SubscriptionTier; 4] = [
        SubscriptionTier::Free,
        SubscriptionTier::Basic,
        SubscriptionTier::Premium,
        SubscriptionTier::Vip,
    ];

    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Premium => "premium",
            Self::Vip => "vip",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Self::Free),
            "basic" => Some(Self::Basic),
            "premium" => Some(Self::Premium),
            "vip" => Some(Self::Vip),
            _ => None,
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }

    /// Daily reading allowance used when the plan catalogue has no row for the tier.
    pub fn default_daily_readings_limit(&self) -> u32 {
        match self {
            Self::Free => 1,
            Self::Basic => 5,
            Self::Premium => 10,
            Self::Vip => 999,
        }
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One subscription period of a user. Rows are never deleted; cancellation is a flag.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub tier: SubscriptionTier,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_auto_renew: bool,
    pub next_payment_date: Option<DateTime<Utc>>,
    pub payment_id: Option<i64>,
    pub promo_code_id: Option<i64>,
    pub is_trial: bool,
    pub is_cancelled: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_cancelled && self.expires_at > now
    }

    /// Whole days left until expiry, zero once inactive.
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        if !self.is_active(now) {
            return 0;
        }
        (self.expires_at - now).num_days().max(0)
    }
}

/// Input for creating a subscription.
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub user_id: i64,
    pub tier: SubscriptionTier,
    pub period_days: i32,
    pub payment_id: Option<i64>,
    pub promo_code_id: Option<i64>,
    pub is_trial: bool,
    pub is_auto_renew: bool,
}

impl CreateSubscription {
    /// Expiry for a subscription starting at `started_at`.
    pub fn expires_at(&self, started_at: DateTime<Utc>) -> BillingResult<DateTime<Utc>> {
        add_period(started_at, i64::from(self.period_days))
    }
}

/// Plan catalogue row, one per tier.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: i64,
    pub tier: SubscriptionTier,
    pub name: String,
    pub description: Option<String>,
    pub monthly_price: Decimal,
    pub yearly_price: Option<Decimal>,
    pub daily_readings_limit: i32,
    pub monthly_readings_limit: Option<i32>,
    pub is_active: bool,
    pub sort_order: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
