//! Reporting and entitlement read models.

use super::SubscriptionTier;
use crate::error::{BillingError, BillingResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

/// Revenue of one tier within a reporting period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierRevenue {
    pub count: i64,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevenueStatistics {
    pub total_revenue: Decimal,
    pub by_tier: BTreeMap<SubscriptionTier, TierRevenue>,
    pub active_subscriptions: BTreeMap<SubscriptionTier, i64>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
}

impl RevenueStatistics {
    pub fn successful_payments(&self) -> i64 {
        self.by_tier.values().map(|t| t.count).sum()
    }
}

/// What a user may access right now.
#[derive(Debug, Clone, Serialize)]
pub struct Entitlement {
    pub user_id: i64,
    pub tier: SubscriptionTier,
    pub expires_at: Option<DateTime<Utc>>,
    pub daily_readings_limit: u32,
}

impl Entitlement {
    /// Deny access to features above the user's tier.
    pub fn require_tier(&self, required: SubscriptionTier) -> BillingResult<()> {
        if self.tier < required {
            return Err(BillingError::SubscriptionRequired {
                required,
                current: self.tier,
            });
        }
        Ok(())
    }

    /// Deny another reading once today's allowance is spent.
    pub fn require_daily_allowance(&self, used_today: u32) -> BillingResult<()> {
        if used_today >= self.daily_readings_limit {
            return Err(BillingError::DailyLimitReached {
                limit: self.daily_readings_limit,
            });
        }
        Ok(())
    }
}
