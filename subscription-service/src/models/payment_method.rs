//! Saved payment methods used for auto-renewal.

use super::PaymentProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Soft-deactivated, never hard-deleted. At most one default per user.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: i64,
    pub user_id: i64,
    pub provider: PaymentProvider,
    pub provider_method_id: String,
    pub card_last4: Option<String>,
    pub card_brand: Option<String>,
    pub is_default: bool,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentMethod {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !matches!(self.expires_at, Some(expires) if expires <= now)
    }

    /// Masked card label such as `Visa *4242`.
    pub fn display_name(&self) -> String {
        match (&self.card_brand, &self.card_last4) {
            (Some(brand), Some(last4)) => format!("{} *{}", brand, last4),
            (None, Some(last4)) => format!("*{}", last4),
            _ => self.provider.to_string(),
        }
    }
}

/// Input for `save_payment_method`; updates the existing row for the same
/// `(user, provider, provider_method_id)` instead of inserting a duplicate.
#[derive(Debug, Clone)]
pub struct SavePaymentMethod {
    pub user_id: i64,
    pub provider: PaymentProvider,
    pub provider_method_id: String,
    pub card_last4: Option<String>,
    pub card_brand: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub make_default: bool,
}
