//! Promo code model, redemption checks and discount math.

use super::SubscriptionTier;
use crate::error::{BillingError, BillingResult};
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const GENERATED_CODE_LENGTH: usize = 8;
const MIN_CODE_LENGTH: usize = 3;
const MAX_CODE_LENGTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PromoCodeType {
    Percentage,
    Fixed,
    Trial,
    Upgrade,
}

impl PromoCodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Percentage => "percentage",
            Self::Fixed => "fixed",
            Self::Trial => "trial",
            Self::Upgrade => "upgrade",
        }
    }
}

impl std::fmt::Display for PromoCodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Promo code. Kept forever for audit.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PromoCode {
    pub id: i64,
    pub code: String,
    pub promo_type: PromoCodeType,
    pub discount_percent: Option<i32>,
    pub discount_amount: Option<Decimal>,
    pub trial_days: Option<i32>,
    pub max_uses: Option<i32>,
    pub used_count: i32,
    pub max_uses_per_user: i32,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub applicable_tiers: Option<Vec<String>>,
    pub min_amount: Option<Decimal>,
    pub is_active: bool,
    pub created_by_admin_id: Option<i64>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why a promo code cannot be redeemed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoRejection {
    NotFound,
    Inactive,
    NotYetActive,
    Expired,
    Exhausted,
    AlreadyUsed { uses: i64 },
    TierNotApplicable,
    BelowMinimum { min_amount: Decimal, currency: String },
}

impl PromoRejection {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Inactive => "inactive",
            Self::NotYetActive => "not_yet_active",
            Self::Expired => "expired",
            Self::Exhausted => "exhausted",
            Self::AlreadyUsed { .. } => "already_used",
            Self::TierNotApplicable => "tier_not_applicable",
            Self::BelowMinimum { .. } => "below_minimum",
        }
    }
}

impl std::fmt::Display for PromoRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "Promo code not found"),
            Self::Inactive => write!(f, "Promo code is inactive"),
            Self::NotYetActive => write!(f, "Promo code is not active yet"),
            Self::Expired => write!(f, "Promo code expired"),
            Self::Exhausted => write!(f, "Promo code exhausted"),
            Self::AlreadyUsed { uses } => {
                write!(f, "You have already used this promo code {} time(s)", uses)
            }
            Self::TierNotApplicable => write!(f, "Promo code does not apply to this plan"),
            Self::BelowMinimum {
                min_amount,
                currency,
            } => write!(
                f,
                "Minimum order amount for this promo code is {} {}",
                min_amount, currency
            ),
        }
    }
}

/// Outcome of validating a promo code for one purchase.
#[derive(Debug, Clone)]
pub enum PromoValidation {
    Valid(PromoCode),
    Invalid(PromoRejection),
}

impl PromoValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, PromoValidation::Valid(_))
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            PromoValidation::Valid(_) => None,
            PromoValidation::Invalid(rejection) => Some(rejection.to_string()),
        }
    }

    /// `(valid, reason)` as the bot handlers consume it.
    pub fn into_tuple(self) -> (bool, Option<String>) {
        let reason = self.reason();
        (self.is_valid(), reason)
    }
}

/// Result of applying a promo code to an amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AppliedDiscount {
    pub discount: Decimal,
    pub final_amount: Decimal,
}

impl PromoCode {
    /// Checks that depend only on the code itself, in redemption order.
    pub fn check_availability(&self, now: DateTime<Utc>) -> Result<(), PromoRejection> {
        if !self.is_active {
            return Err(PromoRejection::Inactive);
        }
        if self.valid_from > now {
            return Err(PromoRejection::NotYetActive);
        }
        if matches!(self.valid_until, Some(until) if until < now) {
            return Err(PromoRejection::Expired);
        }
        if matches!(self.max_uses, Some(max) if self.used_count >= max) {
            return Err(PromoRejection::Exhausted);
        }
        Ok(())
    }

    pub fn check_user_uses(&self, uses: i64) -> Result<(), PromoRejection> {
        if uses >= i64::from(self.max_uses_per_user) {
            return Err(PromoRejection::AlreadyUsed { uses });
        }
        Ok(())
    }

    /// Checks that depend on the purchase the code is applied to.
    pub fn check_purchase(
        &self,
        tier: SubscriptionTier,
        amount: Decimal,
        currency: &str,
    ) -> Result<(), PromoRejection> {
        if let Some(tiers) = &self.applicable_tiers {
            if !tiers.is_empty() && !tiers.iter().any(|t| t == tier.as_str()) {
                return Err(PromoRejection::TierNotApplicable);
            }
        }
        if let Some(min_amount) = self.min_amount {
            if amount < min_amount {
                return Err(PromoRejection::BelowMinimum {
                    min_amount,
                    currency: currency.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Discount for `amount`. Trial and upgrade codes carry no monetary discount.
    pub fn calculate_discount(&self, amount: Decimal) -> Decimal {
        match self.promo_type {
            PromoCodeType::Percentage => {
                let percent = Decimal::from(self.discount_percent.unwrap_or(0));
                (amount * percent / Decimal::ONE_HUNDRED).round_dp(2)
            }
            PromoCodeType::Fixed => self.discount_amount.unwrap_or(Decimal::ZERO).min(amount),
            PromoCodeType::Trial | PromoCodeType::Upgrade => Decimal::ZERO,
        }
    }

    pub fn apply(&self, amount: Decimal) -> AppliedDiscount {
        let discount = self.calculate_discount(amount);
        AppliedDiscount {
            discount,
            final_amount: (amount - discount).max(Decimal::ZERO),
        }
    }
}

/// Input for creating a promo code. A random code is generated when `code` is `None`.
#[derive(Debug, Clone)]
pub struct CreatePromoCode {
    pub code: Option<String>,
    pub promo_type: PromoCodeType,
    pub discount_percent: Option<i32>,
    pub discount_amount: Option<Decimal>,
    pub trial_days: Option<i32>,
    pub max_uses: Option<i32>,
    pub max_uses_per_user: i32,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub applicable_tiers: Option<Vec<SubscriptionTier>>,
    pub min_amount: Option<Decimal>,
    pub created_by_admin_id: Option<i64>,
    pub description: Option<String>,
}

impl Default for CreatePromoCode {
    fn default() -> Self {
        Self {
            code: None,
            promo_type: PromoCodeType::Percentage,
            discount_percent: None,
            discount_amount: None,
            trial_days: None,
            max_uses: None,
            max_uses_per_user: 1,
            valid_from: None,
            valid_until: None,
            applicable_tiers: None,
            min_amount: None,
            created_by_admin_id: None,
            description: None,
        }
    }
}

impl CreatePromoCode {
    /// Reject inputs whose type-dependent fields are missing or out of range.
    pub fn validate(&self) -> BillingResult<()> {
        match self.promo_type {
            PromoCodeType::Percentage => match self.discount_percent {
                Some(p) if (0..=100).contains(&p) => {}
                _ => {
                    return Err(BillingError::validation(
                        "Percentage promo codes need a discount between 0 and 100",
                    ))
                }
            },
            PromoCodeType::Fixed => match self.discount_amount {
                Some(a) if a > Decimal::ZERO => {}
                _ => {
                    return Err(BillingError::validation(
                        "Fixed promo codes need a positive discount amount",
                    ))
                }
            },
            PromoCodeType::Trial => match self.trial_days {
                Some(d) if d > 0 => {}
                _ => {
                    return Err(BillingError::validation(
                        "Trial promo codes need a positive number of days",
                    ))
                }
            },
            PromoCodeType::Upgrade => {}
        }
        if matches!(self.max_uses, Some(m) if m < 0) {
            return Err(BillingError::validation("max_uses cannot be negative"));
        }
        if self.max_uses_per_user < 1 {
            return Err(BillingError::validation("max_uses_per_user must be at least 1"));
        }
        Ok(())
    }
}

/// Upper-case, trim and check the promo code format.
pub fn normalize_code(raw: &str) -> BillingResult<String> {
    let code = raw.trim().to_uppercase();
    if code.len() < MIN_CODE_LENGTH || code.len() > MAX_CODE_LENGTH {
        return Err(BillingError::validation(format!(
            "Promo code must be between {} and {} characters",
            MIN_CODE_LENGTH, MAX_CODE_LENGTH
        )));
    }
    if !code
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(BillingError::validation(
            "Promo code may contain only letters, digits and hyphens",
        ));
    }
    Ok(code)
}

pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..GENERATED_CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}
