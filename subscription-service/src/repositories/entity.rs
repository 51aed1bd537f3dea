//! Table bindings for the domain models.

use crate::models::{Payment, PaymentMethod, PromoCode, Subscription, SubscriptionPlan, User};
use sqlx::postgres::PgRow;
use sqlx::FromRow;

/// A model persisted in one table with a `BIGSERIAL id` primary key.
pub trait Entity: for<'r> FromRow<'r, PgRow> + Send + Sync + Unpin + 'static {
    const TABLE: &'static str;
    /// Name used in errors and logs.
    const NAME: &'static str;
    /// Column whitelist, `id` first. Nothing outside it is ever rendered into SQL.
    const COLUMNS: &'static [&'static str];

    fn id(&self) -> i64;
}

impl Entity for User {
    const TABLE: &'static str = "users";
    const NAME: &'static str = "User";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "telegram_id",
        "username",
        "first_name",
        "language_code",
        "subscription_tier",
        "subscription_expires_at",
        "created_at",
        "updated_at",
    ];

    fn id(&self) -> i64 {
        self.id
    }
}

impl Entity for Subscription {
    const TABLE: &'static str = "subscriptions";
    const NAME: &'static str = "Subscription";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "user_id",
        "tier",
        "started_at",
        "expires_at",
        "is_auto_renew",
        "next_payment_date",
        "payment_id",
        "promo_code_id",
        "is_trial",
        "is_cancelled",
        "cancelled_at",
        "created_at",
        "updated_at",
    ];

    fn id(&self) -> i64 {
        self.id
    }
}

impl Entity for Payment {
    const TABLE: &'static str = "payments";
    const NAME: &'static str = "Payment";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "uuid",
        "user_id",
        "amount",
        "currency",
        "status",
        "provider",
        "provider_payment_id",
        "provider_order_id",
        "subscription_tier",
        "subscription_period_days",
        "payment_method_id",
        "paid_at",
        "failed_at",
        "error_message",
        "receipt_url",
        "metadata",
        "created_at",
        "updated_at",
    ];

    fn id(&self) -> i64 {
        self.id
    }
}

impl Entity for PromoCode {
    const TABLE: &'static str = "promo_codes";
    const NAME: &'static str = "PromoCode";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "code",
        "promo_type",
        "discount_percent",
        "discount_amount",
        "trial_days",
        "max_uses",
        "used_count",
        "max_uses_per_user",
        "valid_from",
        "valid_until",
        "applicable_tiers",
        "min_amount",
        "is_active",
        "created_by_admin_id",
        "description",
        "created_at",
        "updated_at",
    ];

    fn id(&self) -> i64 {
        self.id
    }
}

impl Entity for PaymentMethod {
    const TABLE: &'static str = "payment_methods";
    const NAME: &'static str = "PaymentMethod";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "user_id",
        "provider",
        "provider_method_id",
        "card_last4",
        "card_brand",
        "is_default",
        "is_active",
        "expires_at",
        "created_at",
        "updated_at",
    ];

    fn id(&self) -> i64 {
        self.id
    }
}

impl Entity for SubscriptionPlan {
    const TABLE: &'static str = "subscription_plans";
    const NAME: &'static str = "SubscriptionPlan";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "tier",
        "name",
        "description",
        "monthly_price",
        "yearly_price",
        "daily_readings_limit",
        "monthly_readings_limit",
        "is_active",
        "sort_order",
        "created_at",
        "updated_at",
    ];

    fn id(&self) -> i64 {
        self.id
    }
}

/// Comma-separated column list for `SELECT` / `RETURNING`.
pub(crate) fn column_list<E: Entity>() -> String {
    E::COLUMNS.join(", ")
}
