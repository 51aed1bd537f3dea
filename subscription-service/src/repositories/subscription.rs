//! Subscription and payment repository.
//!
//! Owns the billing invariants:
//!
//! - at most one active (not cancelled, unexpired) subscription per user;
//! - a succeeded payment never changes status again except through a refund;
//! - promo code usage never exceeds `max_uses`, nor `max_uses_per_user`
//!   for any one user;
//! - at most one default payment method per user;
//! - the user's cached tier and expiry are recomputed on every subscription write.

use super::base::BaseRepository;
use super::query::{
    Fields, Filter, FilterNode, FilterOperator, Page, Pagination, QueryOptions, SortBy, SqlValue,
};
use super::user::{PgUserRepository, UserRepository};
use crate::error::{read_error, BillingError, BillingResult};
use crate::models::{
    add_period, generate_code, normalize_code, AppliedDiscount, CreatePayment, CreatePromoCode,
    CreateSubscription, Payment, PaymentMethod, PaymentProvider, PaymentStatus,
    PaymentStatusUpdate, PromoCode, PromoRejection, PromoValidation, RevenueStatistics,
    SavePaymentMethod, Subscription, SubscriptionPlan, SubscriptionTier, TierRevenue,
    MAX_PERIOD_DAYS,
};
use crate::services::metrics::{
    record_operation, record_payment_status, record_promo_result, start_query_timer,
};
use crate::uow::Session;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Metadata key linking a payment to the promo code applied to it.
pub const PROMO_CODE_METADATA_KEY: &str = "promo_code_id";

const CANCELLED_BY_USER: &str = "Cancelled by user";

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    // Subscriptions

    async fn get_user_active_subscription(
        &self,
        user_id: i64,
    ) -> BillingResult<Option<Subscription>>;

    /// Create a subscription, cancelling the user's current active one first.
    async fn create_subscription(&self, input: CreateSubscription) -> BillingResult<Subscription>;

    async fn extend_subscription(
        &self,
        subscription_id: i64,
        additional_days: i32,
        payment_id: Option<i64>,
    ) -> BillingResult<Subscription>;

    async fn cancel_subscription(
        &self,
        subscription_id: i64,
        immediate: bool,
        reason: Option<String>,
    ) -> BillingResult<Subscription>;

    async fn toggle_auto_renewal(
        &self,
        subscription_id: i64,
        enable: bool,
    ) -> BillingResult<Subscription>;

    /// Active, non-renewing subscriptions that expire within `days_ahead` days.
    async fn get_expiring_soon(&self, days_ahead: i64) -> BillingResult<Vec<Subscription>>;

    /// Auto-renewing subscriptions whose next payment is due.
    async fn get_subscriptions_for_renewal(&self) -> BillingResult<Vec<Subscription>>;

    // Payments

    async fn create_payment(&self, input: CreatePayment) -> BillingResult<Payment>;

    async fn get_payment_by_uuid(&self, uuid: Uuid) -> BillingResult<Option<Payment>>;

    async fn get_payment_by_provider_id(
        &self,
        provider: PaymentProvider,
        provider_payment_id: &str,
    ) -> BillingResult<Option<Payment>>;

    /// Apply a provider-reported status. A succeeded payment settles the
    /// subscription it pays for in the same transaction.
    async fn update_payment_status(
        &self,
        payment_id: i64,
        status: PaymentStatus,
        update: PaymentStatusUpdate,
    ) -> BillingResult<Payment>;

    /// Administrative `Succeeded -> Refunded`. With `revoke_access` the
    /// subscription funded by the payment is cancelled immediately.
    async fn refund_payment(
        &self,
        payment_id: i64,
        reason: Option<String>,
        revoke_access: bool,
    ) -> BillingResult<Payment>;

    async fn get_user_payments(
        &self,
        user_id: i64,
        status: Option<PaymentStatus>,
        pagination: Pagination,
    ) -> BillingResult<Page<Payment>>;

    // Promo codes

    async fn get_promo_code(&self, code: &str) -> BillingResult<Option<PromoCode>>;

    async fn create_promo_code(&self, input: CreatePromoCode) -> BillingResult<PromoCode>;

    async fn validate_promo_code(
        &self,
        code: &str,
        user_id: i64,
        tier: SubscriptionTier,
        amount: Decimal,
    ) -> BillingResult<PromoValidation>;

    /// Uses of the code the user currently holds, trial grants included.
    async fn count_user_promo_uses(&self, user_id: i64, promo_code_id: i64) -> BillingResult<i64>;

    /// Record that `user_id` used the code, optionally through `payment_id`.
    /// Pair every successful `apply_promo_code` with one of these.
    async fn record_promo_redemption(
        &self,
        promo_code_id: i64,
        user_id: i64,
        payment_id: Option<i64>,
    ) -> BillingResult<()>;

    /// Compute the discount and count one use. Fails with a validation error
    /// when the code is already exhausted.
    async fn apply_promo_code(
        &self,
        promo_code_id: i64,
        amount: Decimal,
    ) -> BillingResult<AppliedDiscount>;

    // Payment methods

    async fn save_payment_method(&self, input: SavePaymentMethod) -> BillingResult<PaymentMethod>;

    async fn get_user_payment_methods(
        &self,
        user_id: i64,
        active_only: bool,
    ) -> BillingResult<Vec<PaymentMethod>>;

    async fn deactivate_payment_method(&self, method_id: i64) -> BillingResult<PaymentMethod>;

    // Plans and reporting

    async fn get_subscription_plans(&self, active_only: bool)
        -> BillingResult<Vec<SubscriptionPlan>>;

    async fn get_plan_by_tier(&self, tier: SubscriptionTier)
        -> BillingResult<Option<SubscriptionPlan>>;

    async fn get_revenue_statistics(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> BillingResult<RevenueStatistics>;
}

#[derive(Clone)]
pub struct PgSubscriptionRepository {
    subscriptions: BaseRepository<Subscription>,
    payments: BaseRepository<Payment>,
    promo_codes: BaseRepository<PromoCode>,
    payment_methods: BaseRepository<PaymentMethod>,
    plans: BaseRepository<SubscriptionPlan>,
    users: PgUserRepository,
    default_currency: String,
}

impl PgSubscriptionRepository {
    pub fn new(session: Arc<Session>, users: PgUserRepository, default_currency: &str) -> Self {
        Self {
            subscriptions: BaseRepository::new(Arc::clone(&session)),
            payments: BaseRepository::new(Arc::clone(&session)),
            promo_codes: BaseRepository::new(Arc::clone(&session)),
            payment_methods: BaseRepository::new(Arc::clone(&session)),
            plans: BaseRepository::new(session),
            users,
            default_currency: default_currency.to_string(),
        }
    }

    pub fn subscriptions(&self) -> &BaseRepository<Subscription> {
        &self.subscriptions
    }

    pub fn payments(&self) -> &BaseRepository<Payment> {
        &self.payments
    }

    pub fn promo_codes(&self) -> &BaseRepository<PromoCode> {
        &self.promo_codes
    }

    pub fn payment_methods(&self) -> &BaseRepository<PaymentMethod> {
        &self.payment_methods
    }

    pub fn plans(&self) -> &BaseRepository<SubscriptionPlan> {
        &self.plans
    }

    pub fn default_currency(&self) -> &str {
        &self.default_currency
    }

    /// Extend the active subscription when it has the paid tier, otherwise
    /// replace it with a new one.
    async fn settle(&self, payment: &Payment) -> BillingResult<Subscription> {
        self.users.lock_for_update(payment.user_id).await?;

        let active = self.get_user_active_subscription(payment.user_id).await?;
        match active {
            Some(current) if current.tier == payment.subscription_tier => {
                self.extend_subscription(
                    current.id,
                    payment.subscription_period_days,
                    Some(payment.id),
                )
                .await
            }
            _ => {
                self.create_subscription(CreateSubscription {
                    user_id: payment.user_id,
                    tier: payment.subscription_tier,
                    period_days: payment.subscription_period_days,
                    payment_id: Some(payment.id),
                    promo_code_id: promo_code_of(payment),
                    is_trial: false,
                    is_auto_renew: payment.funds_auto_renewal(),
                })
                .await
            }
        }
    }

    async fn load_payment_for_update(&self, payment_id: i64) -> BillingResult<Payment> {
        self.payments
            .get_for_update(payment_id)
            .await?
            .ok_or_else(|| BillingError::not_found("Payment", payment_id))
    }

    /// Lock the owner first, then the subscription, the same order settlement uses.
    async fn load_subscription_for_update(&self, subscription_id: i64) -> BillingResult<Subscription> {
        let subscription = self.subscriptions.get_by_id_or_fail(subscription_id).await?;
        self.users.lock_for_update(subscription.user_id).await?;
        self.subscriptions
            .get_for_update(subscription_id)
            .await?
            .ok_or_else(|| BillingError::not_found("Subscription", subscription_id))
    }

    async fn update_subscription(&self, id: i64, fields: Fields) -> BillingResult<Subscription> {
        self.subscriptions
            .update(id, fields)
            .await?
            .ok_or_else(|| BillingError::not_found("Subscription", id))
    }

    /// Give back the use held by a payment that will never settle.
    async fn release_promo_redemption(&self, promo_code_id: i64, payment_id: i64) -> BillingResult<()> {
        let released = self
            .promo_codes
            .execute_raw(
                "DELETE FROM promo_code_redemptions WHERE payment_id = $1",
                vec![payment_id.into()],
            )
            .await?;
        if released == 0 {
            return Ok(());
        }

        self.promo_codes
            .execute_raw(
                "UPDATE promo_codes SET used_count = used_count - 1 \
                 WHERE id = $1 AND used_count > 0",
                vec![promo_code_id.into()],
            )
            .await?;

        record_promo_result("released");
        info!(promo_code_id = promo_code_id, "Promo code use released");
        Ok(())
    }
}

fn promo_code_of(payment: &Payment) -> Option<i64> {
    payment
        .metadata
        .as_ref()
        .and_then(|m| m.get(PROMO_CODE_METADATA_KEY))
        .and_then(|v| v.as_i64())
}

fn normalize_currency(currency: &str) -> BillingResult<String> {
    let currency = currency.trim().to_uppercase();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(BillingError::validation(format!(
            "Invalid currency code '{}'",
            currency
        )));
    }
    Ok(currency)
}

/// Fields written on a status change, before settlement.
fn status_change_fields(
    status: PaymentStatus,
    update: &PaymentStatusUpdate,
    now: DateTime<Utc>,
) -> Fields {
    let mut fields = Fields::new().set("status", status);
    if let Some(id) = &update.provider_payment_id {
        fields = fields.set("provider_payment_id", id.as_str());
    }
    if let Some(id) = &update.provider_order_id {
        fields = fields.set("provider_order_id", id.as_str());
    }
    if let Some(url) = &update.receipt_url {
        fields = fields.set("receipt_url", url.as_str());
    }
    match status {
        PaymentStatus::Succeeded => fields.set("paid_at", now),
        PaymentStatus::Failed => fields.set("failed_at", now).set(
            "error_message",
            update
                .error_message
                .clone()
                .unwrap_or_else(|| "Payment failed".to_string()),
        ),
        PaymentStatus::Cancelled => fields.set(
            "error_message",
            update
                .error_message
                .clone()
                .unwrap_or_else(|| CANCELLED_BY_USER.to_string()),
        ),
        _ => fields,
    }
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    async fn get_user_active_subscription(
        &self,
        user_id: i64,
    ) -> BillingResult<Option<Subscription>> {
        let options = QueryOptions::new()
            .filter(Filter::eq("user_id", user_id))
            .filter(Filter::eq("is_cancelled", false))
            .filter(Filter::new("expires_at", FilterOperator::Gt, Utc::now()))
            .sort(SortBy::desc("expires_at"))
            .limit(1);
        Ok(self.subscriptions.get_all(&options).await?.into_iter().next())
    }

    #[instrument(skip(self, input), fields(user_id = input.user_id, tier = %input.tier))]
    async fn create_subscription(&self, input: CreateSubscription) -> BillingResult<Subscription> {
        if input.period_days <= 0 {
            return Err(BillingError::validation("Subscription period must be positive"));
        }

        let now = Utc::now();
        let expires_at = input.expires_at(now)?;
        self.users.lock_for_update(input.user_id).await?;

        if let Some(existing) = self.get_user_active_subscription(input.user_id).await? {
            self.update_subscription(
                existing.id,
                Fields::new()
                    .set("is_cancelled", true)
                    .set("cancelled_at", now)
                    .set("is_auto_renew", false)
                    .set("next_payment_date", SqlValue::Null),
            )
            .await?;
            info!(
                subscription_id = existing.id,
                "Existing subscription cancelled in favour of a new one"
            );
        }

        let next_payment_date = input.is_auto_renew.then_some(expires_at);

        let subscription = self
            .subscriptions
            .create(
                Fields::new()
                    .set("user_id", input.user_id)
                    .set("tier", input.tier)
                    .set("started_at", now)
                    .set("expires_at", expires_at)
                    .set("is_auto_renew", input.is_auto_renew)
                    .set("next_payment_date", next_payment_date)
                    .set("payment_id", input.payment_id)
                    .set("promo_code_id", input.promo_code_id)
                    .set("is_trial", input.is_trial),
            )
            .await?;

        self.users
            .sync_subscription_cache(input.user_id, now)
            .await?;

        record_operation("create");
        info!(
            subscription_id = subscription.id,
            period_days = input.period_days,
            expires_at = %subscription.expires_at,
            "Subscription created"
        );

        Ok(subscription)
    }

    #[instrument(skip(self), fields(subscription_id = subscription_id))]
    async fn extend_subscription(
        &self,
        subscription_id: i64,
        additional_days: i32,
        payment_id: Option<i64>,
    ) -> BillingResult<Subscription> {
        if additional_days <= 0 {
            return Err(BillingError::validation("Extension period must be positive"));
        }

        let subscription = self.load_subscription_for_update(subscription_id).await?;
        if subscription.is_cancelled {
            return Err(BillingError::invalid_transition(
                "cancelled",
                "Cancelled subscriptions cannot be extended",
            ));
        }

        let now = Utc::now();
        let base = subscription.expires_at.max(now);
        let expires_at = add_period(base, i64::from(additional_days))?;

        let mut fields = Fields::new().set("expires_at", expires_at);
        if subscription.is_auto_renew {
            fields = fields.set("next_payment_date", expires_at);
        }
        if let Some(payment_id) = payment_id {
            fields = fields.set("payment_id", payment_id);
        }

        let extended = self.update_subscription(subscription_id, fields).await?;
        self.users
            .sync_subscription_cache(subscription.user_id, now)
            .await?;

        record_operation("extend");
        info!(
            additional_days = additional_days,
            expires_at = %extended.expires_at,
            "Subscription extended"
        );

        Ok(extended)
    }

    #[instrument(skip(self, reason), fields(subscription_id = subscription_id, immediate = immediate))]
    async fn cancel_subscription(
        &self,
        subscription_id: i64,
        immediate: bool,
        reason: Option<String>,
    ) -> BillingResult<Subscription> {
        let subscription = self.load_subscription_for_update(subscription_id).await?;
        if subscription.is_cancelled {
            return Err(BillingError::invalid_transition(
                "cancelled",
                "Subscription is already cancelled",
            ));
        }

        let now = Utc::now();
        let mut fields = Fields::new()
            .set("is_cancelled", true)
            .set("cancelled_at", now)
            .set("is_auto_renew", false)
            .set("next_payment_date", SqlValue::Null);
        if immediate {
            fields = fields.set("expires_at", now.max(subscription.started_at));
        }

        let cancelled = self.update_subscription(subscription_id, fields).await?;
        self.users
            .sync_subscription_cache(subscription.user_id, now)
            .await?;

        record_operation(if immediate {
            "cancel_immediate"
        } else {
            "cancel"
        });
        info!(
            user_id = subscription.user_id,
            reason = reason.as_deref().unwrap_or("unspecified"),
            "Subscription cancelled"
        );

        Ok(cancelled)
    }

    #[instrument(skip(self), fields(subscription_id = subscription_id))]
    async fn toggle_auto_renewal(
        &self,
        subscription_id: i64,
        enable: bool,
    ) -> BillingResult<Subscription> {
        let subscription = self.subscriptions.get_by_id_or_fail(subscription_id).await?;
        if enable && !subscription.is_active(Utc::now()) {
            return Err(BillingError::invalid_transition(
                if subscription.is_cancelled {
                    "cancelled"
                } else {
                    "expired"
                },
                "Auto-renewal can only be enabled on an active subscription",
            ));
        }

        let next_payment_date = enable.then_some(subscription.expires_at);
        let updated = self
            .update_subscription(
                subscription_id,
                Fields::new()
                    .set("is_auto_renew", enable)
                    .set("next_payment_date", next_payment_date),
            )
            .await?;

        info!(enabled = enable, "Auto-renewal toggled");

        Ok(updated)
    }

    async fn get_expiring_soon(&self, days_ahead: i64) -> BillingResult<Vec<Subscription>> {
        if !(0..=MAX_PERIOD_DAYS).contains(&days_ahead) {
            return Err(BillingError::validation(format!(
                "days_ahead must be between 0 and {}",
                MAX_PERIOD_DAYS
            )));
        }
        let now = Utc::now();
        let until = if days_ahead == 0 {
            now
        } else {
            add_period(now, days_ahead)?
        };
        let options = QueryOptions::new()
            .filter(Filter::new(
                "expires_at",
                FilterOperator::Between,
                SqlValue::List(vec![now.into(), until.into()]),
            ))
            .filter(Filter::eq("is_cancelled", false))
            .filter(Filter::eq("is_auto_renew", false))
            .sort(SortBy::asc("expires_at"));
        self.subscriptions.get_all(&options).await
    }

    async fn get_subscriptions_for_renewal(&self) -> BillingResult<Vec<Subscription>> {
        let options = QueryOptions::new()
            .filter(Filter::eq("is_auto_renew", true))
            .filter(Filter::eq("is_cancelled", false))
            .filter(Filter::new(
                "next_payment_date",
                FilterOperator::Lte,
                Utc::now(),
            ))
            .sort(SortBy::asc("next_payment_date"));
        self.subscriptions.get_all(&options).await
    }

    #[instrument(skip(self, input), fields(user_id = input.user_id, provider = %input.provider))]
    async fn create_payment(&self, input: CreatePayment) -> BillingResult<Payment> {
        if input.amount <= Decimal::ZERO {
            return Err(BillingError::validation("Payment amount must be positive"));
        }
        if input.subscription_period_days <= 0
            || i64::from(input.subscription_period_days) > MAX_PERIOD_DAYS
        {
            return Err(BillingError::validation(format!(
                "Subscription period must be between 1 and {} days",
                MAX_PERIOD_DAYS
            )));
        }
        let currency = normalize_currency(
            input
                .currency
                .as_deref()
                .unwrap_or(&self.default_currency),
        )?;

        let payment = self
            .payments
            .create(
                Fields::new()
                    .set("uuid", Uuid::new_v4())
                    .set("user_id", input.user_id)
                    .set("amount", input.amount)
                    .set("currency", currency)
                    .set("status", PaymentStatus::Pending)
                    .set("provider", input.provider)
                    .set("subscription_tier", input.subscription_tier)
                    .set("subscription_period_days", input.subscription_period_days)
                    .set("payment_method_id", input.payment_method_id)
                    .set("metadata", input.metadata),
            )
            .await?;

        record_payment_status(PaymentStatus::Pending.as_str());
        info!(
            payment_id = payment.id,
            payment_uuid = %payment.uuid,
            amount = %payment.amount,
            "Payment created"
        );

        Ok(payment)
    }

    async fn get_payment_by_uuid(&self, uuid: Uuid) -> BillingResult<Option<Payment>> {
        self.payments.find_one(Fields::new().set("uuid", uuid)).await
    }

    async fn get_payment_by_provider_id(
        &self,
        provider: PaymentProvider,
        provider_payment_id: &str,
    ) -> BillingResult<Option<Payment>> {
        self.payments
            .find_one(
                Fields::new()
                    .set("provider", provider)
                    .set("provider_payment_id", provider_payment_id),
            )
            .await
    }

    #[instrument(skip(self, update), fields(payment_id = payment_id, status = %status))]
    async fn update_payment_status(
        &self,
        payment_id: i64,
        status: PaymentStatus,
        update: PaymentStatusUpdate,
    ) -> BillingResult<Payment> {
        // Row lock first: concurrent deliveries for this payment queue here and
        // see the committed status.
        let payment = self.load_payment_for_update(payment_id).await?;

        if payment.status == PaymentStatus::Succeeded {
            warn!("Status change rejected, payment already succeeded");
            return Err(BillingError::invalid_transition(
                payment.status,
                "Payment has already succeeded",
            ));
        }
        if !payment.status.can_transition_to(status) {
            return Err(BillingError::invalid_transition(
                payment.status,
                format!("Payment cannot move from {} to {}", payment.status, status),
            ));
        }

        let now = Utc::now();
        let updated = self
            .payments
            .update(payment_id, status_change_fields(status, &update, now))
            .await?
            .ok_or_else(|| BillingError::not_found("Payment", payment_id))?;

        if matches!(status, PaymentStatus::Failed | PaymentStatus::Cancelled) {
            if let Some(promo_code_id) = promo_code_of(&payment) {
                self.release_promo_redemption(promo_code_id, payment_id).await?;
            }
        }

        if status == PaymentStatus::Succeeded {
            let subscription = self.settle(&updated).await?;
            info!(
                subscription_id = subscription.id,
                expires_at = %subscription.expires_at,
                "Payment settled"
            );
        }

        record_payment_status(status.as_str());
        info!(previous = %payment.status, "Payment status updated");

        Ok(updated)
    }

    #[instrument(skip(self, reason), fields(payment_id = payment_id))]
    async fn refund_payment(
        &self,
        payment_id: i64,
        reason: Option<String>,
        revoke_access: bool,
    ) -> BillingResult<Payment> {
        let payment = self.load_payment_for_update(payment_id).await?;
        if payment.status != PaymentStatus::Succeeded {
            return Err(BillingError::invalid_transition(
                payment.status,
                "Only succeeded payments can be refunded",
            ));
        }

        let refunded = self
            .payments
            .update(
                payment_id,
                Fields::new()
                    .set("status", PaymentStatus::Refunded)
                    .set("error_message", reason.clone()),
            )
            .await?
            .ok_or_else(|| BillingError::not_found("Payment", payment_id))?;

        if revoke_access {
            let funded = self
                .subscriptions
                .find_one(
                    Fields::new()
                        .set("payment_id", payment_id)
                        .set("is_cancelled", false),
                )
                .await?;
            if let Some(subscription) = funded {
                self.cancel_subscription(subscription.id, true, reason)
                    .await?;
            }
        }

        record_payment_status(PaymentStatus::Refunded.as_str());
        info!(revoke_access = revoke_access, "Payment refunded");

        Ok(refunded)
    }

    async fn get_user_payments(
        &self,
        user_id: i64,
        status: Option<PaymentStatus>,
        pagination: Pagination,
    ) -> BillingResult<Page<Payment>> {
        let mut options = QueryOptions::new()
            .filter(Filter::eq("user_id", user_id))
            .sort(SortBy::desc("created_at"))
            .sort(SortBy::desc("id"));
        if let Some(status) = status {
            options = options.filter(Filter::eq("status", status));
        }
        self.payments.get_page(pagination, &options).await
    }

    async fn get_promo_code(&self, code: &str) -> BillingResult<Option<PromoCode>> {
        let code = code.trim().to_uppercase();
        self.promo_codes.find_one(Fields::new().set("code", code)).await
    }

    #[instrument(skip(self, input), fields(promo_type = %input.promo_type))]
    async fn create_promo_code(&self, input: CreatePromoCode) -> BillingResult<PromoCode> {
        input.validate()?;
        let code = match &input.code {
            Some(code) => normalize_code(code)?,
            None => generate_code(),
        };
        let applicable_tiers = input
            .applicable_tiers
            .map(|tiers| tiers.iter().map(|t| t.as_str().to_string()).collect::<Vec<_>>());

        let mut fields = Fields::new()
            .set("code", code)
            .set("promo_type", input.promo_type)
            .set("discount_percent", input.discount_percent)
            .set("discount_amount", input.discount_amount)
            .set("trial_days", input.trial_days)
            .set("max_uses", input.max_uses)
            .set("max_uses_per_user", input.max_uses_per_user)
            .set("valid_until", input.valid_until)
            .set("applicable_tiers", applicable_tiers)
            .set("min_amount", input.min_amount)
            .set("created_by_admin_id", input.created_by_admin_id)
            .set("description", input.description);
        if let Some(valid_from) = input.valid_from {
            fields = fields.set("valid_from", valid_from);
        }

        let promo = self.promo_codes.create(fields).await?;

        info!(promo_code_id = promo.id, code = %promo.code, "Promo code created");

        Ok(promo)
    }

    #[instrument(skip(self, code, amount), fields(user_id = user_id, tier = %tier))]
    async fn validate_promo_code(
        &self,
        code: &str,
        user_id: i64,
        tier: SubscriptionTier,
        amount: Decimal,
    ) -> BillingResult<PromoValidation> {
        let promo = match self.get_promo_code(code).await? {
            Some(promo) => promo,
            None => {
                record_promo_result(PromoRejection::NotFound.label());
                return Ok(PromoValidation::Invalid(PromoRejection::NotFound));
            }
        };

        let mut verdict = promo.check_availability(Utc::now());
        if verdict.is_ok() {
            let uses = self.count_user_promo_uses(user_id, promo.id).await?;
            verdict = promo.check_user_uses(uses);
        }
        if verdict.is_ok() {
            verdict = promo.check_purchase(tier, amount, &self.default_currency);
        }

        match verdict {
            Ok(()) => {
                record_promo_result("valid");
                Ok(PromoValidation::Valid(promo))
            }
            Err(rejection) => {
                record_promo_result(rejection.label());
                info!(code = %promo.code, reason = rejection.label(), "Promo code rejected");
                Ok(PromoValidation::Invalid(rejection))
            }
        }
    }

    async fn count_user_promo_uses(&self, user_id: i64, promo_code_id: i64) -> BillingResult<i64> {
        let timer = start_query_timer("count_user_promo_uses");
        let mut conn = self.payments.session().read().await?;
        let uses = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM promo_code_redemptions WHERE user_id = $1 AND promo_code_id = $2",
        )
        .bind(user_id)
        .bind(promo_code_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| read_error("count promo code uses", e))?;
        timer.observe_duration();
        Ok(uses)
    }

    async fn record_promo_redemption(
        &self,
        promo_code_id: i64,
        user_id: i64,
        payment_id: Option<i64>,
    ) -> BillingResult<()> {
        self.promo_codes
            .execute_raw(
                "INSERT INTO promo_code_redemptions (promo_code_id, user_id, payment_id) \
                 VALUES ($1, $2, $3)",
                vec![promo_code_id.into(), user_id.into(), payment_id.into()],
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self, amount), fields(promo_code_id = promo_code_id))]
    async fn apply_promo_code(
        &self,
        promo_code_id: i64,
        amount: Decimal,
    ) -> BillingResult<AppliedDiscount> {
        let promo = self.promo_codes.get_by_id_or_fail(promo_code_id).await?;
        let applied = promo.apply(amount);

        // The bound check and the increment are one statement, so concurrent
        // redemptions cannot oversell the code.
        let claimed = self
            .promo_codes
            .execute_raw(
                "UPDATE promo_codes SET used_count = used_count + 1 \
                 WHERE id = $1 AND (max_uses IS NULL OR used_count < max_uses)",
                vec![promo_code_id.into()],
            )
            .await?;
        if claimed == 0 {
            record_promo_result(PromoRejection::Exhausted.label());
            return Err(BillingError::validation(PromoRejection::Exhausted.to_string()));
        }

        record_promo_result("redeemed");
        info!(
            code = %promo.code,
            discount = %applied.discount,
            final_amount = %applied.final_amount,
            "Promo code applied"
        );

        Ok(applied)
    }

    #[instrument(skip(self, input), fields(user_id = input.user_id, provider = %input.provider))]
    async fn save_payment_method(&self, input: SavePaymentMethod) -> BillingResult<PaymentMethod> {
        let existing = self
            .payment_methods
            .find_one(
                Fields::new()
                    .set("user_id", input.user_id)
                    .set("provider", input.provider)
                    .set("provider_method_id", input.provider_method_id.as_str()),
            )
            .await?;

        if input.make_default {
            let mut siblings: Vec<FilterNode> = vec![
                Filter::eq("user_id", input.user_id).into(),
                Filter::eq("is_default", true).into(),
            ];
            if let Some(current) = &existing {
                siblings.push(Filter::new("id", FilterOperator::Ne, current.id).into());
            }
            self.payment_methods
                .update_many(&siblings, Fields::new().set("is_default", false))
                .await?;
        }

        let fields = Fields::new()
            .set("card_last4", input.card_last4)
            .set("card_brand", input.card_brand)
            .set("expires_at", input.expires_at)
            .set("is_active", true);

        let method = match existing {
            Some(current) => {
                let is_default = input.make_default || current.is_default;
                self.payment_methods
                    .update(current.id, fields.set("is_default", is_default))
                    .await?
                    .ok_or_else(|| BillingError::not_found("PaymentMethod", current.id))?
            }
            None => {
                self.payment_methods
                    .create(
                        fields
                            .set("user_id", input.user_id)
                            .set("provider", input.provider)
                            .set("provider_method_id", input.provider_method_id)
                            .set("is_default", input.make_default),
                    )
                    .await?
            }
        };

        info!(
            payment_method_id = method.id,
            is_default = method.is_default,
            "Payment method saved"
        );

        Ok(method)
    }

    async fn get_user_payment_methods(
        &self,
        user_id: i64,
        active_only: bool,
    ) -> BillingResult<Vec<PaymentMethod>> {
        let mut options = QueryOptions::new()
            .filter(Filter::eq("user_id", user_id))
            .sort(SortBy::desc("is_default"))
            .sort(SortBy::desc("created_at"));
        if active_only {
            options = options.filter(Filter::eq("is_active", true));
        }
        self.payment_methods.get_all(&options).await
    }

    #[instrument(skip(self), fields(payment_method_id = method_id))]
    async fn deactivate_payment_method(&self, method_id: i64) -> BillingResult<PaymentMethod> {
        let method = self
            .payment_methods
            .update(
                method_id,
                Fields::new()
                    .set("is_active", false)
                    .set("is_default", false),
            )
            .await?
            .ok_or_else(|| BillingError::not_found("PaymentMethod", method_id))?;

        info!(user_id = method.user_id, "Payment method deactivated");

        Ok(method)
    }

    async fn get_subscription_plans(
        &self,
        active_only: bool,
    ) -> BillingResult<Vec<SubscriptionPlan>> {
        let mut options = QueryOptions::new().sort(SortBy::asc("sort_order"));
        if active_only {
            options = options.filter(Filter::eq("is_active", true));
        }
        self.plans.get_all(&options).await
    }

    async fn get_plan_by_tier(
        &self,
        tier: SubscriptionTier,
    ) -> BillingResult<Option<SubscriptionPlan>> {
        self.plans.find_one(Fields::new().set("tier", tier)).await
    }

    #[instrument(skip(self))]
    async fn get_revenue_statistics(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> BillingResult<RevenueStatistics> {
        let timer = start_query_timer("revenue_statistics");

        let revenue_rows = {
            let mut conn = self.payments.session().read().await?;
            sqlx::query_as::<_, (SubscriptionTier, i64, Decimal)>(
                r#"
                SELECT subscription_tier, COUNT(id), COALESCE(SUM(amount), 0)
                FROM payments
                WHERE status = $1
                  AND ($2::timestamptz IS NULL OR paid_at >= $2)
                  AND ($3::timestamptz IS NULL OR paid_at <= $3)
                GROUP BY subscription_tier
                "#,
            )
            .bind(PaymentStatus::Succeeded.as_str())
            .bind(start)
            .bind(end)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| read_error("load revenue by tier", e))?
        };

        let active_rows = {
            let mut conn = self.subscriptions.session().read().await?;
            sqlx::query_as::<_, (SubscriptionTier, i64)>(
                r#"
                SELECT tier, COUNT(id)
                FROM subscriptions
                WHERE is_cancelled = FALSE AND expires_at > $1
                GROUP BY tier
                "#,
            )
            .bind(Utc::now())
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| read_error("count active subscriptions", e))?
        };

        timer.observe_duration();

        let mut by_tier = BTreeMap::new();
        let mut total_revenue = Decimal::ZERO;
        for (tier, count, amount) in revenue_rows {
            total_revenue += amount;
            by_tier.insert(tier, TierRevenue { count, amount });
        }

        Ok(RevenueStatistics {
            total_revenue,
            by_tier,
            active_subscriptions: active_rows.into_iter().collect(),
            period_start: start,
            period_end: end,
        })
    }
}
