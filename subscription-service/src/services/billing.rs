//! Billing facade consumed by the bot-dispatch layer and the webhook adapter.
//!
//! Every public call is exactly one unit of work: it either commits as a
//! whole or leaves no trace.

use crate::error::{BillingError, BillingResult};
use crate::models::{
    AppliedDiscount, CreatePayment, CreatePromoCode, CreateSubscription, CreateUser, Entitlement,
    Payment, PaymentMethod, PaymentProvider, PaymentStatus, PaymentStatusUpdate, PromoCode,
    PromoCodeType, PromoValidation, RevenueStatistics, SavePaymentMethod, Subscription,
    SubscriptionPlan, SubscriptionTier, User,
};
use crate::repositories::{
    Page, Pagination, SubscriptionRepository, UserRepository, PROMO_CODE_METADATA_KEY,
};
use crate::services::database::Database;
use crate::services::metrics::record_error;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

/// A purchase initiated by the user, optionally with a promo code.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub user_id: i64,
    pub amount: Decimal,
    pub provider: PaymentProvider,
    pub tier: SubscriptionTier,
    pub period_days: i32,
    pub currency: Option<String>,
    pub payment_method_id: Option<i64>,
    pub promo_code: Option<String>,
}

/// A provider webhook, already authenticated and parsed by the adapter.
#[derive(Debug, Clone)]
pub struct PaymentNotification {
    pub provider: PaymentProvider,
    pub provider_payment_id: String,
    /// Our payment uuid echoed back by the provider, used when the provider
    /// id has not been recorded yet.
    pub payment_uuid: Option<Uuid>,
    pub status: PaymentStatus,
    pub provider_order_id: Option<String>,
    pub error_message: Option<String>,
    pub receipt_url: Option<String>,
}

/// Outcome of redeeming a promo code outside of a payment.
#[derive(Debug, Clone, Serialize)]
pub struct PromoRedemption {
    pub discount: AppliedDiscount,
    /// Trial subscription granted by a trial code.
    pub trial: Option<Subscription>,
}

#[derive(Clone)]
pub struct BillingService {
    db: Arc<Database>,
}

impl BillingService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Return the user with this telegram id, registering it on first contact.
    #[instrument(skip(self, input), fields(telegram_id = input.telegram_id))]
    pub async fn register_user(&self, input: CreateUser) -> BillingResult<User> {
        let result = self
            .db
            .unit_of_work("register_user", |uow| {
                Box::pin(async move {
                    if let Some(user) = uow.users().get_by_telegram_id(input.telegram_id).await? {
                        return Ok(user);
                    }
                    uow.users().create_user(input).await
                })
            })
            .await;
        observe("register_user", result)
    }

    /// Create a pending payment. A promo code is validated and redeemed in
    /// the same transaction; the payment then carries the discounted amount
    /// and the code id in its metadata.
    #[instrument(skip(self, request), fields(user_id = request.user_id, tier = %request.tier))]
    pub async fn create_payment(&self, request: PaymentRequest) -> BillingResult<Payment> {
        let result = self
            .db
            .unit_of_work("create_payment", |uow| {
                Box::pin(async move {
                    let repo = uow.subscriptions();
                    let mut amount = request.amount;
                    let mut metadata = None;
                    let mut redeemed = None;

                    if let Some(code) = request.promo_code.as_deref() {
                        // Per-user uses are counted under the user's row lock.
                        uow.users().lock_for_update(request.user_id).await?;
                        let promo = match repo
                            .validate_promo_code(code, request.user_id, request.tier, amount)
                            .await?
                        {
                            PromoValidation::Valid(promo) => promo,
                            PromoValidation::Invalid(rejection) => {
                                return Err(BillingError::validation(rejection.to_string()));
                            }
                        };

                        let applied = repo.apply_promo_code(promo.id, amount).await?;
                        if applied.final_amount <= Decimal::ZERO {
                            return Err(BillingError::validation(
                                "Promo code covers the full price; redeem it instead of paying",
                            ));
                        }

                        metadata = Some(promo_metadata(promo.id, amount, &applied));
                        amount = applied.final_amount;
                        redeemed = Some(promo.id);
                    }

                    let payment = repo
                        .create_payment(CreatePayment {
                            user_id: request.user_id,
                            amount,
                            provider: request.provider,
                            subscription_tier: request.tier,
                            subscription_period_days: request.period_days,
                            currency: request.currency,
                            payment_method_id: request.payment_method_id,
                            metadata,
                        })
                        .await?;

                    if let Some(promo_code_id) = redeemed {
                        repo.record_promo_redemption(
                            promo_code_id,
                            request.user_id,
                            Some(payment.id),
                        )
                        .await?;
                    }

                    Ok(payment)
                })
            })
            .await;
        observe("create_payment", result)
    }

    /// Grant a subscription directly, without a payment (admin grants, trials).
    pub async fn activate_subscription(
        &self,
        input: CreateSubscription,
    ) -> BillingResult<Subscription> {
        let result = self
            .db
            .unit_of_work("activate_subscription", |uow| {
                Box::pin(async move { uow.subscriptions().create_subscription(input).await })
            })
            .await;
        observe("activate_subscription", result)
    }

    pub async fn extend_subscription(
        &self,
        subscription_id: i64,
        additional_days: i32,
    ) -> BillingResult<Subscription> {
        let result = self
            .db
            .unit_of_work("extend_subscription", |uow| {
                Box::pin(async move {
                    uow.subscriptions()
                        .extend_subscription(subscription_id, additional_days, None)
                        .await
                })
            })
            .await;
        observe("extend_subscription", result)
    }

    pub async fn cancel_subscription(
        &self,
        subscription_id: i64,
        immediate: bool,
        reason: Option<String>,
    ) -> BillingResult<Subscription> {
        let result = self
            .db
            .unit_of_work("cancel_subscription", |uow| {
                Box::pin(async move {
                    uow.subscriptions()
                        .cancel_subscription(subscription_id, immediate, reason)
                        .await
                })
            })
            .await;
        observe("cancel_subscription", result)
    }

    pub async fn toggle_auto_renewal(
        &self,
        subscription_id: i64,
        enable: bool,
    ) -> BillingResult<Subscription> {
        let result = self
            .db
            .unit_of_work("toggle_auto_renewal", |uow| {
                Box::pin(async move {
                    uow.subscriptions()
                        .toggle_auto_renewal(subscription_id, enable)
                        .await
                })
            })
            .await;
        observe("toggle_auto_renewal", result)
    }

    /// Check a code without redeeming it. Returns `(true, None)` or
    /// `(false, Some(reason))`.
    pub async fn validate_promo_code(
        &self,
        code: &str,
        user_id: i64,
        tier: SubscriptionTier,
        amount: Decimal,
    ) -> BillingResult<(bool, Option<String>)> {
        let code = code.to_string();
        let result = self
            .db
            .unit_of_work("validate_promo_code", |uow| {
                Box::pin(async move {
                    let verdict = uow
                        .subscriptions()
                        .validate_promo_code(&code, user_id, tier, amount)
                        .await?;
                    Ok(verdict.into_tuple())
                })
            })
            .await;
        observe("validate_promo_code", result)
    }

    /// Validate and redeem a code in one transaction. A trial code also
    /// grants its trial subscription.
    #[instrument(skip(self, code), fields(user_id = user_id, tier = %tier))]
    pub async fn redeem_promo_code(
        &self,
        code: &str,
        user_id: i64,
        tier: SubscriptionTier,
        amount: Decimal,
    ) -> BillingResult<PromoRedemption> {
        let code = code.to_string();
        let result = self
            .db
            .unit_of_work("redeem_promo_code", |uow| {
                Box::pin(async move {
                    uow.users().lock_for_update(user_id).await?;
                    let repo = uow.subscriptions();
                    let promo = match repo
                        .validate_promo_code(&code, user_id, tier, amount)
                        .await?
                    {
                        PromoValidation::Valid(promo) => promo,
                        PromoValidation::Invalid(rejection) => {
                            return Err(BillingError::validation(rejection.to_string()));
                        }
                    };

                    let discount = repo.apply_promo_code(promo.id, amount).await?;
                    repo.record_promo_redemption(promo.id, user_id, None).await?;

                    let trial = match (promo.promo_type, promo.trial_days) {
                        (PromoCodeType::Trial, Some(days)) if days > 0 => Some(
                            repo.create_subscription(CreateSubscription {
                                user_id,
                                tier,
                                period_days: days,
                                payment_id: None,
                                promo_code_id: Some(promo.id),
                                is_trial: true,
                                is_auto_renew: false,
                            })
                            .await?,
                        ),
                        _ => None,
                    };

                    Ok(PromoRedemption { discount, trial })
                })
            })
            .await;
        observe("redeem_promo_code", result)
    }

    /// Admin: create a promo code, generating one when no code is given.
    pub async fn create_promo_code(
        &self,
        input: CreatePromoCode,
    ) -> BillingResult<PromoCode> {
        let result = self
            .db
            .unit_of_work("create_promo_code", |uow| {
                Box::pin(async move { uow.subscriptions().create_promo_code(input).await })
            })
            .await;
        observe("create_promo_code", result)
    }

    /// Webhook entry point. Looks the payment up by its provider id (or by
    /// our uuid on the first notification) and applies the status, settling
    /// the subscription on success. Everything happens in one transaction.
    #[instrument(
        skip(self, notification),
        fields(
            provider = %notification.provider,
            provider_payment_id = %notification.provider_payment_id,
            status = %notification.status
        )
    )]
    pub async fn process_payment_notification(
        &self,
        notification: PaymentNotification,
    ) -> BillingResult<Payment> {
        let result = self
            .db
            .unit_of_work("process_payment_notification", |uow| {
                Box::pin(async move {
                    let repo = uow.subscriptions();
                    let mut payment = repo
                        .get_payment_by_provider_id(
                            notification.provider,
                            &notification.provider_payment_id,
                        )
                        .await?;

                    if payment.is_none() {
                        if let Some(uuid) = notification.payment_uuid {
                            payment = repo
                                .get_payment_by_uuid(uuid)
                                .await?
                                .filter(|p| p.provider == notification.provider);
                        }
                    }

                    let payment = payment.ok_or_else(|| {
                        BillingError::not_found("Payment", &notification.provider_payment_id)
                    })?;

                    repo.update_payment_status(
                        payment.id,
                        notification.status,
                        PaymentStatusUpdate {
                            provider_payment_id: Some(notification.provider_payment_id),
                            provider_order_id: notification.provider_order_id,
                            error_message: notification.error_message,
                            receipt_url: notification.receipt_url,
                        },
                    )
                    .await
                })
            })
            .await;
        observe("process_payment_notification", result)
    }

    /// Apply a status to a payment known by id.
    pub async fn update_payment_status(
        &self,
        payment_id: i64,
        status: PaymentStatus,
        update: PaymentStatusUpdate,
    ) -> BillingResult<Payment> {
        let result = self
            .db
            .unit_of_work("update_payment_status", |uow| {
                Box::pin(async move {
                    uow.subscriptions()
                        .update_payment_status(payment_id, status, update)
                        .await
                })
            })
            .await;
        observe("update_payment_status", result)
    }

    pub async fn refund_payment(
        &self,
        payment_id: i64,
        reason: Option<String>,
        revoke_access: bool,
    ) -> BillingResult<Payment> {
        let result = self
            .db
            .unit_of_work("refund_payment", |uow| {
                Box::pin(async move {
                    uow.subscriptions()
                        .refund_payment(payment_id, reason, revoke_access)
                        .await
                })
            })
            .await;
        observe("refund_payment", result)
    }

    pub async fn user_payments(
        &self,
        user_id: i64,
        status: Option<PaymentStatus>,
        pagination: Pagination,
    ) -> BillingResult<Page<Payment>> {
        let result = self
            .db
            .unit_of_work("user_payments", |uow| {
                Box::pin(async move {
                    uow.subscriptions()
                        .get_user_payments(user_id, status, pagination)
                        .await
                })
            })
            .await;
        observe("user_payments", result)
    }

    pub async fn save_payment_method(
        &self,
        input: SavePaymentMethod,
    ) -> BillingResult<PaymentMethod> {
        let result = self
            .db
            .unit_of_work("save_payment_method", |uow| {
                Box::pin(async move { uow.subscriptions().save_payment_method(input).await })
            })
            .await;
        observe("save_payment_method", result)
    }

    pub async fn subscription_plans(&self) -> BillingResult<Vec<SubscriptionPlan>> {
        let result = self
            .db
            .unit_of_work("subscription_plans", |uow| {
                Box::pin(async move { uow.subscriptions().get_subscription_plans(true).await })
            })
            .await;
        observe("subscription_plans", result)
    }

    /// What the user may access right now. The daily allowance comes from
    /// the tier's plan, or the tier default when no plan is configured.
    pub async fn entitlement(&self, user_id: i64) -> BillingResult<Entitlement> {
        let result = self
            .db
            .unit_of_work("entitlement", |uow| {
                Box::pin(async move {
                    let user = uow
                        .users()
                        .get_by_id(user_id)
                        .await?
                        .ok_or_else(|| BillingError::not_found("User", user_id))?;

                    let now = Utc::now();
                    let tier = user.effective_tier(now);
                    let daily_readings_limit = uow
                        .subscriptions()
                        .get_plan_by_tier(tier)
                        .await?
                        .filter(|plan| plan.is_active)
                        .and_then(|plan| u32::try_from(plan.daily_readings_limit).ok())
                        .unwrap_or_else(|| tier.default_daily_readings_limit());

                    Ok(Entitlement {
                        user_id,
                        tier,
                        expires_at: user.subscription_expires_at.filter(|_| tier.is_paid()),
                        daily_readings_limit,
                    })
                })
            })
            .await;
        observe("entitlement", result)
    }

    pub async fn revenue_statistics(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> BillingResult<RevenueStatistics> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return observe(
                    "revenue_statistics",
                    Err(BillingError::validation("Period start must not be after its end")),
                );
            }
        }
        let result = self
            .db
            .unit_of_work("revenue_statistics", |uow| {
                Box::pin(async move {
                    uow.subscriptions()
                        .get_revenue_statistics(start, end)
                        .await
                })
            })
            .await;
        observe("revenue_statistics", result)
    }

    /// Subscriptions ending within `days_ahead` days (configured default when `None`).
    pub async fn expiring_soon(&self, days_ahead: Option<i64>) -> BillingResult<Vec<Subscription>> {
        let days_ahead = days_ahead.unwrap_or(self.db.settings().expiring_days_ahead);
        let result = self
            .db
            .unit_of_work("expiring_soon", |uow| {
                Box::pin(async move { uow.subscriptions().get_expiring_soon(days_ahead).await })
            })
            .await;
        observe("expiring_soon", result)
    }

    pub async fn subscriptions_for_renewal(&self) -> BillingResult<Vec<Subscription>> {
        let result = self
            .db
            .unit_of_work("subscriptions_for_renewal", |uow| {
                Box::pin(async move { uow.subscriptions().get_subscriptions_for_renewal().await })
            })
            .await;
        observe("subscriptions_for_renewal", result)
    }
}

fn promo_metadata(promo_code_id: i64, original_amount: Decimal, applied: &AppliedDiscount) -> Value {
    let mut map = Map::new();
    map.insert(PROMO_CODE_METADATA_KEY.to_string(), json!(promo_code_id));
    map.insert("original_amount".to_string(), json!(original_amount.to_string()));
    map.insert("discount".to_string(), json!(applied.discount.to_string()));
    Value::Object(map)
}

/// Count and log a failed operation. Domain failures are expected traffic;
/// storage failures are errors.
fn observe<T>(operation: &'static str, result: BillingResult<T>) -> BillingResult<T> {
    if let Err(e) = &result {
        record_error(e.kind(), operation);
        if e.is_retryable() {
            error!(operation = operation, error = %e, "Billing operation failed");
        } else {
            warn!(operation = operation, error = %e, "Billing operation rejected");
        }
    } else {
        debug!(operation = operation, "Billing operation completed");
    }
    result
}
