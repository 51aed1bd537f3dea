//! Subscription lifecycle integration tests for subscription-service.

mod common;

use chrono::{Duration, Utc};
use common::{assert_close, TestApp};
use rust_decimal::Decimal;
use subscription_service::models::{
    CreateSubscription, PaymentProvider, SavePaymentMethod, SubscriptionTier,
};
use subscription_service::repositories::{Fields, SubscriptionRepository};
use subscription_service::BillingError;

fn grant(user_id: i64, tier: SubscriptionTier, period_days: i32) -> CreateSubscription {
    CreateSubscription {
        user_id,
        tier,
        period_days,
        payment_id: None,
        promo_code_id: None,
        is_trial: false,
        is_auto_renew: false,
    }
}

#[tokio::test]
async fn immediate_cancel_expires_now_and_resets_cache() {
    let app = TestApp::spawn().await;
    let user = app.create_user(31).await;

    let subscription = app
        .billing
        .activate_subscription(grant(user.id, SubscriptionTier::Premium, 30))
        .await
        .unwrap();
    assert_eq!(
        app.reload_user(user.id).await.subscription_tier,
        SubscriptionTier::Premium
    );

    let cancelled = app
        .billing
        .cancel_subscription(subscription.id, true, Some("user request".to_string()))
        .await
        .unwrap();

    assert!(cancelled.is_cancelled);
    assert!(cancelled.cancelled_at.is_some());
    assert_close(cancelled.expires_at, Utc::now());

    let user = app.reload_user(user.id).await;
    assert_eq!(user.subscription_tier, SubscriptionTier::Free);
    assert!(user.subscription_expires_at.is_none());

    let err = app
        .billing
        .cancel_subscription(subscription.id, false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidStateTransition { .. }));

    app.cleanup().await;
}

#[tokio::test]
async fn deferred_cancel_keeps_expiry() {
    let app = TestApp::spawn().await;
    let user = app.create_user(32).await;

    let subscription = app
        .billing
        .activate_subscription(grant(user.id, SubscriptionTier::Basic, 30))
        .await
        .unwrap();
    let cancelled = app
        .billing
        .cancel_subscription(subscription.id, false, None)
        .await
        .unwrap();

    assert!(cancelled.is_cancelled);
    assert_eq!(cancelled.expires_at, subscription.expires_at);

    let err = app
        .billing
        .extend_subscription(subscription.id, 30)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidStateTransition { .. }));

    app.cleanup().await;
}

#[tokio::test]
async fn new_grant_supersedes_active_subscription() {
    let app = TestApp::spawn().await;
    let user = app.create_user(33).await;

    let first = app
        .billing
        .activate_subscription(grant(user.id, SubscriptionTier::Basic, 30))
        .await
        .unwrap();
    let second = app
        .billing
        .activate_subscription(grant(user.id, SubscriptionTier::Premium, 7))
        .await
        .unwrap();

    let uow = app.db.begin().await.unwrap();
    let repo = uow.subscriptions();
    let first = repo.subscriptions().get_by_id_or_fail(first.id).await.unwrap();
    let active = repo
        .get_user_active_subscription(user.id)
        .await
        .unwrap()
        .unwrap();
    uow.rollback().await.unwrap();

    assert!(first.is_cancelled);
    assert_eq!(active.id, second.id);

    let user = app.reload_user(user.id).await;
    assert_eq!(user.subscription_tier, SubscriptionTier::Premium);
    assert_eq!(user.subscription_expires_at, Some(second.expires_at));

    app.cleanup().await;
}

#[tokio::test]
async fn auto_renewal_drives_renewal_and_expiry_reports() {
    let app = TestApp::spawn().await;
    let renewing = app.create_user(34).await;
    let lapsing = app.create_user(35).await;

    let renewing_sub = app
        .billing
        .activate_subscription(grant(renewing.id, SubscriptionTier::Basic, 2))
        .await
        .unwrap();
    let lapsing_sub = app
        .billing
        .activate_subscription(grant(lapsing.id, SubscriptionTier::Basic, 2))
        .await
        .unwrap();

    let toggled = app
        .billing
        .toggle_auto_renewal(renewing_sub.id, true)
        .await
        .unwrap();
    assert!(toggled.is_auto_renew);
    assert_eq!(toggled.next_payment_date, Some(toggled.expires_at));

    // Renewing subscriptions are not "expiring".
    let expiring = app.billing.expiring_soon(Some(3)).await.unwrap();
    let ids: Vec<i64> = expiring.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![lapsing_sub.id]);

    // Nothing is due yet; pull the payment date into the past.
    assert!(app.billing.subscriptions_for_renewal().await.unwrap().is_empty());
    let uow = app.db.begin().await.unwrap();
    uow.subscriptions()
        .subscriptions()
        .update(
            renewing_sub.id,
            Fields::new().set("next_payment_date", Utc::now() - Duration::hours(1)),
        )
        .await
        .unwrap();
    uow.commit().await.unwrap();

    let due = app.billing.subscriptions_for_renewal().await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, renewing_sub.id);

    let disabled = app
        .billing
        .toggle_auto_renewal(renewing_sub.id, false)
        .await
        .unwrap();
    assert!(disabled.next_payment_date.is_none());

    app.cleanup().await;
}

#[tokio::test]
async fn entitlement_follows_plan_catalogue() {
    let app = TestApp::spawn().await;
    let user = app.create_user(36).await;

    let free = app.billing.entitlement(user.id).await.unwrap();
    assert_eq!(free.tier, SubscriptionTier::Free);
    assert_eq!(free.daily_readings_limit, 1);
    assert!(free.require_daily_allowance(1).is_err());

    let uow = app.db.begin().await.unwrap();
    uow.subscriptions()
        .plans()
        .create(
            Fields::new()
                .set("tier", SubscriptionTier::Premium)
                .set("name", "Premium")
                .set("monthly_price", Decimal::from(499))
                .set("daily_readings_limit", 25),
        )
        .await
        .unwrap();
    uow.commit().await.unwrap();

    app.billing
        .activate_subscription(grant(user.id, SubscriptionTier::Premium, 30))
        .await
        .unwrap();

    let premium = app.billing.entitlement(user.id).await.unwrap();
    assert_eq!(premium.tier, SubscriptionTier::Premium);
    assert_eq!(premium.daily_readings_limit, 25);
    assert!(premium.require_tier(SubscriptionTier::Basic).is_ok());
    assert!(matches!(
        premium.require_tier(SubscriptionTier::Vip),
        Err(BillingError::SubscriptionRequired { .. })
    ));

    let plans = app.billing.subscription_plans().await.unwrap();
    assert_eq!(plans.len(), 1);

    app.cleanup().await;
}

#[tokio::test]
async fn one_default_payment_method_per_user() {
    let app = TestApp::spawn().await;
    let user = app.create_user(37).await;

    let card = |id: &str, make_default: bool| SavePaymentMethod {
        user_id: user.id,
        provider: PaymentProvider::Yookassa,
        provider_method_id: id.to_string(),
        card_last4: Some("4242".to_string()),
        card_brand: Some("Visa".to_string()),
        expires_at: None,
        make_default,
    };

    let first = app.billing.save_payment_method(card("pm-1", true)).await.unwrap();
    let second = app.billing.save_payment_method(card("pm-2", true)).await.unwrap();
    assert!(second.is_default);

    // Saving the same method again updates it in place.
    let again = app.billing.save_payment_method(card("pm-1", false)).await.unwrap();
    assert_eq!(again.id, first.id);
    assert!(!again.is_default);

    let uow = app.db.begin().await.unwrap();
    let repo = uow.subscriptions();
    let deactivated = repo.deactivate_payment_method(second.id).await.unwrap();
    let active = repo.get_user_payment_methods(user.id, true).await.unwrap();
    let all = repo.get_user_payment_methods(user.id, false).await.unwrap();
    uow.commit().await.unwrap();

    assert!(!deactivated.is_active);
    assert!(!deactivated.is_default);
    assert_eq!(active.len(), 1);
    assert_eq!(all.len(), 2);
    assert!(all.iter().filter(|m| m.is_default).count() <= 1);

    app.cleanup().await;
}
