//! Payment settlement integration tests for subscription-service.

mod common;

use chrono::{Duration, Utc};
use common::{assert_close, TestApp};
use rust_decimal::Decimal;
use subscription_service::models::{
    CreateSubscription, PaymentProvider, PaymentStatus, PaymentStatusUpdate, SubscriptionTier,
};
use subscription_service::repositories::{Pagination, SubscriptionRepository};
use subscription_service::services::PaymentNotification;
use subscription_service::BillingError;

#[tokio::test]
async fn succeeded_payment_activates_subscription() {
    let app = TestApp::spawn().await;
    let user = app.create_user(7).await;

    let payment = app
        .pending_payment(user.id, SubscriptionTier::Premium, 30, Decimal::from(499))
        .await;
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.currency, "RUB");

    let paid = app.succeed(payment.id).await;
    assert_eq!(paid.status, PaymentStatus::Succeeded);
    assert!(paid.paid_at.is_some());

    let uow = app.db.begin().await.unwrap();
    let active = uow
        .subscriptions()
        .get_user_active_subscription(user.id)
        .await
        .unwrap()
        .expect("subscription should be active");
    uow.rollback().await.unwrap();

    assert_eq!(active.tier, SubscriptionTier::Premium);
    assert_eq!(active.payment_id, Some(payment.id));
    assert_close(active.expires_at, Utc::now() + Duration::days(30));

    let user = app.reload_user(user.id).await;
    assert_eq!(user.subscription_tier, SubscriptionTier::Premium);
    assert_eq!(user.subscription_expires_at, Some(active.expires_at));

    app.cleanup().await;
}

#[tokio::test]
async fn duplicate_success_is_rejected_and_not_applied_twice() {
    let app = TestApp::spawn().await;
    let user = app.create_user(8).await;

    let payment = app
        .pending_payment(user.id, SubscriptionTier::Basic, 30, Decimal::from(199))
        .await;
    app.succeed(payment.id).await;
    let first_expiry = app.reload_user(user.id).await.subscription_expires_at;

    let err = app
        .billing
        .update_payment_status(payment.id, PaymentStatus::Succeeded, PaymentStatusUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidStateTransition { .. }));
    assert!(!err.is_retryable());

    // Nor can it fail afterwards.
    let err = app
        .billing
        .update_payment_status(payment.id, PaymentStatus::Failed, PaymentStatusUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidStateTransition { .. }));

    assert_eq!(app.reload_user(user.id).await.subscription_expires_at, first_expiry);

    app.cleanup().await;
}

#[tokio::test]
async fn same_tier_payment_extends_existing_subscription() {
    let app = TestApp::spawn().await;
    let user = app.create_user(9).await;

    let current = app
        .billing
        .activate_subscription(CreateSubscription {
            user_id: user.id,
            tier: SubscriptionTier::Basic,
            period_days: 10,
            payment_id: None,
            promo_code_id: None,
            is_trial: false,
            is_auto_renew: false,
        })
        .await
        .unwrap();

    let payment = app
        .pending_payment(user.id, SubscriptionTier::Basic, 30, Decimal::from(199))
        .await;
    app.succeed(payment.id).await;

    let uow = app.db.begin().await.unwrap();
    let repo = uow.subscriptions();
    let active = repo
        .get_user_active_subscription(user.id)
        .await
        .unwrap()
        .unwrap();
    let rows = repo
        .subscriptions()
        .find_many(subscription_service::repositories::Fields::new().set("user_id", user.id))
        .await
        .unwrap();
    uow.rollback().await.unwrap();

    assert_eq!(active.id, current.id);
    assert_eq!(rows.len(), 1);
    assert_close(active.expires_at, current.expires_at + Duration::days(30));
    assert_eq!(active.payment_id, Some(payment.id));

    app.cleanup().await;
}

#[tokio::test]
async fn different_tier_payment_replaces_subscription() {
    let app = TestApp::spawn().await;
    let user = app.create_user(10).await;

    let basic = app
        .pending_payment(user.id, SubscriptionTier::Basic, 30, Decimal::from(199))
        .await;
    app.succeed(basic.id).await;

    let vip = app
        .pending_payment(user.id, SubscriptionTier::Vip, 30, Decimal::from(999))
        .await;
    app.succeed(vip.id).await;

    let uow = app.db.begin().await.unwrap();
    let repo = uow.subscriptions();
    let all = repo
        .subscriptions()
        .find_many(subscription_service::repositories::Fields::new().set("user_id", user.id))
        .await
        .unwrap();
    uow.rollback().await.unwrap();

    let now = Utc::now();
    let active: Vec<_> = all.iter().filter(|s| s.is_active(now)).collect();
    assert_eq!(all.len(), 2);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].tier, SubscriptionTier::Vip);
    assert!(all
        .iter()
        .any(|s| s.tier == SubscriptionTier::Basic && s.is_cancelled));

    assert_eq!(
        app.reload_user(user.id).await.subscription_tier,
        SubscriptionTier::Vip
    );

    app.cleanup().await;
}

#[tokio::test]
async fn failed_payment_records_reason_and_grants_nothing() {
    let app = TestApp::spawn().await;
    let user = app.create_user(11).await;

    let payment = app
        .pending_payment(user.id, SubscriptionTier::Premium, 30, Decimal::from(499))
        .await;
    let failed = app
        .billing
        .update_payment_status(
            payment.id,
            PaymentStatus::Failed,
            PaymentStatusUpdate {
                error_message: Some("card declined".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(failed.status, PaymentStatus::Failed);
    assert!(failed.failed_at.is_some());
    assert_eq!(failed.error_message.as_deref(), Some("card declined"));
    assert_eq!(
        app.reload_user(user.id).await.subscription_tier,
        SubscriptionTier::Free
    );

    app.cleanup().await;
}

#[tokio::test]
async fn webhook_finds_payment_by_uuid_then_by_provider_id() {
    let app = TestApp::spawn().await;
    let user = app.create_user(12).await;
    let payment = app
        .pending_payment(user.id, SubscriptionTier::Premium, 30, Decimal::from(499))
        .await;

    let processing = app
        .billing
        .process_payment_notification(PaymentNotification {
            provider: PaymentProvider::Yookassa,
            provider_payment_id: "2d1f-yk".to_string(),
            payment_uuid: Some(payment.uuid),
            status: PaymentStatus::Processing,
            provider_order_id: Some("order-1".to_string()),
            error_message: None,
            receipt_url: None,
        })
        .await
        .unwrap();
    assert_eq!(processing.id, payment.id);
    assert_eq!(processing.provider_payment_id.as_deref(), Some("2d1f-yk"));

    let settled = app
        .billing
        .process_payment_notification(PaymentNotification {
            provider: PaymentProvider::Yookassa,
            provider_payment_id: "2d1f-yk".to_string(),
            payment_uuid: None,
            status: PaymentStatus::Succeeded,
            provider_order_id: None,
            error_message: None,
            receipt_url: Some("https://receipts.example/2d1f".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(settled.status, PaymentStatus::Succeeded);
    assert_eq!(settled.provider_order_id.as_deref(), Some("order-1"));

    let unknown = app
        .billing
        .process_payment_notification(PaymentNotification {
            provider: PaymentProvider::Cryptobot,
            provider_payment_id: "2d1f-yk".to_string(),
            payment_uuid: None,
            status: PaymentStatus::Succeeded,
            provider_order_id: None,
            error_message: None,
            receipt_url: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(unknown, BillingError::EntityNotFound { .. }));

    app.cleanup().await;
}

#[tokio::test]
async fn refund_with_revocation_cancels_funded_subscription() {
    let app = TestApp::spawn().await;
    let user = app.create_user(13).await;
    let payment = app
        .pending_payment(user.id, SubscriptionTier::Premium, 30, Decimal::from(499))
        .await;

    let err = app
        .billing
        .refund_payment(payment.id, None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidStateTransition { .. }));

    app.succeed(payment.id).await;
    let refunded = app
        .billing
        .refund_payment(payment.id, Some("chargeback".to_string()), true)
        .await
        .unwrap();
    assert_eq!(refunded.status, PaymentStatus::Refunded);

    let user = app.reload_user(user.id).await;
    assert_eq!(user.subscription_tier, SubscriptionTier::Free);
    assert!(user.subscription_expires_at.is_none());

    let page = app
        .billing
        .user_payments(user.id, Some(PaymentStatus::Refunded), Pagination::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id, payment.id);

    app.cleanup().await;
}

#[tokio::test]
async fn invalid_payments_are_rejected_before_insert() {
    let app = TestApp::spawn().await;
    let user = app.create_user(14).await;

    let err = app
        .billing
        .create_payment(subscription_service::services::PaymentRequest {
            user_id: user.id,
            amount: Decimal::ZERO,
            provider: PaymentProvider::TelegramStars,
            tier: SubscriptionTier::Basic,
            period_days: 30,
            currency: None,
            payment_method_id: None,
            promo_code: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation { .. }));

    // Unknown user trips the foreign key and surfaces as a validation error.
    let err = app
        .billing
        .create_payment(subscription_service::services::PaymentRequest {
            user_id: user.id + 1000,
            amount: Decimal::from(199),
            provider: PaymentProvider::TelegramStars,
            tier: SubscriptionTier::Basic,
            period_days: 30,
            currency: Some("xtr".to_string()),
            payment_method_id: None,
            promo_code: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation { .. }));

    app.cleanup().await;
}

#[tokio::test]
async fn oversized_periods_are_rejected_without_panicking() {
    let app = TestApp::spawn().await;
    let user = app.create_user(15).await;

    let err = app
        .billing
        .create_payment(subscription_service::services::PaymentRequest {
            user_id: user.id,
            amount: Decimal::from(199),
            provider: PaymentProvider::Yookassa,
            tier: SubscriptionTier::Basic,
            period_days: 200_000_000,
            currency: None,
            payment_method_id: None,
            promo_code: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation { .. }));

    let err = app
        .billing
        .activate_subscription(CreateSubscription {
            user_id: user.id,
            tier: SubscriptionTier::Basic,
            period_days: 200_000_000,
            payment_id: None,
            promo_code_id: None,
            is_trial: false,
            is_auto_renew: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation { .. }));

    let current = app
        .billing
        .activate_subscription(CreateSubscription {
            user_id: user.id,
            tier: SubscriptionTier::Basic,
            period_days: 30,
            payment_id: None,
            promo_code_id: None,
            is_trial: false,
            is_auto_renew: false,
        })
        .await
        .unwrap();
    let err = app
        .billing
        .extend_subscription(current.id, i32::MAX)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation { .. }));

    let err = app.billing.expiring_soon(Some(200_000_000)).await.unwrap_err();
    assert!(matches!(err, BillingError::Validation { .. }));

    let user = app.reload_user(user.id).await;
    assert_eq!(user.subscription_expires_at, Some(current.expires_at));

    app.cleanup().await;
}

#[tokio::test]
async fn concurrent_success_deliveries_settle_once() {
    let app = TestApp::spawn().await;
    let user = app.create_user(16).await;

    let payment = app
        .pending_payment(user.id, SubscriptionTier::Premium, 30, Decimal::from(499))
        .await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let billing = app.billing.clone();
        let payment_id = payment.id;
        handles.push(tokio::spawn(async move {
            billing
                .update_payment_status(
                    payment_id,
                    PaymentStatus::Succeeded,
                    PaymentStatusUpdate {
                        provider_payment_id: Some(format!("yk-{}", payment_id)),
                        ..Default::default()
                    },
                )
                .await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(paid) => {
                assert_eq!(paid.status, PaymentStatus::Succeeded);
                succeeded += 1;
            }
            Err(err) => assert!(
                matches!(err, BillingError::InvalidStateTransition { .. }),
                "unexpected error: {:?}",
                err
            ),
        }
    }
    assert_eq!(succeeded, 1);

    let uow = app.db.begin().await.unwrap();
    let rows = uow
        .subscriptions()
        .subscriptions()
        .find_many(subscription_service::repositories::Fields::new().set("user_id", user.id))
        .await
        .unwrap();
    uow.rollback().await.unwrap();

    assert_eq!(rows.len(), 1);
    assert_close(rows[0].expires_at, Utc::now() + Duration::days(30));

    app.cleanup().await;
}

#[tokio::test]
async fn concurrent_settlements_for_one_user_keep_one_active_subscription() {
    let app = TestApp::spawn().await;
    let user = app.create_user(17).await;

    let mut payments = Vec::new();
    for _ in 0..3 {
        payments.push(
            app.pending_payment(user.id, SubscriptionTier::Basic, 30, Decimal::from(199))
                .await,
        );
    }

    let mut handles = Vec::new();
    for payment in &payments {
        let billing = app.billing.clone();
        let payment_id = payment.id;
        handles.push(tokio::spawn(async move {
            billing
                .update_payment_status(
                    payment_id,
                    PaymentStatus::Succeeded,
                    PaymentStatusUpdate::default(),
                )
                .await
        }));
    }
    for handle in handles {
        handle
            .await
            .expect("task panicked")
            .expect("settlement should succeed");
    }

    let uow = app.db.begin().await.unwrap();
    let rows = uow
        .subscriptions()
        .subscriptions()
        .find_many(subscription_service::repositories::Fields::new().set("user_id", user.id))
        .await
        .unwrap();
    uow.rollback().await.unwrap();

    // The first settlement creates the subscription, the others extend it.
    let now = Utc::now();
    let active: Vec<_> = rows.iter().filter(|s| s.is_active(now)).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(rows.len(), 1);
    assert_close(active[0].expires_at, now + Duration::days(90));

    let user = app.reload_user(user.id).await;
    assert_eq!(user.subscription_tier, SubscriptionTier::Basic);
    assert_eq!(user.subscription_expires_at, Some(active[0].expires_at));

    app.cleanup().await;
}
