//! Domain models for subscription-service.

mod payment;
mod payment_method;
mod promo_code;
mod statistics;
mod subscription;
mod user;

pub use payment::{CreatePayment, Payment, PaymentProvider, PaymentStatus, PaymentStatusUpdate};
pub use payment_method::{PaymentMethod, SavePaymentMethod};
pub use promo_code::{
    generate_code, normalize_code, AppliedDiscount, CreatePromoCode, PromoCode, PromoCodeType,
    PromoRejection, PromoValidation,
};
pub use statistics::{Entitlement, RevenueStatistics, TierRevenue};
pub use subscription::{
    add_period, CreateSubscription, Subscription, SubscriptionPlan, SubscriptionTier,
    MAX_PERIOD_DAYS,
};
pub use user::{CreateUser, User};
