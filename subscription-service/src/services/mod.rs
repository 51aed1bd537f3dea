//! Services module for subscription-service.

pub mod billing;
pub mod database;
pub mod metrics;

pub use billing::{BillingService, PaymentNotification, PaymentRequest, PromoRedemption};
pub use database::Database;
pub use metrics::{
    get_metrics, init_metrics, record_error, record_operation, record_payment_status,
    record_promo_result, record_uow_queries,
};
