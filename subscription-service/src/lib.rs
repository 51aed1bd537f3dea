//! Subscription Service - subscription, payment and promo code core for the
//! tarot & astrology bot.

pub mod config;
pub mod error;
pub mod models;
pub mod repositories;
pub mod services;
pub mod startup;
pub mod uow;

pub use error::{BillingError, BillingResult};
