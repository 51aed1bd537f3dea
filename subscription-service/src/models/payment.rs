//! Payment model and its status state machine.

use super::SubscriptionTier;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Payment lifecycle status.
///
/// `Pending -> Processing -> {Succeeded, Failed, Cancelled}`; provider
/// notifications may skip `Processing`. `Refunded` is only reachable from
/// `Succeeded` through the administrative refund path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }

    /// No provider notification may move a payment out of a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Refunded
        )
    }

    /// Transitions accepted from provider notifications.
    ///
    /// `Processing -> Processing` is allowed so a repeated "still processing"
    /// notification is harmless.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Processing)
            | (Self::Pending, Self::Succeeded)
            | (Self::Pending, Self::Failed)
            | (Self::Pending, Self::Cancelled) => true,
            (Self::Processing, Self::Processing)
            | (Self::Processing, Self::Succeeded)
            | (Self::Processing, Self::Failed)
            | (Self::Processing, Self::Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment providers the bot accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentProvider {
    Yookassa,
    Cryptobot,
    TelegramStars,
    Manual,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yookassa => "yookassa",
            Self::Cryptobot => "cryptobot",
            Self::TelegramStars => "telegram_stars",
            Self::Manual => "manual",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "yookassa" => Some(Self::Yookassa),
            "cryptobot" => Some(Self::Cryptobot),
            "telegram_stars" => Some(Self::TelegramStars),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment record. Never deleted.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub uuid: Uuid,
    pub user_id: i64,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub provider: PaymentProvider,
    pub provider_payment_id: Option<String>,
    pub provider_order_id: Option<String>,
    pub subscription_tier: SubscriptionTier,
    pub subscription_period_days: i32,
    pub payment_method_id: Option<i64>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub receipt_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn is_successful(&self) -> bool {
        self.status == PaymentStatus::Succeeded
    }

    /// Payments made with a saved method fund auto-renewing subscriptions.
    pub fn funds_auto_renewal(&self) -> bool {
        self.payment_method_id.is_some()
    }
}

/// Input for creating a payment.
#[derive(Debug, Clone)]
pub struct CreatePayment {
    pub user_id: i64,
    pub amount: Decimal,
    pub provider: PaymentProvider,
    pub subscription_tier: SubscriptionTier,
    pub subscription_period_days: i32,
    pub currency: Option<String>,
    pub payment_method_id: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

/// Provider-supplied data accompanying a status change.
#[derive(Debug, Clone, Default)]
pub struct PaymentStatusUpdate {
    pub provider_payment_id: Option<String>,
    pub provider_order_id: Option<String>,
    pub error_message: Option<String>,
    pub receipt_url: Option<String>,
}
