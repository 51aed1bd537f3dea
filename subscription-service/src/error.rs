//! Error taxonomy for the subscription core.
//!
//! Repositories and the unit of work never leak raw `sqlx` errors: constraint
//! violations become [`BillingError::Validation`], everything else a store
//! throws becomes [`BillingError::Database`].

use crate::models::SubscriptionTier;
use service_core::error::AppError;
use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        details: Option<String>,
    },

    #[error("{entity} with id {id} not found")]
    EntityNotFound { entity: &'static str, id: String },

    #[error("Invalid state transition from '{current}': {message}")]
    InvalidStateTransition { current: String, message: String },

    #[error("Database error: {0}")]
    Database(anyhow::Error),

    #[error("Subscription required: {required} or higher (current: {current})")]
    SubscriptionRequired {
        required: SubscriptionTier,
        current: SubscriptionTier,
    },

    #[error("Daily limit of {limit} reached")]
    DailyLimitReached { limit: u32 },
}

impl BillingError {
    pub fn validation(message: impl Into<String>) -> Self {
        BillingError::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        BillingError::EntityNotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(current: impl ToString, message: impl Into<String>) -> Self {
        BillingError::InvalidStateTransition {
            current: current.to_string(),
            message: message.into(),
        }
    }

    /// Only storage failures are safe to retry blindly; everything else is a
    /// logic or data problem.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Database(_))
    }

    /// Text that may be shown to an end user. Infrastructure detail stays in logs.
    pub fn user_message(&self) -> String {
        match self {
            BillingError::Validation { message, .. } => message.clone(),
            BillingError::EntityNotFound { entity, .. } => format!("{} not found", entity),
            BillingError::InvalidStateTransition { message, .. } => message.clone(),
            BillingError::Database(_) => {
                "Something went wrong on our side, please try again later".to_string()
            }
            BillingError::SubscriptionRequired { required, .. } => {
                format!("This feature requires the {} subscription", required)
            }
            BillingError::DailyLimitReached { limit } => {
                format!("You have used all {} readings for today", limit)
            }
        }
    }

    /// Short label for the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::Validation { .. } => "validation",
            BillingError::EntityNotFound { .. } => "not_found",
            BillingError::InvalidStateTransition { .. } => "invalid_state_transition",
            BillingError::Database(_) => "database",
            BillingError::SubscriptionRequired { .. } => "subscription_required",
            BillingError::DailyLimitReached { .. } => "daily_limit_reached",
        }
    }
}

/// Translate a store error raised by a write. Constraint violations are the
/// caller's fault and surface as validation errors.
pub(crate) fn write_error(entity: &str, err: sqlx::Error) -> BillingError {
    match err {
        sqlx::Error::Database(ref db_err)
            if db_err.is_unique_violation()
                || db_err.is_foreign_key_violation()
                || db_err.is_check_violation() =>
        {
            BillingError::Validation {
                message: format!("Constraint violation in {}", entity),
                details: Some(db_err.message().to_string()),
            }
        }
        other => BillingError::Database(anyhow::anyhow!("Failed to write {}: {}", entity, other)),
    }
}

/// Translate a store error raised by a read.
pub(crate) fn read_error(operation: &str, err: sqlx::Error) -> BillingError {
    BillingError::Database(anyhow::anyhow!("Failed to {}: {}", operation, err))
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation { message, details } => match details {
                Some(details) => AppError::BadRequest(anyhow::anyhow!("{}: {}", message, details)),
                None => AppError::BadRequest(anyhow::anyhow!(message)),
            },
            e @ BillingError::EntityNotFound { .. } => AppError::NotFound(anyhow::anyhow!(e)),
            e @ BillingError::InvalidStateTransition { .. } => {
                AppError::Conflict(anyhow::anyhow!(e))
            }
            BillingError::Database(e) => AppError::DatabaseError(e),
            e @ BillingError::SubscriptionRequired { .. } => AppError::Forbidden(anyhow::anyhow!(e)),
            e @ BillingError::DailyLimitReached { .. } => {
                AppError::TooManyRequests(e.to_string(), None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_database_errors_are_retryable() {
        assert!(BillingError::Database(anyhow::anyhow!("connection reset")).is_retryable());
        assert!(!BillingError::validation("bad").is_retryable());
        assert!(!BillingError::not_found("Payment", 1).is_retryable());
        assert!(!BillingError::invalid_transition("succeeded", "nope").is_retryable());
    }

    #[test]
    fn infrastructure_failures_hide_detail_from_users() {
        let err = BillingError::Database(anyhow::anyhow!("relation \"payments\" does not exist"));
        let message = err.user_message();
        assert!(message.contains("try again later"));
        assert!(!message.contains("payments"));
    }

    #[test]
    fn domain_failures_keep_their_reason() {
        let err = BillingError::validation("Promo code expired");
        assert_eq!(err.user_message(), "Promo code expired");
    }

    #[test]
    fn maps_onto_http_errors() {
        let app: AppError = BillingError::invalid_transition("succeeded", "already paid").into();
        assert!(matches!(app, AppError::Conflict(_)));

        let app: AppError = BillingError::not_found("Subscription", 42).into();
        assert!(matches!(app, AppError::NotFound(_)));

        let app: AppError = BillingError::Database(anyhow::anyhow!("boom")).into();
        assert!(matches!(app, AppError::DatabaseError(_)));
    }
}
