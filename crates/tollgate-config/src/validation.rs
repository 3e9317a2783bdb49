//! Configuration validation

use crate::schema::{RawConfig, RawEngineConfig, RawPlan, RawServiceConfig};
use std::collections::HashSet;
use thiserror::Error;

/// Retry attempts accepted for either retry knob
pub const RETRY_ATTEMPTS_RANGE: std::ops::RangeInclusive<u32> = 1..=10;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Plan '{plan_id}': {message}")]
    PlanError { plan_id: String, message: String },

    #[error("Duplicate plan ID: {0}")]
    DuplicatePlanId(String),

    #[error("Service config error: {0}")]
    ServiceError(String),

    #[error("Engine config error: {0}")]
    EngineError(String),
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    errors.extend(validate_service(&config.service));
    errors.extend(validate_engine(&config.engine));

    let mut seen_ids = HashSet::new();
    for plan in &config.plans {
        if !plan.id.is_empty() && !seen_ids.insert(&plan.id) {
            errors.push(ValidationError::DuplicatePlanId(plan.id.clone()));
        }
    }

    for plan in &config.plans {
        errors.extend(validate_plan(plan));
    }

    errors
}

fn validate_service(service: &RawServiceConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if service.sweep_interval_seconds == Some(0) {
        errors.push(ValidationError::ServiceError(
            "sweep_interval_seconds must be positive".into(),
        ));
    }
    if service.request_timeout_ms == Some(0) {
        errors.push(ValidationError::ServiceError(
            "request_timeout_ms must be positive".into(),
        ));
    }
    if service.requests_per_second == Some(0) {
        errors.push(ValidationError::ServiceError(
            "requests_per_second must be positive".into(),
        ));
    }

    errors
}

fn validate_engine(engine: &RawEngineConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for (name, value) in [
        ("store_retry_attempts", engine.store_retry_attempts),
        ("report_retry_attempts", engine.report_retry_attempts),
    ] {
        if let Some(attempts) = value
            && !RETRY_ATTEMPTS_RANGE.contains(&attempts)
        {
            errors.push(ValidationError::EngineError(format!(
                "{} must be between {} and {}, got {}",
                name,
                RETRY_ATTEMPTS_RANGE.start(),
                RETRY_ATTEMPTS_RANGE.end(),
                attempts
            )));
        }
    }

    if let Some(mode) = &engine.usage_regression
        && mode.parse::<crate::UsageRegression>().is_err()
    {
        errors.push(ValidationError::EngineError(format!(
            "usage_regression must be \"reject\" or \"clamp\", got \"{}\"",
            mode
        )));
    }

    if engine.max_page_limit == Some(0) {
        errors.push(ValidationError::EngineError(
            "max_page_limit must be positive".into(),
        ));
    }

    errors
}

fn validate_plan(plan: &RawPlan) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if plan.id.is_empty() {
        errors.push(ValidationError::PlanError {
            plan_id: plan.name.clone(),
            message: "id must not be empty".into(),
        });
    } else if plan.id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        errors.push(ValidationError::PlanError {
            plan_id: plan.id.clone(),
            message: "id must not contain whitespace".into(),
        });
    }

    if plan.name.trim().is_empty() {
        errors.push(ValidationError::PlanError {
            plan_id: plan.id.clone(),
            message: "name must not be empty".into(),
        });
    }

    errors
}
