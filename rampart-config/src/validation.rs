// Configuration validation

use crate::{ConfigError, Result};
use rampart_core::{FaultToleranceSettings, PolicyParameters};

/// Trait for validating configuration
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Configuration validator with rules
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate that a number is within an inclusive range
    pub fn in_range<T>(value: T, min: T, max: T, field: &str) -> Result<()>
    where
        T: PartialOrd + std::fmt::Display,
    {
        if value < min || value > max {
            return Err(ConfigError::ValidationError(format!(
                "{} must be between {} and {}, got {}",
                field, min, max, value
            )));
        }
        Ok(())
    }

    /// Validate a lower bound
    pub fn at_least<T>(value: T, min: T, field: &str) -> Result<()>
    where
        T: PartialOrd + std::fmt::Display,
    {
        if value < min {
            return Err(ConfigError::ValidationError(format!(
                "{} must be at least {}, got {}",
                field, min, value
            )));
        }
        Ok(())
    }
}

fn check<T>(value: Option<T>, rule: impl FnOnce(T) -> Result<()>) -> Result<()> {
    value.map_or(Ok(()), rule)
}

fn validate_parameters(scope: &str, params: &PolicyParameters) -> Result<()> {
    let field = |name: &str| format!("{}/{}", scope, name);

    check(params.timeout.value_ms, |v| {
        ConfigValidator::at_least(v, 1, &field("Timeout/value"))
    })?;
    check(params.retry.max_retries, |v| {
        ConfigValidator::at_least(v, -1, &field("Retry/maxRetries"))
    })?;
    check(params.circuit_breaker.request_volume_threshold, |v| {
        ConfigValidator::at_least(v, 1, &field("CircuitBreaker/requestVolumeThreshold"))
    })?;
    check(params.circuit_breaker.failure_ratio, |v| {
        ConfigValidator::in_range(v, 0.0, 1.0, &field("CircuitBreaker/failureRatio"))
    })?;
    check(params.circuit_breaker.success_threshold, |v| {
        ConfigValidator::at_least(v, 1, &field("CircuitBreaker/successThreshold"))
    })?;
    check(params.bulkhead.value, |v| {
        ConfigValidator::at_least(v, 1, &field("Bulkhead/value"))
    })?;

    check(params.retry.max_duration_ms, |v| {
        ConfigValidator::at_least(v, 1, &field("Retry/maxDuration"))
    })?;

    if let (Some(delay), Some(max)) = (params.retry.delay_ms, params.retry.max_duration_ms)
        && delay >= max
    {
        return Err(ConfigError::ValidationError(format!(
            "{} ({}) must be shorter than {} ({})",
            field("Retry/delay"),
            delay,
            field("Retry/maxDuration"),
            max
        )));
    }
    Ok(())
}

impl Validate for FaultToleranceSettings {
    fn validate(&self) -> Result<()> {
        validate_parameters("defaults", &self.defaults)?;
        for (method, params) in &self.methods {
            validate_parameters(method, params)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_range() {
        assert!(ConfigValidator::in_range(0.5, 0.0, 1.0, "ratio").is_ok());
        let err = ConfigValidator::in_range(1.5, 0.0, 1.0, "ratio").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: ratio must be between 0 and 1, got 1.5"
        );
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(FaultToleranceSettings::new().validate().is_ok());
    }

    #[test]
    fn test_method_scope_named_in_error() {
        let mut settings = FaultToleranceSettings::new();
        settings.method_mut("Orders.place").bulkhead.value = Some(0);

        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Orders.place/Bulkhead/value"));
    }

    #[test]
    fn test_max_retries_below_unlimited_rejected() {
        let mut settings = FaultToleranceSettings::new();
        settings.defaults.retry.max_retries = Some(-2);
        assert!(settings.validate().is_err());

        settings.defaults.retry.max_retries = Some(-1);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_delay_must_fit_in_max_duration() {
        let mut settings = FaultToleranceSettings::new();
        settings.defaults.retry.delay_ms = Some(500);
        settings.defaults.retry.max_duration_ms = Some(500);
        assert!(settings.validate().is_err());
    }
}
