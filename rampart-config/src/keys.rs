//! Property keys understood by [`ConfigManager::load_settings`].
//!
//! | key | meaning |
//! |---|---|
//! | `interceptor.priority` | priority of the built-in policy block |
//! | `non-fallback.enabled` | `false` disables every kind but Fallback |
//! | `<Kind>/enabled` | enable or disable a kind globally |
//! | `<Kind>/priority` | per-kind priority |
//! | `<Kind>/<param>` | global parameter override |
//! | `<method>/<Kind>/<param>` | override for one method (including `enabled`) |
//!
//! Durations are milliseconds.
//!
//! [`ConfigManager::load_settings`]: crate::ConfigManager::load_settings

use crate::{ConfigError, Result};
use rampart_core::{FaultToleranceSettings, PolicyKind, PolicyParameters};
use std::fmt;
use std::str::FromStr;

pub const INTERCEPTOR_PRIORITY: &str = "interceptor.priority";
pub const NON_FALLBACK_ENABLED: &str = "non-fallback.enabled";

/// Parameter names accepted per kind, besides `enabled`.
pub fn parameters(kind: PolicyKind) -> &'static [&'static str] {
    match kind {
        PolicyKind::Timeout => &["value"],
        PolicyKind::Retry => &["maxRetries", "delay", "maxDuration", "jitter"],
        PolicyKind::CircuitBreaker => &[
            "requestVolumeThreshold",
            "failureRatio",
            "delay",
            "successThreshold",
        ],
        PolicyKind::Bulkhead => &["value", "waitingTaskQueue"],
        PolicyKind::Fallback => &[],
    }
}

/// A recognised fault tolerance property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKey {
    InterceptorPriority,
    NonFallbackEnabled,
    Priority(PolicyKind),
    Parameter {
        method: Option<String>,
        kind: PolicyKind,
        name: String,
    },
}

impl PropertyKey {
    /// Classify `key`.
    ///
    /// `Ok(None)` means the key is not a fault tolerance property and should
    /// be left alone. A key naming a policy kind with a parameter that kind
    /// does not have is an error.
    pub fn parse(key: &str) -> Result<Option<Self>> {
        match key {
            INTERCEPTOR_PRIORITY | "interceptor/priority" => {
                return Ok(Some(Self::InterceptorPriority));
            }
            NON_FALLBACK_ENABLED | "non-fallback/enabled" => {
                return Ok(Some(Self::NonFallbackEnabled));
            }
            _ => {}
        }

        let Some((head, param)) = key.rsplit_once('/') else {
            return Ok(None);
        };
        let (method, kind) = match head.rsplit_once('/') {
            Some((method, kind)) => (Some(method), kind),
            None => (None, head),
        };
        let Ok(kind) = PolicyKind::from_str(kind) else {
            return Ok(None);
        };

        if param == "priority" && method.is_none() {
            return Ok(Some(Self::Priority(kind)));
        }
        let known = param == "enabled" || parameters(kind).contains(&param);
        if !known || method.is_some_and(str::is_empty) {
            return Err(ConfigError::UnknownKey(key.to_string()));
        }

        Ok(Some(Self::Parameter {
            method: method.map(str::to_string),
            kind,
            name: param.to_string(),
        }))
    }

    /// Every property key that applies to `method`, or the global keys when
    /// `method` is `None`.
    pub fn all(method: Option<&str>) -> Vec<PropertyKey> {
        let mut keys = Vec::new();
        if method.is_none() {
            keys.push(Self::InterceptorPriority);
            keys.push(Self::NonFallbackEnabled);
            keys.extend(PolicyKind::ALL.into_iter().map(Self::Priority));
        }
        for kind in PolicyKind::ALL {
            let names = std::iter::once("enabled").chain(parameters(kind).iter().copied());
            for name in names {
                keys.push(Self::Parameter {
                    method: method.map(str::to_string),
                    kind,
                    name: name.to_string(),
                });
            }
        }
        keys
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Parameter { method, .. } => method.as_deref(),
            _ => None,
        }
    }

    /// Write `raw` into the matching field of `settings`.
    pub fn apply(&self, settings: &mut FaultToleranceSettings, raw: &str) -> Result<()> {
        match self {
            Self::InterceptorPriority => {
                settings.interceptor_priority = Some(parse(self, raw)?);
            }
            Self::NonFallbackEnabled => {
                settings.non_fallback_enabled = parse(self, raw)?;
            }
            Self::Priority(kind) => {
                settings.priorities.insert(*kind, parse(self, raw)?);
            }
            Self::Parameter { method, kind, name } => {
                let target = match method {
                    Some(method) => settings.method_mut(method.as_str()),
                    None => &mut settings.defaults,
                };
                self.apply_parameter(target, *kind, name, raw)?;
            }
        }
        Ok(())
    }

    fn apply_parameter(
        &self,
        target: &mut PolicyParameters,
        kind: PolicyKind,
        name: &str,
        raw: &str,
    ) -> Result<()> {
        if name == "enabled" {
            target.set_enabled(kind, parse(self, raw)?);
            return Ok(());
        }

        match (kind, name) {
            (PolicyKind::Timeout, "value") => target.timeout.value_ms = Some(parse(self, raw)?),
            (PolicyKind::Retry, "maxRetries") => target.retry.max_retries = Some(parse(self, raw)?),
            (PolicyKind::Retry, "delay") => target.retry.delay_ms = Some(parse(self, raw)?),
            (PolicyKind::Retry, "maxDuration") => {
                target.retry.max_duration_ms = Some(parse(self, raw)?)
            }
            (PolicyKind::Retry, "jitter") => target.retry.jitter_ms = Some(parse(self, raw)?),
            (PolicyKind::CircuitBreaker, "requestVolumeThreshold") => {
                target.circuit_breaker.request_volume_threshold = Some(parse(self, raw)?)
            }
            (PolicyKind::CircuitBreaker, "failureRatio") => {
                target.circuit_breaker.failure_ratio = Some(parse(self, raw)?)
            }
            (PolicyKind::CircuitBreaker, "delay") => {
                target.circuit_breaker.delay_ms = Some(parse(self, raw)?)
            }
            (PolicyKind::CircuitBreaker, "successThreshold") => {
                target.circuit_breaker.success_threshold = Some(parse(self, raw)?)
            }
            (PolicyKind::Bulkhead, "value") => target.bulkhead.value = Some(parse(self, raw)?),
            (PolicyKind::Bulkhead, "waitingTaskQueue") => {
                target.bulkhead.waiting_task_queue = Some(parse(self, raw)?)
            }
            _ => return Err(ConfigError::UnknownKey(self.to_string())),
        }
        Ok(())
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InterceptorPriority => f.write_str(INTERCEPTOR_PRIORITY),
            Self::NonFallbackEnabled => f.write_str(NON_FALLBACK_ENABLED),
            Self::Priority(kind) => write!(f, "{}/priority", kind),
            Self::Parameter {
                method: Some(method),
                kind,
                name,
            } => write!(f, "{}/{}/{}", method, kind, name),
            Self::Parameter {
                method: None,
                kind,
                name,
            } => write!(f, "{}/{}", kind, name),
        }
    }
}

fn parse<T>(key: &PropertyKey, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global_keys() {
        assert_eq!(
            PropertyKey::parse("interceptor.priority").unwrap(),
            Some(PropertyKey::InterceptorPriority)
        );
        assert_eq!(
            PropertyKey::parse("Retry/priority").unwrap(),
            Some(PropertyKey::Priority(PolicyKind::Retry))
        );
        assert_eq!(
            PropertyKey::parse("Bulkhead/waitingTaskQueue").unwrap(),
            Some(PropertyKey::Parameter {
                method: None,
                kind: PolicyKind::Bulkhead,
                name: "waitingTaskQueue".to_string(),
            })
        );
    }

    #[test]
    fn test_method_name_may_contain_separators() {
        let key = PropertyKey::parse("com.acme/Orders.place/Retry/maxRetries")
            .unwrap()
            .unwrap();
        assert_eq!(key.method(), Some("com.acme/Orders.place"));
        assert_eq!(key.to_string(), "com.acme/Orders.place/Retry/maxRetries");
    }

    #[test]
    fn test_foreign_keys_ignored() {
        assert_eq!(PropertyKey::parse("server.port").unwrap(), None);
        assert_eq!(PropertyKey::parse("database/url").unwrap(), None);
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let err = PropertyKey::parse("Retry/maxRetry").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(key) if key == "Retry/maxRetry"));

        assert!(PropertyKey::parse("Orders.place/Retry/priority").is_err());
    }

    #[test]
    fn test_apply_values() {
        let mut settings = FaultToleranceSettings::new();
        let apply = |settings: &mut FaultToleranceSettings, key: &str, value: &str| {
            PropertyKey::parse(key)
                .unwrap()
                .unwrap()
                .apply(settings, value)
        };

        apply(&mut settings, "interceptor.priority", "5000").unwrap();
        apply(&mut settings, "non-fallback.enabled", "false").unwrap();
        apply(&mut settings, "Timeout/priority", "4200").unwrap();
        apply(&mut settings, "Orders.place/Retry/maxRetries", "-1").unwrap();
        apply(&mut settings, "Orders.place/Fallback/enabled", "false").unwrap();

        assert_eq!(settings.interceptor_priority, Some(5000));
        assert!(!settings.non_fallback_enabled);
        assert_eq!(settings.priorities[&PolicyKind::Timeout], 4200);
        assert_eq!(settings.methods["Orders.place"].retry.max_retries, Some(-1));
        assert_eq!(settings.methods["Orders.place"].fallback.enabled, Some(false));
    }

    #[test]
    fn test_invalid_value_reported() {
        let mut settings = FaultToleranceSettings::new();
        let err = PropertyKey::parse("CircuitBreaker/failureRatio")
            .unwrap()
            .unwrap()
            .apply(&mut settings, "half")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "CircuitBreaker/failureRatio"));
    }

    #[test]
    fn test_all_keys_round_trip_through_parse() {
        for key in PropertyKey::all(Some("Orders.place")) {
            assert_eq!(PropertyKey::parse(&key.to_string()).unwrap(), Some(key));
        }
        // two globals, five priorities, sixteen kind parameters
        assert_eq!(PropertyKey::all(None).len(), 23);
    }
}
