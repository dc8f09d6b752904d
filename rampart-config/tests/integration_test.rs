//! Integration tests for rampart-config

use rampart_config::*;
use rampart_core::{Engine, FaultToleranceError, MethodDefinition, PolicyKind, RetryConfig};
use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

fn write_temp(name: &str, content: &str) -> PathBuf {
    let path = env::temp_dir().join(format!("rampart-config-{}-{}", std::process::id(), name));
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_load_properties_file() {
    let path = write_temp(
        "ft.properties",
        "interceptor.priority=5000\n\
         Retry/maxRetries=1\n\
         Orders.place/Timeout/value=250\n\
         Orders.place/Bulkhead/enabled=false\n",
    );

    let manager = ConfigManager::new();
    manager.load_file_auto(path.to_str().unwrap()).unwrap();
    let settings = manager.load_settings().unwrap();

    assert_eq!(settings.interceptor_priority, Some(5000));
    assert_eq!(settings.defaults.retry.max_retries, Some(1));
    assert_eq!(settings.methods["Orders.place"].timeout.value_ms, Some(250));
    assert!(!settings.is_enabled("Orders.place", PolicyKind::Bulkhead));
    assert!(settings.is_enabled("Orders.other", PolicyKind::Bulkhead));

    fs::remove_file(path).ok();
}

#[test]
fn test_toml_then_env_file() {
    let toml = write_temp(
        "ft.toml",
        r#"
        "non-fallback.enabled" = true

        [CircuitBreaker]
        requestVolumeThreshold = 10
        failureRatio = 0.25
        "#,
    );

    let manager = ConfigManager::new();
    manager.load_file(toml.to_str().unwrap(), FileFormat::Toml).unwrap();
    manager.load_env_from([
        ("RAMPART_FT_CIRCUITBREAKER_FAILURERATIO", "0.5"),
        ("RAMPART_FT_NON_FALLBACK_ENABLED", "false"),
    ]);
    let settings = manager.load_settings().unwrap();

    let cb = &settings.defaults.circuit_breaker;
    assert_eq!(cb.request_volume_threshold, Some(10));
    assert_eq!(cb.failure_ratio, Some(0.5));
    assert!(!settings.non_fallback_enabled);
    assert!(settings.is_enabled("any", PolicyKind::Fallback));
    assert!(!settings.is_enabled("any", PolicyKind::Retry));

    fs::remove_file(toml).ok();
}

#[test]
fn test_process_environment() {
    let manager = ConfigManager::with_prefix("RAMPART_IT".to_string());

    unsafe {
        env::set_var("RAMPART_IT_BULKHEAD_WAITINGTASKQUEUE", "3");
    }

    manager.load_env().unwrap();
    let settings = manager.load_settings().unwrap();
    assert_eq!(settings.defaults.bulkhead.waiting_task_queue, Some(3));

    unsafe {
        env::remove_var("RAMPART_IT_BULKHEAD_WAITINGTASKQUEUE");
    }
}

#[test]
fn test_missing_file_is_load_error() {
    let manager = ConfigManager::new();
    let err = manager
        .load_file("/nonexistent/rampart.properties", FileFormat::Properties)
        .unwrap_err();
    assert!(matches!(err, ConfigError::LoadError(_)));
}

#[test]
fn test_unknown_parameter_fails_loading() {
    let manager = ConfigManager::new();
    manager
        .load_str("Timeout/unit=SECONDS", FileFormat::Properties)
        .unwrap();
    assert!(matches!(
        manager.load_settings(),
        Err(ConfigError::UnknownKey(key)) if key == "Timeout/unit"
    ));
}

#[tokio::test]
async fn test_loaded_settings_drive_engine() {
    let manager = ConfigManager::new();
    manager
        .load_str("Inventory.reserve/Retry/maxRetries=0", FileFormat::Properties)
        .unwrap();
    let engine = Engine::builder()
        .settings(manager.load_settings().unwrap())
        .build();

    let definition = MethodDefinition::<u32>::builder("Inventory.reserve")
        .retry(RetryConfig::new(5))
        .build();
    let executions = Arc::new(AtomicU32::new(0));
    let counted = executions.clone();

    let err = engine
        .invoke(&definition, move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, _>(io::Error::other("out of stock")) }
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        FaultToleranceError::RetriesExhausted { attempts: 1, .. }
    ));
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[test]
fn test_disabled_fallback_surfaces_error() {
    let manager = ConfigManager::new();
    manager
        .load_str(r#"{"Fallback": {"enabled": false}}"#, FileFormat::Json)
        .unwrap();
    let engine = Engine::builder()
        .settings(manager.load_settings().unwrap())
        .build();
    let definition = MethodDefinition::<u32>::builder("Quotes.fetch")
        .fallback(rampart_core::fallback_value(0))
        .build();

    let result = tokio_test::block_on(
        engine.invoke(&definition, |_| async { Err::<u32, _>(io::Error::other("stale")) }),
    );
    assert!(matches!(result, Err(FaultToleranceError::WorkFailure(_))));
}
