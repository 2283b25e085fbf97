//! Configuration loading tests

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use figment::Jail;
use regpoll_core::{Mapping, RegisterType};
use regpolld::config::{MappingEntry, ServiceConfig};
use regpolld::ServiceError;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("regpoll.yaml");
    std::fs::write(&path, body).unwrap();
    path
}

// ========== file loading ==========

#[test]
fn test_bundled_config_compiles() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/regpoll.yaml");
    let config = ServiceConfig::load(&path).unwrap();

    let registers = config.registers().unwrap();
    assert_eq!(registers.len(), 8);
    let setpoint = registers.iter().find(|r| r.name == "setpoint").unwrap();
    assert!(setpoint.writable);
    assert!(setpoint.validation.is_some());

    assert_eq!(config.derived(&registers).unwrap().len(), 2);
    let actuators = config.actuators(&registers).unwrap();
    assert_eq!(
        actuators.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
        vec!["start", "stop"]
    );
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServiceConfig::load(dir.path().join("absent.yaml")).unwrap();
    assert_eq!(config, ServiceConfig::default());
}

#[test]
fn test_partial_sections_keep_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
device:
  address: "192.168.1.20:502"
retry:
  max_retries: 3
"#,
    );
    let config = ServiceConfig::load(&path).unwrap();
    assert_eq!(config.device.address, "192.168.1.20:502");
    assert_eq!(config.device.unit_id, 1);
    assert_eq!(config.retry.max_retries, 3);
    assert_eq!(config.retry.initial_backoff_ms, 30);
    assert_eq!(config.cache.ttl_ms, 500);
}

#[test]
fn test_tagged_mappings() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
registers:
  - name: switch
    address: 11
    type: u16
    writable: true
    mapping:
      kind: enum
      values:
        "0": "OFF"
        "1": "ON"
  - name: temperature
    address: 20
    type: int16
    mapping:
      kind: formula
      expression: "(x - 400) / 10"
"#,
    );
    let config = ServiceConfig::load(&path).unwrap();
    assert!(matches!(
        config.registers[0].mapping,
        Some(MappingEntry::Enum { .. })
    ));

    let registers = config.registers().unwrap();
    assert_eq!(registers[1].data_type, RegisterType::S16);
    match &registers[1].mapping {
        Some(Mapping::Formula(formula)) => {
            assert_eq!(formula.forward(650).unwrap(), 25.0);
            assert_eq!(formula.inverse(25.0).unwrap(), 650.0);
        },
        other => panic!("unexpected mapping {other:?}"),
    }
}

#[test]
fn test_untagged_mapping_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
registers:
  - name: voltage
    address: 102
    type: u16
    mapping:
      expression: "x / 10"
"#,
    );
    assert!(matches!(
        ServiceConfig::load(&path),
        Err(ServiceError::Load(_))
    ));
}

// ========== startup validation ==========

#[test]
fn test_bad_formula_fails_before_io() {
    let dir = tempfile::tempdir().unwrap();
    for expression in ["x +", "x * x", "sqrt(x)", "0 * x", "0 / x"] {
        let path = write_config(
            dir.path(),
            &format!(
                r#"
registers:
  - name: broken
    address: 1
    type: u16
    mapping:
      kind: formula
      expression: "{expression}"
"#
            ),
        );
        let config = ServiceConfig::load(&path).unwrap();
        let err = config.registers().unwrap_err();
        assert!(
            matches!(err, ServiceError::Register(ref inner) if inner.is_config()),
            "{expression}: {err}"
        );
    }
}

#[test]
fn test_duplicate_register_names() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
registers:
  - { name: mode, address: 10, type: u16 }
  - { name: mode, address: 12, type: u16 }
"#,
    );
    let config = ServiceConfig::load(&path).unwrap();
    assert!(matches!(config.registers(), Err(ServiceError::Config(_))));
}

#[test]
fn test_ambiguous_enum_labels() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
registers:
  - name: state
    address: 3
    type: u16
    mapping:
      kind: enum
      values: { "0": "IDLE", "1": "IDLE" }
"#,
    );
    let config = ServiceConfig::load(&path).unwrap();
    assert!(config.registers().is_err());
}

// ========== derived values and actuators ==========

#[test]
fn test_derived_section() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
registers:
  - { name: volts, address: 1, type: u16 }
  - { name: amps, address: 2, type: u16 }
derived:
  - name: power
    expression: 'register("volts") * register("amps")'
    unit: W
"#,
    );
    let config = ServiceConfig::load(&path).unwrap();
    let registers = config.registers().unwrap();
    let derived = config.derived(&registers).unwrap();

    assert_eq!(derived[0].name, "power");
    assert_eq!(derived[0].unit.as_deref(), Some("W"));
    let known = HashMap::from([("volts".to_string(), 230.0), ("amps".to_string(), 2.0)]);
    assert_eq!(derived[0].calculation.evaluate(f64::NAN, &known).unwrap(), 460.0);
}

#[test]
fn test_derived_name_clashes_with_register() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
registers:
  - { name: volts, address: 1, type: u16 }
derived:
  - { name: volts, expression: 'register("volts") * 2' }
"#,
    );
    let config = ServiceConfig::load(&path).unwrap();
    let registers = config.registers().unwrap();
    assert!(matches!(
        config.derived(&registers),
        Err(ServiceError::Config(_))
    ));
}

#[test]
fn test_actuator_section() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
registers:
  - { name: mode, address: 10, type: u16, writable: true }
  - { name: limit, address: 12, type: u16, writable: true }
actuators:
  - name: charge
    variable: kw
    registers:
      mode: "2"
      limit: "kw * 10"
"#,
    );
    let config = ServiceConfig::load(&path).unwrap();
    let registers = config.registers().unwrap();
    let actuators = config.actuators(&registers).unwrap();

    let charge = &actuators[0];
    assert_eq!(charge.name, "charge");
    // targets follow register name order
    let targets: Vec<(&str, f64)> = charge
        .targets
        .iter()
        .map(|(name, calc)| (name.as_str(), calc.evaluate(1.5, &HashMap::new()).unwrap()))
        .collect();
    assert_eq!(targets, vec![("limit", 15.0), ("mode", 2.0)]);
}

#[test]
fn test_actuator_rejects_bad_targets() {
    let dir = tempfile::tempdir().unwrap();
    for registers_block in [
        "      missing: \"value\"",
        "      mode: \"other * 2\"",
    ] {
        let path = write_config(
            dir.path(),
            &format!(
                r#"
registers:
  - {{ name: mode, address: 10, type: u16, writable: true }}
actuators:
  - name: set
    registers:
{registers_block}
"#
            ),
        );
        let config = ServiceConfig::load(&path).unwrap();
        let registers = config.registers().unwrap();
        assert!(config.actuators(&registers).is_err(), "{registers_block}");
    }
}

// ========== environment overrides ==========

#[test]
fn test_env_overrides_file() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "regpoll.yaml",
            r#"
device:
  address: "127.0.0.1:502"
cache:
  ttl_ms: 500
"#,
        )?;
        jail.set_env("REGPOLL_DEVICE__ADDRESS", "10.1.2.3:1502");
        jail.set_env("REGPOLL_CACHE__TTL_MS", "250");
        jail.set_env("REGPOLL_STABILIZATION__ATTEMPTS", "3");

        let config = ServiceConfig::load("regpoll.yaml").map_err(|e| e.to_string())?;
        assert_eq!(config.device.address, "10.1.2.3:1502");
        assert_eq!(config.tcp_options().address, "10.1.2.3:1502");

        let options = config.device_options();
        assert_eq!(options.cache_ttl, Duration::from_millis(250));
        assert_eq!(options.stabilization.total_attempts(), 3);
        Ok(())
    });
}

#[test]
fn test_unrelated_env_ignored() {
    Jail::expect_with(|jail| {
        jail.set_env("REGPOLLX_DEVICE__ADDRESS", "ignored:1");
        jail.set_env("OTHER_DEVICE__ADDRESS", "ignored:2");

        let config = ServiceConfig::load("missing.yaml").map_err(|e| e.to_string())?;
        assert_eq!(config.device.address, "127.0.0.1:502");
        Ok(())
    });
}
