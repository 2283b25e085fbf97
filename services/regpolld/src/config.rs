//! Service configuration
//!
//! Layered with figment: built-in defaults, then the YAML file, then
//! `REGPOLL_*` environment variables (`__` separates nested keys, so
//! `REGPOLL_DEVICE__ADDRESS` overrides `device.address`).

use crate::actuator::Actuator;
use crate::error::{Result, ServiceError};
use crate::poller::Derived;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use regpoll_core::{
    Calculation, DeviceOptions, EnumMap, Formula, Mapping, Predicate, Register, RegisterType,
    RetryPolicy, TcpOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "config/regpoll.yaml";
pub const ENV_PREFIX: &str = "REGPOLL_";

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub device: DeviceSection,
    pub cache: CacheSection,
    pub retry: RetrySection,
    pub stabilization: StabilizationSection,
    pub poll: PollSection,
    pub registers: Vec<RegisterEntry>,
    pub derived: Vec<DerivedEntry>,
    pub actuators: Vec<ActuatorEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    /// `host:port`
    pub address: String,
    pub unit_id: u8,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:502".to_string(),
            unit_id: 1,
            connect_timeout_ms: 3000,
            request_timeout_ms: 3000,
            idle_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub ttl_ms: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self { ttl_ms: 500 }
    }
}

/// Per-request transport retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff_ms: 30,
        }
    }
}

/// Write read-back confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationSection {
    /// Total reads, including the first
    pub attempts: u32,
    pub initial_backoff_ms: u64,
}

impl Default for StabilizationSection {
    fn default() -> Self {
        Self {
            attempts: 6,
            initial_backoff_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSection {
    pub interval_ms: u64,
}

impl Default for PollSection {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

/// One configured register
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterEntry {
    pub name: String,
    pub address: u16,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default = "default_length")]
    pub length: u16,
    #[serde(default)]
    pub writable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<MappingEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationEntry>,
}

fn default_length() -> u16 {
    1
}

/// Value mapping, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MappingEntry {
    /// Raw key to label. Keys are written as strings (`"0": OFF`).
    Enum { values: BTreeMap<String, String> },
    Formula { expression: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationEntry {
    pub variable: String,
    pub expression: String,
}

/// Value computed from `register("name")` lookups on every poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedEntry {
    pub name: String,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// One input fanned out to several writable registers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorEntry {
    pub name: String,
    /// Name of the input inside each expression
    #[serde(default = "default_actuator_variable")]
    pub variable: String,
    /// Register name to expression of the input
    pub registers: BTreeMap<String, String>,
}

fn default_actuator_variable() -> String {
    "value".to_string()
}

impl ServiceConfig {
    /// Load from `path`, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config from {}", path.display());
        Self::figment(path).extract().map_err(ServiceError::from)
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(ServiceConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Build core registers, compiling every expression
    pub fn registers(&self) -> Result<Vec<Register>> {
        let mut seen = HashSet::new();
        let mut registers = Vec::with_capacity(self.registers.len());
        for entry in &self.registers {
            if !seen.insert(entry.name.as_str()) {
                return Err(ServiceError::config(format!(
                    "Duplicate register name: {}",
                    entry.name
                )));
            }
            let register = entry.to_register()?;
            register.validate()?;
            registers.push(register);
        }
        Ok(registers)
    }

    /// Compile derived values against the built `registers`
    pub fn derived(&self, registers: &[Register]) -> Result<Vec<Derived>> {
        let by_name: HashMap<&str, &Register> =
            registers.iter().map(|r| (r.name.as_str(), r)).collect();
        let mut seen = HashSet::new();
        let mut derived = Vec::with_capacity(self.derived.len());
        for entry in &self.derived {
            if by_name.contains_key(entry.name.as_str()) || !seen.insert(entry.name.as_str()) {
                return Err(ServiceError::config(format!(
                    "Duplicate derived name: {}",
                    entry.name
                )));
            }
            let calculation = Calculation::compile(None, &entry.expression)?;
            check_lookups(&entry.name, &calculation, &by_name)?;
            derived.push(Derived {
                name: entry.name.clone(),
                calculation,
                unit: entry.unit.clone(),
            });
        }
        Ok(derived)
    }

    /// Compile actuators; every target must be a writable register
    pub fn actuators(&self, registers: &[Register]) -> Result<Vec<Actuator>> {
        let by_name: HashMap<&str, &Register> =
            registers.iter().map(|r| (r.name.as_str(), r)).collect();
        let mut seen = HashSet::new();
        let mut actuators = Vec::with_capacity(self.actuators.len());
        for entry in &self.actuators {
            if !seen.insert(entry.name.as_str()) {
                return Err(ServiceError::config(format!(
                    "Duplicate actuator name: {}",
                    entry.name
                )));
            }
            if entry.registers.is_empty() {
                return Err(ServiceError::config(format!(
                    "Actuator {} has no registers",
                    entry.name
                )));
            }
            let mut targets = Vec::with_capacity(entry.registers.len());
            for (register, expression) in &entry.registers {
                match by_name.get(register.as_str()) {
                    Some(target) if target.writable => {},
                    Some(_) => {
                        return Err(ServiceError::config(format!(
                            "Actuator {}: register {register} is not writable",
                            entry.name
                        )))
                    },
                    None => {
                        return Err(ServiceError::config(format!(
                            "Actuator {}: unknown register {register}",
                            entry.name
                        )))
                    },
                }
                let calculation = Calculation::compile(Some(&entry.variable), expression)?;
                check_lookups(&entry.name, &calculation, &by_name)?;
                targets.push((register.clone(), calculation));
            }
            actuators.push(Actuator {
                name: entry.name.clone(),
                targets,
            });
        }
        Ok(actuators)
    }

    pub fn tcp_options(&self) -> TcpOptions {
        let device = &self.device;
        TcpOptions {
            unit_id: device.unit_id,
            connect_timeout: Duration::from_millis(device.connect_timeout_ms),
            request_timeout: Duration::from_millis(device.request_timeout_ms),
            idle_timeout: Duration::from_millis(device.idle_timeout_ms),
            ..TcpOptions::new(device.address.clone())
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_retries,
            Duration::from_millis(self.retry.initial_backoff_ms),
        )
    }

    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions {
            cache_ttl: Duration::from_millis(self.cache.ttl_ms),
            stabilization: RetryPolicy::with_attempts(
                self.stabilization.attempts,
                Duration::from_millis(self.stabilization.initial_backoff_ms),
            ),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll.interval_ms)
    }
}

fn check_lookups(
    owner: &str,
    calculation: &Calculation,
    registers: &HashMap<&str, &Register>,
) -> Result<()> {
    match calculation.lookups().find(|name| !registers.contains_key(name)) {
        Some(missing) => Err(ServiceError::config(format!(
            "{owner}: '{}' references unknown register {missing}",
            calculation.source()
        ))),
        None => Ok(()),
    }
}

impl RegisterEntry {
    pub fn to_register(&self) -> Result<Register> {
        let data_type: RegisterType = self.data_type.parse()?;
        let mut register =
            Register::new(self.name.clone(), self.address, data_type).with_length(self.length);
        if self.writable {
            register = register.writable();
        }
        if let Some(unit) = &self.unit {
            register = register.with_unit(unit.clone());
        }
        if let Some(mapping) = &self.mapping {
            register = register.with_mapping(mapping.compile(&self.name)?);
        }
        if let Some(validation) = &self.validation {
            register = register.with_validation(Predicate::compile(
                &validation.variable,
                &validation.expression,
            )?);
        }
        Ok(register)
    }
}

impl MappingEntry {
    fn compile(&self, register: &str) -> Result<Mapping> {
        match self {
            MappingEntry::Enum { values } => {
                let mut entries = Vec::with_capacity(values.len());
                for (key, label) in values {
                    let key: i64 = key.trim().parse().map_err(|_| {
                        ServiceError::config(format!(
                            "Register {register}: enum key '{key}' is not an integer"
                        ))
                    })?;
                    entries.push((key, label.clone()));
                }
                Ok(Mapping::Enum(EnumMap::new(entries)?))
            },
            MappingEntry::Formula { expression } => Ok(Mapping::Formula(Formula::compile(expression)?)),
        }
    }
}
