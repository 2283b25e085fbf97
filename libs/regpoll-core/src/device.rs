//! Device facade
//!
//! Owns the register table, the two class caches and the coalescer over one
//! shared `RegisterIo`. This is the surface the service adapters call.

use crate::cache::{RegisterCache, DEFAULT_TTL};
use crate::coalescer::{WriteCoalescer, WrittenRegisters};
use crate::error::{RegisterError, Result};
use crate::interval::{merge, AddressInterval};
use crate::register::{Register, RegisterValue, WriteValue};
use crate::transport::{RegisterClass, RegisterIo, RetryPolicy};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Compute the read cover (input registers) and write cover (holding registers)
pub fn precompute_intervals(
    registers: &[Register],
) -> Result<(Vec<AddressInterval>, Vec<AddressInterval>)> {
    let mut read = Vec::new();
    let mut write = Vec::new();
    for register in registers {
        let interval = register.interval()?;
        match register.class() {
            RegisterClass::Input => read.push(interval),
            RegisterClass::Holding => write.push(interval),
        }
    }
    Ok((merge(read), merge(write)))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceOptions {
    pub cache_ttl: Duration,
    pub stabilization: RetryPolicy,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_TTL,
            stabilization: RetryPolicy::stabilization(),
        }
    }
}

pub struct Device<T> {
    registers: HashMap<String, Register>,
    /// Configuration order
    names: Vec<String>,
    io: Arc<T>,
    read_cache: RegisterCache,
    write_cache: RegisterCache,
    coalescer: WriteCoalescer,
}

impl<T: RegisterIo> Device<T> {
    pub fn new(registers: Vec<Register>, io: Arc<T>, options: DeviceOptions) -> Result<Self> {
        for register in &registers {
            register.validate()?;
        }
        let (read_cover, write_cover) = precompute_intervals(&registers)?;

        let mut names = Vec::with_capacity(registers.len());
        let mut table = HashMap::with_capacity(registers.len());
        for register in registers {
            if table.contains_key(&register.name) {
                return Err(RegisterError::config(format!(
                    "Duplicate register name '{}'",
                    register.name
                )));
            }
            names.push(register.name.clone());
            table.insert(register.name.clone(), register);
        }
        info!(
            "Device: {} registers, read cover {}, write cover {}",
            names.len(),
            read_cover.len(),
            write_cover.len()
        );

        Ok(Self {
            registers: table,
            names,
            io,
            read_cache: RegisterCache::new(read_cover, RegisterClass::Input, options.cache_ttl),
            write_cache: RegisterCache::new(write_cover, RegisterClass::Holding, options.cache_ttl),
            coalescer: WriteCoalescer::new(options.stabilization),
        })
    }

    pub fn register(&self, name: &str) -> Result<&Register> {
        self.registers
            .get(name)
            .ok_or_else(|| RegisterError::UnknownRegister(name.to_string()))
    }

    /// Registers in configuration order
    pub fn registers(&self) -> impl Iterator<Item = &Register> {
        self.names.iter().filter_map(|name| self.registers.get(name))
    }

    /// Read and write covers
    pub fn covers(&self) -> (&[AddressInterval], &[AddressInterval]) {
        (self.read_cache.cover(), self.write_cache.cover())
    }

    pub fn io(&self) -> &Arc<T> {
        &self.io
    }

    fn cache_for(&self, register: &Register) -> &RegisterCache {
        match register.class() {
            RegisterClass::Input => &self.read_cache,
            RegisterClass::Holding => &self.write_cache,
        }
    }

    async fn read_words(&self, register: &Register) -> Result<Vec<u16>> {
        let interval = register.interval()?;
        let quantity = u16::try_from(interval.len())
            .map_err(|_| RegisterError::config(format!("Register {} too large", register.name)))?;
        self.cache_for(register)
            .read(self.io.as_ref(), register.address, quantity)
            .await
    }

    pub async fn read_register(&self, name: &str) -> Result<RegisterValue> {
        let register = self.register(name)?;
        let words = self.read_words(register).await?;
        register.decode(&words)
    }

    /// Numeric value of element `index`
    pub async fn read_value(&self, name: &str, index: u16) -> Result<f64> {
        let register = self.register(name)?;
        let words = self.read_words(register).await?;
        register.decode_numeric(&words, index)
    }

    /// Scrape path: any failure degrades to NaN
    pub async fn read_value_or_nan(&self, name: &str, index: u16) -> f64 {
        match self.read_value(name, index).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Read {}[{}] failed: {}", name, index, e);
                f64::NAN
            },
        }
    }

    pub async fn write_register(
        &self,
        name: &str,
        value: impl Into<WriteValue>,
    ) -> Result<WrittenRegisters> {
        self.write_registers(&[(name.to_string(), value.into())])
            .await
    }

    /// Write a batch as coalesced ranges and confirm each by read-back
    pub async fn write_registers(&self, batch: &[(String, WriteValue)]) -> Result<WrittenRegisters> {
        let known = self.lookup_values(batch).await?;
        let ranges = self.coalescer.prepare(&self.registers, batch, &known)?;

        let result = self
            .coalescer
            .execute(self.io.as_ref(), &self.registers, ranges)
            .await;
        self.write_cache.invalidate().await;
        result
    }

    /// Values referenced by the validation predicates of a batch
    async fn lookup_values(&self, batch: &[(String, WriteValue)]) -> Result<HashMap<String, f64>> {
        let mut known = HashMap::new();
        for (name, _) in batch {
            let Some(predicate) = self
                .registers
                .get(name)
                .and_then(|register| register.validation.as_ref())
            else {
                continue;
            };
            for lookup in predicate.lookups() {
                if known.contains_key(lookup) {
                    continue;
                }
                match self.read_value(lookup, 0).await {
                    Ok(value) => {
                        known.insert(lookup.to_string(), value);
                    },
                    Err(RegisterError::UnknownRegister(_)) => {
                        warn!("Validation of {} references unknown register {}", name, lookup);
                    },
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(known)
    }
}
