//! Named actuators
//!
//! An actuator maps one input value onto several holding registers, each
//! through its own calculation, and writes them as one coalesced batch.

use crate::error::Result;
use regpoll_core::{Calculation, Device, RegisterIo, WriteValue, WrittenRegisters};
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct Actuator {
    pub name: String,
    /// `(register, calculation of the input)` in config order
    pub targets: Vec<(String, Calculation)>,
}

impl Actuator {
    /// Evaluate every target for `input`
    pub async fn resolve<T: RegisterIo>(
        &self,
        device: &Device<T>,
        input: f64,
    ) -> Result<Vec<(String, WriteValue)>> {
        let mut known = HashMap::new();
        for (_, calculation) in &self.targets {
            for lookup in calculation.lookups() {
                if !known.contains_key(lookup) {
                    let value = device.read_value(lookup, 0).await?;
                    known.insert(lookup.to_string(), value);
                }
            }
        }

        let mut batch = Vec::with_capacity(self.targets.len());
        for (register, calculation) in &self.targets {
            let value = calculation.evaluate(input, &known)?;
            batch.push((register.clone(), WriteValue::Number(value)));
        }
        Ok(batch)
    }

    pub async fn actuate<T: RegisterIo>(
        &self,
        device: &Device<T>,
        input: f64,
    ) -> Result<WrittenRegisters> {
        let batch = self.resolve(device, input).await?;
        info!("Actuator {}={} -> {} registers", self.name, input, batch.len());
        Ok(device.write_registers(&batch).await?)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use async_trait::async_trait;
    use regpoll_core::{
        Address, DeviceOptions, EnumMap, Mapping, Register, RegisterClass, RegisterType,
        RegisterValue,
    };
    use std::sync::{Arc, Mutex};

    /// Holding table that applies writes immediately
    #[derive(Default)]
    struct Memory {
        words: Mutex<HashMap<Address, u16>>,
        writes: Mutex<Vec<(Address, Vec<u16>)>>,
    }

    #[async_trait]
    impl RegisterIo for Memory {
        async fn read(
            &self,
            address: Address,
            quantity: u16,
            _class: RegisterClass,
        ) -> regpoll_core::Result<Vec<u16>> {
            let words = self.words.lock().unwrap();
            Ok((address..address + quantity)
                .map(|a| words.get(&a).copied().unwrap_or(0))
                .collect())
        }

        async fn write(&self, address: Address, values: &[u16]) -> regpoll_core::Result<()> {
            let mut words = self.words.lock().unwrap();
            for (i, v) in values.iter().enumerate() {
                words.insert(address + i as u16, *v);
            }
            self.writes.lock().unwrap().push((address, values.to_vec()));
            Ok(())
        }
    }

    fn device(memory: Memory) -> Device<Memory> {
        let registers = vec![
            Register::new("mode", 10, RegisterType::U16).writable(),
            Register::new("switch", 11, RegisterType::U16)
                .writable()
                .with_mapping(Mapping::Enum(EnumMap::new([(0, "OFF"), (1, "ON")]).unwrap())),
            Register::new("scale", 20, RegisterType::U16).writable(),
        ];
        Device::new(registers, Arc::new(memory), DeviceOptions::default()).unwrap()
    }

    fn calculation(expression: &str) -> Calculation {
        Calculation::compile(Some("value"), expression).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_actuate_writes_one_batch() {
        let device = device(Memory::default());
        let actuator = Actuator {
            name: "start".to_string(),
            targets: vec![
                ("switch".to_string(), calculation("1")),
                ("mode".to_string(), calculation("value * 2")),
            ],
        };

        let written = actuator.actuate(&device, 3.0).await.unwrap();
        assert_eq!(written.get("switch"), Some(&RegisterValue::Label("ON".into())));
        assert_eq!(written.get("mode"), Some(&RegisterValue::Integer(6)));
        // adjacent addresses share one request
        assert_eq!(*device.io().writes.lock().unwrap(), vec![(10, vec![6, 1])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_reads_lookups() {
        let memory = Memory::default();
        memory.words.lock().unwrap().insert(20, 4);
        let device = device(memory);
        let actuator = Actuator {
            name: "scaled".to_string(),
            targets: vec![(
                "mode".to_string(),
                calculation("value * register('scale')"),
            )],
        };

        let batch = actuator.resolve(&device, 2.5).await.unwrap();
        assert_eq!(batch, vec![("mode".to_string(), WriteValue::Number(10.0))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmapped_enum_value_is_rejected() {
        let device = device(Memory::default());
        let actuator = Actuator {
            name: "toggle".to_string(),
            targets: vec![("switch".to_string(), calculation("value"))],
        };

        assert!(actuator.actuate(&device, 7.0).await.is_err());
        assert!(device.io().writes.lock().unwrap().is_empty());
    }
}
