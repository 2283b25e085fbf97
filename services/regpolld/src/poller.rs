//! Periodic polling loop

use regpoll_core::{Calculation, Device, RegisterIo, RegisterType, RegisterValue};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// One sampled register element
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub name: String,
    pub index: u16,
    pub value: RegisterValue,
    pub unit: Option<String>,
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]={}", self.name, self.index, self.value)?;
        if let Some(unit) = &self.unit {
            write!(f, " {unit}")?;
        }
        Ok(())
    }
}

/// Value computed from other registers on every poll
#[derive(Debug, Clone, PartialEq)]
pub struct Derived {
    pub name: String,
    pub calculation: Calculation,
    pub unit: Option<String>,
}

pub struct Poller<T> {
    device: Arc<Device<T>>,
    interval: Duration,
    derived: Vec<Derived>,
}

impl<T: RegisterIo> Poller<T> {
    pub fn new(device: Arc<Device<T>>, interval: Duration) -> Self {
        Self {
            device,
            interval,
            derived: Vec::new(),
        }
    }

    pub fn with_derived(mut self, derived: Vec<Derived>) -> Self {
        self.derived = derived;
        self
    }

    /// Sample every register once. Numeric failures show up as NaN.
    pub async fn poll_once(&self) -> Vec<Measurement> {
        let mut measurements = Vec::new();
        for register in self.device.registers() {
            if register.data_type == RegisterType::String {
                match self.device.read_register(&register.name).await {
                    Ok(value) => measurements.push(Measurement {
                        name: register.name.clone(),
                        index: 0,
                        value,
                        unit: register.unit.clone(),
                    }),
                    Err(e) => warn!("Read {} failed: {}", register.name, e),
                }
                continue;
            }
            for index in 0..register.length {
                let value = self.device.read_value_or_nan(&register.name, index).await;
                measurements.push(Measurement {
                    name: register.name.clone(),
                    index,
                    value: RegisterValue::Float(value),
                    unit: register.unit.clone(),
                });
            }
        }
        for derived in &self.derived {
            let value = self.evaluate(derived).await;
            measurements.push(Measurement {
                name: derived.name.clone(),
                index: 0,
                value: RegisterValue::Float(value),
                unit: derived.unit.clone(),
            });
        }
        measurements
    }

    /// Lookups come from the read cache, so they cost no extra requests
    /// within the TTL. Failures degrade to NaN.
    async fn evaluate(&self, derived: &Derived) -> f64 {
        let mut known = HashMap::new();
        for lookup in derived.calculation.lookups() {
            let value = self.device.read_value_or_nan(lookup, 0).await;
            known.insert(lookup.to_string(), value);
        }
        match derived.calculation.evaluate(f64::NAN, &known) {
            Ok(value) => value,
            Err(e) => {
                warn!("Derived {} failed: {}", derived.name, e);
                f64::NAN
            },
        }
    }

    /// Poll until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        info!("Polling started, interval {:?}", self.interval);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Polling stopped");
                    break;
                }
                _ = ticker.tick() => {
                    for measurement in self.poll_once().await {
                        info!("{}", measurement);
                    }
                }
            }
        }
    }
}
