//! Write coalescing and read-back stabilization
//!
//! A batch of single-register writes is resolved to raw words, validated and
//! merged into contiguous ranges. Each range goes out as one write and is
//! then read back until the device reports the written values.

use crate::error::{RegisterError, Result};
use crate::interval::{merge_with_payload, Address, AddressInterval, MergedRange};
use crate::register::{Register, RegisterValue, WriteValue};
use crate::transport::{RegisterClass, RegisterIo, RetryPolicy};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// One resolved register write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub name: String,
    pub address: Address,
    pub word: u16,
}

/// Registers confirmed by a write, in address order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WrittenRegisters(pub Vec<(String, RegisterValue)>);

impl WrittenRegisters {
    pub fn get(&self, name: &str) -> Option<&RegisterValue> {
        self.0
            .iter()
            .find(|(written, _)| written == name)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for WrittenRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WriteCoalescer {
    stabilization: RetryPolicy,
}

impl Default for WriteCoalescer {
    fn default() -> Self {
        Self::new(RetryPolicy::stabilization())
    }
}

impl WriteCoalescer {
    pub fn new(stabilization: RetryPolicy) -> Self {
        Self { stabilization }
    }

    /// Resolve, validate and merge a batch into write ranges.
    ///
    /// `known` supplies the values of registers referenced by validation
    /// predicates.
    pub fn prepare(
        &self,
        registers: &HashMap<String, Register>,
        batch: &[(String, WriteValue)],
        known: &HashMap<String, f64>,
    ) -> Result<Vec<MergedRange<PendingWrite>>> {
        let mut seen = HashSet::new();
        let mut pending = Vec::with_capacity(batch.len());

        for (name, value) in batch {
            if !seen.insert(name.as_str()) {
                return Err(RegisterError::validation(
                    name,
                    "register listed twice in one write",
                ));
            }
            let register = registers
                .get(name)
                .ok_or_else(|| RegisterError::UnknownRegister(name.clone()))?;
            let resolved = register.resolve_write(value)?;

            if let Some(predicate) = &register.validation {
                if !predicate.evaluate(name, resolved.domain, known)? {
                    return Err(RegisterError::validation(
                        name,
                        format!("{value} rejected by '{}'", predicate.source()),
                    ));
                }
            }

            debug!("Resolved {}={} to word {:#06x}", name, value, resolved.word);
            pending.push(MergedRange::new(
                AddressInterval::single(register.address),
                PendingWrite {
                    name: name.clone(),
                    address: register.address,
                    word: resolved.word,
                },
            ));
        }

        let ranges = merge_with_payload(pending);
        for range in &ranges {
            if let Some(pair) = range
                .payload
                .windows(2)
                .find(|pair| pair[0].address == pair[1].address)
            {
                return Err(RegisterError::validation(
                    &pair[1].name,
                    format!("shares address {} with {}", pair[1].address, pair[0].name),
                ));
            }
        }
        Ok(ranges)
    }

    /// Write each range once, then wait for the device to confirm it
    pub async fn execute<T>(
        &self,
        io: &T,
        registers: &HashMap<String, Register>,
        ranges: Vec<MergedRange<PendingWrite>>,
    ) -> Result<WrittenRegisters>
    where
        T: RegisterIo + ?Sized,
    {
        let mut written = Vec::new();
        for range in ranges {
            let values: Vec<u16> = range.payload.iter().map(|write| write.word).collect();
            let names: Vec<&str> = range.payload.iter().map(|write| write.name.as_str()).collect();
            info!("Write {}: {}", range.interval, names.join(", "));

            io.write(range.interval.start, &values).await?;
            let read_back = self
                .stabilize(io, names[0], range.interval.start, &values)
                .await?;

            for (write, word) in range.payload.iter().zip(read_back) {
                let value = match registers.get(&write.name) {
                    Some(register) => register.decode(&[word])?,
                    None => RegisterValue::Integer(i64::from(word)),
                };
                written.push((write.name.clone(), value));
            }
        }
        Ok(WrittenRegisters(written))
    }

    /// Read back until every stable index matches `expected`.
    ///
    /// Indexes that changed between two consecutive mismatching reads are
    /// treated as noise and excluded from the comparison. `first` names the
    /// register at `address`.
    pub async fn stabilize<T>(
        &self,
        io: &T,
        first: &str,
        address: Address,
        expected: &[u16],
    ) -> Result<Vec<u16>>
    where
        T: RegisterIo + ?Sized,
    {
        let quantity = u16::try_from(expected.len()).map_err(|_| {
            RegisterError::validation(
                first,
                format!("write range of {} words is too long", expected.len()),
            )
        })?;
        let mut history: Vec<Vec<u16>> = Vec::new();
        let mut unstable: Vec<usize> = Vec::new();

        for attempt in 0..self.stabilization.total_attempts() {
            if attempt > 0 {
                sleep(self.stabilization.backoff(attempt)).await;
            }
            let words = io.read(address, quantity, RegisterClass::Holding).await?;
            if matches_ignoring(&words, expected, &unstable) {
                if attempt > 0 {
                    debug!("Write {}+{} stable after {} reads", address, quantity, attempt + 1);
                }
                return Ok(words);
            }

            if let Some(previous) = history.last() {
                unstable.extend(
                    previous
                        .iter()
                        .zip(&words)
                        .enumerate()
                        .filter(|(_, (a, b))| a != b)
                        .map(|(i, _)| i),
                );
                unstable.sort_unstable();
                unstable.dedup();
                if !unstable.is_empty() {
                    warn!("Unstable indexes at {}: {:?}", address, unstable);
                }
            }
            history.push(words);
        }

        Err(RegisterError::StabilizationTimeout {
            address,
            quantity,
            expected: expected.to_vec(),
            last_read: history.pop().unwrap_or_default(),
        })
    }
}

fn matches_ignoring(actual: &[u16], expected: &[u16], ignored: &[usize]) -> bool {
    actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected)
            .enumerate()
            .all(|(i, (a, e))| a == e || ignored.binary_search(&i).is_ok())
}
