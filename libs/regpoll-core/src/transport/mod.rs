//! Register transport
//!
//! # Architecture
//!
//! ```text
//! Transport<C> (RegisterIo)      1-based addresses, chunking, retry
//!     └── ProtocolClient         one request per call, 0-based addresses
//!         └── ModbusTcpClient    voltage_modbus TCP client, rebuilt on error
//! ```
//!
//! The client sits behind a mutex, so requests on the shared connection are
//! serialized. The mutex is released between attempts, never held across a
//! backoff sleep.

pub mod client;
pub mod retry;

pub use client::{ModbusTcpClient, TcpOptions};
pub use retry::{classify, ErrorClass, RetryFailure, RetryPolicy};

use crate::error::{RegisterError, Result, TransportError};
use crate::interval::Address;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use voltage_modbus::constants;

/// Registers per FC 0x03/0x04 request
pub const MAX_READ_REGISTERS: u16 = constants::MAX_READ_REGISTERS as u16;
/// Registers per FC 0x10 request
pub const MAX_WRITE_REGISTERS: u16 = constants::MAX_WRITE_REGISTERS as u16;

/// Register table a read is served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterClass {
    /// Read-only measurements (FC 0x04)
    Input,
    /// Read/write set-points (FC 0x03)
    Holding,
}

impl RegisterClass {
    pub fn function_code(self) -> u8 {
        match self {
            RegisterClass::Input => constants::FC_READ_INPUT_REGISTERS,
            RegisterClass::Holding => constants::FC_READ_HOLDING_REGISTERS,
        }
    }
}

impl fmt::Display for RegisterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterClass::Input => f.write_str("input"),
            RegisterClass::Holding => f.write_str("holding"),
        }
    }
}

/// Word-level register access with 1-based addresses
#[async_trait]
pub trait RegisterIo: Send + Sync {
    async fn read(&self, address: Address, quantity: u16, class: RegisterClass)
        -> Result<Vec<u16>>;

    async fn write(&self, address: Address, values: &[u16]) -> Result<()>;
}

/// A single wire request per call, 0-based addresses
#[async_trait]
pub trait ProtocolClient: Send {
    async fn read_registers(
        &mut self,
        class: RegisterClass,
        address: u16,
        quantity: u16,
    ) -> std::result::Result<Vec<u16>, TransportError>;

    async fn write_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> std::result::Result<(), TransportError>;

    /// Drop the connection so the next request reconnects
    async fn close(&mut self);
}

/// Chunking, retrying transport over one protocol client
pub struct Transport<C> {
    client: Mutex<C>,
    policy: RetryPolicy,
}

impl<C: ProtocolClient> Transport<C> {
    pub fn new(client: C) -> Self {
        Self::with_policy(client, RetryPolicy::requests())
    }

    pub fn with_policy(client: C, policy: RetryPolicy) -> Self {
        Self {
            client: Mutex::new(client),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn read_chunk(
        &self,
        address: u16,
        quantity: u16,
        class: RegisterClass,
    ) -> Result<Vec<u16>> {
        let client = &self.client;
        let words = self
            .policy
            .run(
                move |_| async move {
                    let mut client = client.lock().await;
                    let result = client.read_registers(class, address, quantity).await;
                    if result.is_err() {
                        client.close().await;
                    }
                    result
                },
                classify,
            )
            .await
            .map_err(|failure| {
                into_register_error(failure, format!("read {class} {address}+{quantity}"))
            })?;

        if words.len() != usize::from(quantity) {
            return Err(RegisterError::Transport {
                operation: format!("read {class} {address}+{quantity}"),
                source: TransportError::protocol(format!(
                    "expected {quantity} registers, got {}",
                    words.len()
                )),
            });
        }
        Ok(words)
    }

    async fn write_chunk(&self, address: u16, values: &[u16]) -> Result<()> {
        let client = &self.client;
        self.policy
            .run(
                move |_| async move {
                    let mut client = client.lock().await;
                    let result = client.write_registers(address, values).await;
                    if result.is_err() {
                        client.close().await;
                    }
                    result
                },
                classify,
            )
            .await
            .map_err(|failure| {
                into_register_error(failure, format!("write {address}+{}", values.len()))
            })
    }
}

fn into_register_error(failure: RetryFailure<TransportError>, operation: String) -> RegisterError {
    match failure {
        RetryFailure::Fatal(source) => RegisterError::Transport { operation, source },
        RetryFailure::Exhausted { attempts, last } => {
            warn!("Retries exhausted after {} attempts: {}", attempts, operation);
            RegisterError::TransportExhausted {
                operation,
                source: last,
            }
        },
    }
}

/// Translate a 1-based range to 0-based wire addressing
fn wire_address(address: Address, quantity: usize) -> Result<u16> {
    let wire = address.checked_sub(1).ok_or_else(|| RegisterError::Transport {
        operation: format!("access {address}+{quantity}"),
        source: TransportError::protocol("register addresses are 1-based, got 0"),
    })?;
    if usize::from(wire) + quantity > usize::from(u16::MAX) + 1 {
        return Err(RegisterError::Transport {
            operation: format!("access {address}+{quantity}"),
            source: TransportError::protocol("range exceeds the address space"),
        });
    }
    Ok(wire)
}

#[async_trait]
impl<C: ProtocolClient> RegisterIo for Transport<C> {
    async fn read(
        &self,
        address: Address,
        quantity: u16,
        class: RegisterClass,
    ) -> Result<Vec<u16>> {
        let base = wire_address(address, usize::from(quantity))?;
        let mut words = Vec::with_capacity(usize::from(quantity));
        let mut offset = 0u16;
        while offset < quantity {
            let chunk = (quantity - offset).min(MAX_READ_REGISTERS);
            debug!("Read {} chunk {}+{}", class, base + offset, chunk);
            words.extend(self.read_chunk(base + offset, chunk, class).await?);
            offset += chunk;
        }
        Ok(words)
    }

    async fn write(&self, address: Address, values: &[u16]) -> Result<()> {
        let base = wire_address(address, values.len())?;
        for (i, chunk) in values.chunks(usize::from(MAX_WRITE_REGISTERS)).enumerate() {
            let offset = (i * usize::from(MAX_WRITE_REGISTERS)) as u16;
            debug!("Write chunk {}+{}", base + offset, chunk.len());
            self.write_chunk(base + offset, chunk).await?;
        }
        Ok(())
    }
}
