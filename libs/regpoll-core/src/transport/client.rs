//! Modbus TCP client over `voltage_modbus`
//!
//! The underlying client is built lazily, dropped on `close()` and rebuilt with
//! `from_address` on the next request. A link idle for longer than the idle
//! timeout is rebuilt before use.

use super::{ProtocolClient, RegisterClass};
use crate::error::TransportError;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use voltage_modbus::{ModbusClient as VoltageModbusClient, ModbusError as VoltageError};

pub const DEFAULT_UNIT_ID: u8 = 1;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP link settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpOptions {
    /// `ip:port`
    pub address: String,
    pub unit_id: u8,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
}

impl TcpOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            unit_id: DEFAULT_UNIT_ID,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Single-connection Modbus TCP client
pub struct ModbusTcpClient {
    options: TcpOptions,
    client: Option<voltage_modbus::ModbusTcpClient>,
    last_activity: Instant,
}

impl ModbusTcpClient {
    pub fn new(options: TcpOptions) -> Self {
        Self {
            options,
            client: None,
            last_activity: Instant::now(),
        }
    }

    pub fn options(&self) -> &TcpOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn connect(&mut self) -> Result<&mut voltage_modbus::ModbusTcpClient, TransportError> {
        if self.client.is_some() && self.last_activity.elapsed() > self.options.idle_timeout {
            debug!("TCP idle, reconnecting: {}", self.options.address);
            self.close().await;
        }

        let client = match self.client.take() {
            Some(client) => client,
            None => {
                let address = &self.options.address;
                debug!("TCP connecting: {}", address);
                let connecting = voltage_modbus::ModbusTcpClient::from_address(
                    address,
                    self.options.request_timeout,
                );
                let client = match timeout(self.options.connect_timeout, connecting).await {
                    Ok(Ok(client)) => client,
                    Ok(Err(e)) => {
                        warn!("TCP err: {} - {}", address, e);
                        return Err(connect_error(e));
                    },
                    Err(_) => {
                        warn!("TCP timeout: {}", address);
                        return Err(timed_out(format!("connection to {address} timed out")));
                    },
                };
                info!("TCP connected: {}", address);
                self.last_activity = Instant::now();
                client
            },
        };
        Ok(self.client.insert(client))
    }
}

fn timed_out(message: impl Into<String>) -> TransportError {
    TransportError::Io(io::Error::new(io::ErrorKind::TimedOut, message.into()))
}

/// A failed connect is fatal unless it timed out
fn connect_error(error: VoltageError) -> TransportError {
    match error {
        VoltageError::Timeout { .. } => timed_out(error.to_string()),
        other => TransportError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            other.to_string(),
        )),
    }
}

/// Request errors other than exceptions and malformed frames mean the link is
/// gone and a reconnect may help
fn request_error(error: VoltageError) -> TransportError {
    match error {
        VoltageError::Timeout { .. } => timed_out(error.to_string()),
        VoltageError::Exception { function, code, .. } => {
            TransportError::Exception { function, code }
        },
        VoltageError::Frame { .. } => TransportError::protocol(error.to_string()),
        other => TransportError::Io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            other.to_string(),
        )),
    }
}

#[async_trait]
impl ProtocolClient for ModbusTcpClient {
    async fn read_registers(
        &mut self,
        class: RegisterClass,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let unit_id = self.options.unit_id;
        let client = self.connect().await?;
        let result = match class {
            RegisterClass::Input => client.read_04(unit_id, address, quantity).await,
            RegisterClass::Holding => client.read_03(unit_id, address, quantity).await,
        };
        let words = result.map_err(request_error)?;
        debug!("TCP RX: {} {}+{} -> {} words", class, address, quantity, words.len());
        self.last_activity = Instant::now();
        Ok(words)
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), TransportError> {
        let unit_id = self.options.unit_id;
        let client = self.connect().await?;
        client
            .write_10(unit_id, address, values)
            .await
            .map_err(request_error)?;
        debug!("TCP TX: write {}+{}", address, values.len());
        self.last_activity = Instant::now();
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut client) = self.client.take() {
            if let Err(e) = client.close().await {
                debug!("TCP close: {} - {}", self.options.address, e);
            }
            debug!("TCP closed: {}", self.options.address);
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_starts_disconnected() {
        let client = ModbusTcpClient::new(TcpOptions::new("127.0.0.1:502"));
        assert!(!client.is_connected());
        assert_eq!(client.options().unit_id, DEFAULT_UNIT_ID);
        assert_eq!(client.options().idle_timeout, DEFAULT_IDLE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_refused_connection_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut client = ModbusTcpClient::new(TcpOptions::new(address));
        let err = client
            .read_registers(RegisterClass::Input, 0, 1)
            .await
            .unwrap_err();
        assert!(!err.is_transient(), "unexpected error {err:?}");
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_unparsable_address_is_fatal() {
        let mut client = ModbusTcpClient::new(TcpOptions::new("not an address"));
        let err = client
            .write_registers(0, &[1])
            .await
            .unwrap_err();
        assert!(!err.is_transient(), "unexpected error {err:?}");
    }

    #[test]
    fn test_request_error_mapping() {
        let timeout = request_error(VoltageError::Timeout {
            operation: "read".to_string(),
            timeout_ms: 3000,
        });
        assert!(timeout.is_transient());

        let exception = request_error(VoltageError::Exception {
            function: 0x04,
            code: 0x02,
            message: "illegal data address",
        });
        assert!(matches!(
            exception,
            TransportError::Exception {
                function: 0x04,
                code: 0x02
            }
        ));

        let frame = request_error(VoltageError::Frame {
            message: "short frame".to_string(),
        });
        assert!(matches!(frame, TransportError::Protocol(_)));
    }

    #[test]
    fn test_connect_timeout_stays_transient() {
        let err = connect_error(VoltageError::Timeout {
            operation: "connect".to_string(),
            timeout_ms: 3000,
        });
        assert!(err.is_transient());
    }
}
