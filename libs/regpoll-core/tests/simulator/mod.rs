//! Modbus TCP simulator
//!
//! In-process server for FC03/FC04/FC16 with 0-based register tables. It can
//! drop connections on demand and make registers drift on every read.

#![allow(dead_code)]

use bytes::{Buf, BufMut, BytesMut};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info};

const ILLEGAL_FUNCTION: u8 = 0x01;
const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
const ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Highest wire address served
const ADDRESS_LIMIT: u32 = 2000;

#[derive(Debug, Default)]
struct DataModel {
    input_registers: HashMap<u16, u16>,
    holding_registers: HashMap<u16, u16>,
    writes: Vec<(u16, Vec<u16>)>,
    requests: usize,
    connections: usize,
    /// requests to answer by dropping the connection
    drop_next: usize,
    noisy: HashSet<u16>,
}

pub struct ModbusTcpSimulator {
    addr: SocketAddr,
    model: Arc<Mutex<DataModel>>,
}

impl ModbusTcpSimulator {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let model = Arc::new(Mutex::new(DataModel::default()));
        info!("Modbus TCP simulator listening on {}", addr);

        let accept_model = Arc::clone(&model);
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                debug!("New connection from {}", peer);
                accept_model.lock().await.connections += 1;
                let model = Arc::clone(&accept_model);
                tokio::spawn(async move {
                    let _ = Self::handle_client(stream, model).await;
                });
            }
        });

        Ok(Self { addr, model })
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub async fn set_input(&self, address: u16, values: &[u16]) {
        let mut model = self.model.lock().await;
        for (i, value) in values.iter().enumerate() {
            model.input_registers.insert(address + i as u16, *value);
        }
    }

    pub async fn set_holding(&self, address: u16, values: &[u16]) {
        let mut model = self.model.lock().await;
        for (i, value) in values.iter().enumerate() {
            model.holding_registers.insert(address + i as u16, *value);
        }
    }

    pub async fn holding(&self, address: u16) -> u16 {
        self.model
            .lock()
            .await
            .holding_registers
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    /// FC16 requests received, `(wire address, values)`
    pub async fn writes(&self) -> Vec<(u16, Vec<u16>)> {
        self.model.lock().await.writes.clone()
    }

    pub async fn requests(&self) -> usize {
        self.model.lock().await.requests
    }

    pub async fn connections(&self) -> usize {
        self.model.lock().await.connections
    }

    /// Drop the connection instead of answering the next `count` requests
    pub async fn inject_resets(&self, count: usize) {
        self.model.lock().await.drop_next = count;
    }

    /// Holding register that increments on every read
    pub async fn add_noisy(&self, address: u16) {
        self.model.lock().await.noisy.insert(address);
    }

    async fn handle_client(
        mut stream: TcpStream,
        model: Arc<Mutex<DataModel>>,
    ) -> std::io::Result<()> {
        let mut buffer = BytesMut::with_capacity(1024);
        loop {
            let n = stream.read_buf(&mut buffer).await?;
            if n == 0 {
                return Ok(());
            }

            while buffer.len() >= 7 {
                let length = usize::from(u16::from_be_bytes([buffer[4], buffer[5]]));
                let frame_length = 6 + length;
                if buffer.len() < frame_length {
                    break;
                }
                let frame = buffer.split_to(frame_length);

                let response = {
                    let mut model = model.lock().await;
                    model.requests += 1;
                    if model.drop_next > 0 {
                        model.drop_next -= 1;
                        debug!("Dropping connection on request");
                        return Ok(());
                    }
                    Self::process_request(&frame, &mut model)
                };
                stream.write_all(&response).await?;
                stream.flush().await?;
            }
        }
    }

    fn process_request(frame: &[u8], model: &mut DataModel) -> Vec<u8> {
        let mut header = &frame[..7];
        let transaction_id = header.get_u16();
        let _protocol_id = header.get_u16();
        let _length = header.get_u16();
        let unit_id = header.get_u8();

        let mut pdu = &frame[7..];
        let function = pdu.get_u8();
        debug!("Request: Unit={}, Function=0x{:02X}", unit_id, function);

        let body = match function {
            0x03 | 0x04 => Self::read_registers(function, pdu, model),
            0x10 => Self::write_multiple_registers(pdu, model),
            _ => Err(ILLEGAL_FUNCTION),
        };

        let mut response_pdu = BytesMut::new();
        match body {
            Ok(bytes) => {
                response_pdu.put_u8(function);
                response_pdu.extend_from_slice(&bytes);
            },
            Err(code) => {
                response_pdu.put_u8(function | 0x80);
                response_pdu.put_u8(code);
            },
        }

        let mut response = BytesMut::with_capacity(7 + response_pdu.len());
        response.put_u16(transaction_id);
        response.put_u16(0);
        response.put_u16((response_pdu.len() + 1) as u16);
        response.put_u8(unit_id);
        response.extend_from_slice(&response_pdu);
        response.to_vec()
    }

    fn read_registers(function: u8, mut pdu: &[u8], model: &mut DataModel) -> Result<Vec<u8>, u8> {
        if pdu.remaining() < 4 {
            return Err(ILLEGAL_DATA_VALUE);
        }
        let address = pdu.get_u16();
        let quantity = pdu.get_u16();
        if quantity == 0 || quantity > 125 {
            return Err(ILLEGAL_DATA_VALUE);
        }
        if u32::from(address) + u32::from(quantity) > ADDRESS_LIMIT {
            return Err(ILLEGAL_DATA_ADDRESS);
        }

        let mut body = vec![(quantity * 2) as u8];
        for a in address..address + quantity {
            let value = if function == 0x03 {
                if model.noisy.contains(&a) {
                    let entry = model.holding_registers.entry(a).or_insert(0);
                    *entry = entry.wrapping_add(1);
                }
                model.holding_registers.get(&a).copied().unwrap_or(0)
            } else {
                model.input_registers.get(&a).copied().unwrap_or(0)
            };
            body.extend_from_slice(&value.to_be_bytes());
        }
        Ok(body)
    }

    fn write_multiple_registers(mut pdu: &[u8], model: &mut DataModel) -> Result<Vec<u8>, u8> {
        if pdu.remaining() < 5 {
            return Err(ILLEGAL_DATA_VALUE);
        }
        let address = pdu.get_u16();
        let quantity = pdu.get_u16();
        let byte_count = usize::from(pdu.get_u8());
        if quantity == 0 || byte_count != usize::from(quantity) * 2 || pdu.remaining() < byte_count {
            return Err(ILLEGAL_DATA_VALUE);
        }
        if u32::from(address) + u32::from(quantity) > ADDRESS_LIMIT {
            return Err(ILLEGAL_DATA_ADDRESS);
        }

        let values: Vec<u16> = (0..quantity).map(|_| pdu.get_u16()).collect();
        for (i, value) in values.iter().enumerate() {
            model.holding_registers.insert(address + i as u16, *value);
        }
        model.writes.push((address, values));

        let mut body = Vec::with_capacity(4);
        body.extend_from_slice(&address.to_be_bytes());
        body.extend_from_slice(&quantity.to_be_bytes());
        Ok(body)
    }
}
