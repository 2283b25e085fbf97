//! Register Polling Core
//!
//! Register-access engine for devices speaking a length-limited register
//! protocol (Modbus TCP).
//!
//! # Architecture
//!
//! This library provides:
//! - **Interval algebra**: merging configured ranges into disjoint covers
//! - **Codec**: 16/32-bit integers (low word first), arrays and strings
//! - **Mapping**: enum lookups and invertible arithmetic formulas, plus write
//!   validation predicates
//! - **Cache**: one TTL cache per register class with single-flight refresh
//! - **Transport**: chunking, retrying Modbus TCP client
//! - **Coalescer**: merged writes confirmed by read-back stabilization
//! - **Device**: the facade tying it together

pub mod cache;
pub mod codec;
pub mod coalescer;
pub mod device;
pub mod error;
pub mod expr;
pub mod interval;
pub mod mapping;
pub mod register;
pub mod transport;

// Re-export core types
pub use cache::RegisterCache;
pub use codec::RegisterType;
pub use coalescer::{WriteCoalescer, WrittenRegisters};
pub use device::{precompute_intervals, Device, DeviceOptions};
pub use error::{RegisterError, Result, TransportError};
pub use interval::{Address, AddressInterval, MergedRange};
pub use mapping::{Calculation, EnumMap, Formula, Mapping, Predicate};
pub use register::{Register, RegisterValue, WriteValue};
pub use transport::{
    ModbusTcpClient, ProtocolClient, RegisterClass, RegisterIo, RetryPolicy, TcpOptions,
    Transport,
};
