//! Register descriptors and exposed values

use crate::codec::{decode_array, decode_integer, decode_string, encode_integer, RegisterType};
use crate::error::{RegisterError, Result};
use crate::interval::{Address, AddressInterval};
use crate::mapping::{EnumMap, Mapping, Predicate};
use crate::transport::RegisterClass;
use std::fmt;

/// A configured register
#[derive(Debug, Clone, PartialEq)]
pub struct Register {
    pub name: String,
    /// 1-based address
    pub address: Address,
    pub data_type: RegisterType,
    /// Element count for numeric types, word count for strings
    pub length: u16,
    pub writable: bool,
    pub unit: Option<String>,
    pub mapping: Option<Mapping>,
    pub validation: Option<Predicate>,
}

impl Register {
    pub fn new(name: impl Into<String>, address: Address, data_type: RegisterType) -> Self {
        Self {
            name: name.into(),
            address,
            data_type,
            length: 1,
            writable: false,
            unit: None,
            mapping: None,
            validation: None,
        }
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn with_length(mut self, length: u16) -> Self {
        self.length = length;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_mapping(mut self, mapping: Mapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn with_validation(mut self, predicate: Predicate) -> Self {
        self.validation = Some(predicate);
        self
    }

    /// Check the descriptor is usable before any I/O happens
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RegisterError::config("Register name must not be empty"));
        }
        if self.address == 0 {
            return Err(RegisterError::config(format!(
                "Register {}: addresses are 1-based, got 0",
                self.name
            )));
        }
        if self.length == 0 {
            return Err(RegisterError::config(format!(
                "Register {}: length must be at least 1",
                self.name
            )));
        }
        self.interval()?;

        if self.data_type == RegisterType::String {
            if self.writable {
                return Err(RegisterError::config(format!(
                    "Register {}: string registers cannot be writable",
                    self.name
                )));
            }
            if self.mapping.is_some() {
                return Err(RegisterError::config(format!(
                    "Register {}: string registers cannot carry a mapping",
                    self.name
                )));
            }
        }
        if self.validation.is_some() && !self.writable {
            return Err(RegisterError::config(format!(
                "Register {}: validation requires a writable register",
                self.name
            )));
        }
        Ok(())
    }

    /// Total words occupied
    pub fn quantity(&self) -> u32 {
        u32::from(self.data_type.width()) * u32::from(self.length)
    }

    /// Address range occupied, `address ..= address + quantity - 1`
    pub fn interval(&self) -> Result<AddressInterval> {
        u16::try_from(self.quantity())
            .ok()
            .and_then(|quantity| AddressInterval::with_quantity(self.address, quantity))
            .ok_or_else(|| {
                RegisterError::config(format!(
                    "Register {}: {} words at {} exceed the address space",
                    self.name,
                    self.quantity(),
                    self.address
                ))
            })
    }

    /// Writable registers live in holding registers, the rest in input registers
    pub fn class(&self) -> RegisterClass {
        if self.writable {
            RegisterClass::Holding
        } else {
            RegisterClass::Input
        }
    }

    /// Decode words read from `interval()` into the exposed value
    pub fn decode(&self, words: &[u16]) -> Result<RegisterValue> {
        if self.data_type == RegisterType::String {
            return Ok(RegisterValue::Text(decode_string(words)));
        }

        let elements = decode_array(words, self.data_type, self.length)?;
        let mut values = elements
            .into_iter()
            .map(|raw| self.expose(raw))
            .collect::<Result<Vec<_>>>()?;

        if values.len() == 1 {
            Ok(values.remove(0))
        } else {
            Ok(RegisterValue::Array(values))
        }
    }

    /// Numeric exposure of element `index`
    pub fn decode_numeric(&self, words: &[u16], index: u16) -> Result<f64> {
        if self.data_type == RegisterType::String {
            return Err(RegisterError::decode(format!(
                "Register {} is a string and has no numeric value",
                self.name
            )));
        }
        if index >= self.length {
            return Err(RegisterError::decode(format!(
                "Register {}: index {index} out of bounds for length {}",
                self.name, self.length
            )));
        }

        let width = usize::from(self.data_type.width());
        let offset = usize::from(index) * width;
        let element = words.get(offset..offset + width).ok_or_else(|| {
            RegisterError::decode(format!(
                "Register {}: expected {} words, got {}",
                self.name,
                self.quantity(),
                words.len()
            ))
        })?;
        let raw = decode_integer(element, self.data_type)?;

        match &self.mapping {
            Some(Mapping::Enum(map)) => Ok(map
                .label(raw)
                .and_then(|label| label.trim().parse::<f64>().ok())
                .unwrap_or(raw as f64)),
            Some(Mapping::Formula(formula)) => formula.forward(raw),
            None => Ok(raw as f64),
        }
    }

    fn expose(&self, raw: i64) -> Result<RegisterValue> {
        match &self.mapping {
            Some(Mapping::Enum(map)) => Ok(map
                .label(raw)
                .map_or(RegisterValue::Integer(raw), |label| {
                    RegisterValue::Label(label.to_string())
                })),
            Some(Mapping::Formula(formula)) => formula.forward(raw).map(RegisterValue::Float),
            None => Ok(RegisterValue::Integer(raw)),
        }
    }

    /// Turn a supplied value into the raw word to write.
    ///
    /// Resolution order is enum reverse lookup, then the inverse formula, then
    /// a plain numeric parse.
    pub fn resolve_write(&self, value: &WriteValue) -> Result<ResolvedWrite> {
        if !self.writable {
            return Err(RegisterError::NotWritable(self.name.clone()));
        }
        if self.quantity() != 1 {
            return Err(RegisterError::unsupported_write(
                &self.name,
                format!(
                    "only single-word registers can be written, {} spans {} words",
                    self.name,
                    self.quantity()
                ),
            ));
        }

        let (raw, domain) = match (&self.mapping, value) {
            (Some(Mapping::Enum(map)), value) => {
                let key = self.enum_key(map, value)?;
                (key as f64, key as f64)
            },
            (Some(Mapping::Formula(formula)), value) => {
                let number = self.number(value)?;
                (formula.inverse(number)?, number)
            },
            (_, value) => {
                let number = self.number(value)?;
                (number, number)
            },
        };

        let word = self.encode_raw(raw)?;
        Ok(ResolvedWrite { word, domain })
    }

    /// Accept a mapped label, or a number that is one of the mapped keys
    fn enum_key(&self, map: &EnumMap, value: &WriteValue) -> Result<i64> {
        let not_mapped = |shown: String| {
            RegisterError::validation(
                &self.name,
                format!("'{shown}' is not one of the mapped labels"),
            )
        };
        if let WriteValue::Text(label) = value {
            if let Some(key) = map.key(label) {
                return Ok(key);
            }
        }
        let number = match value {
            WriteValue::Number(n) => *n,
            WriteValue::Text(text) => text
                .trim()
                .parse::<f64>()
                .map_err(|_| not_mapped(text.clone()))?,
        };
        if number.fract() != 0.0 || !number.is_finite() {
            return Err(not_mapped(number.to_string()));
        }
        let key = number as i64;
        match map.label(key) {
            Some(_) => Ok(key),
            None => Err(not_mapped(number.to_string())),
        }
    }

    fn number(&self, value: &WriteValue) -> Result<f64> {
        match value {
            WriteValue::Number(n) => Ok(*n),
            WriteValue::Text(text) => self.parse_number(text),
        }
    }

    fn parse_number(&self, text: &str) -> Result<f64> {
        text.trim().parse::<f64>().map_err(|_| {
            RegisterError::validation(&self.name, format!("'{text}' is not a number"))
        })
    }

    fn encode_raw(&self, raw: f64) -> Result<u16> {
        let rounded = raw.round();
        let (min, max) = self.data_type.value_range().ok_or_else(|| {
            RegisterError::unsupported_write(&self.name, "register type has no integer form")
        })?;
        if !rounded.is_finite() || rounded < min as f64 || rounded > max as f64 {
            return Err(RegisterError::validation(
                &self.name,
                format!("value {raw} is out of range for {} ({min}..={max})", self.data_type),
            ));
        }

        let words = encode_integer(rounded as i64, self.data_type)?;
        words
            .first()
            .copied()
            .ok_or_else(|| RegisterError::decode("encoder produced no words"))
    }
}

/// Outcome of resolving one supplied write value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedWrite {
    /// Raw word to put on the wire
    pub word: u16,
    /// Value handed to the validation predicate
    pub domain: f64,
}

/// Value exposed for a register read
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValue {
    Integer(i64),
    Float(f64),
    Label(String),
    Text(String),
    Array(Vec<RegisterValue>),
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::Integer(v) => write!(f, "{v}"),
            RegisterValue::Float(v) => write!(f, "{v}"),
            RegisterValue::Label(s) | RegisterValue::Text(s) => f.write_str(s),
            RegisterValue::Array(values) => {
                f.write_str("[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            },
        }
    }
}

/// Value supplied by a write caller
#[derive(Debug, Clone, PartialEq)]
pub enum WriteValue {
    Text(String),
    Number(f64),
}

impl From<&str> for WriteValue {
    fn from(value: &str) -> Self {
        WriteValue::Text(value.to_string())
    }
}

impl From<String> for WriteValue {
    fn from(value: String) -> Self {
        WriteValue::Text(value)
    }
}

impl From<f64> for WriteValue {
    fn from(value: f64) -> Self {
        WriteValue::Number(value)
    }
}

impl fmt::Display for WriteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteValue::Text(s) => f.write_str(s),
            WriteValue::Number(n) => write!(f, "{n}"),
        }
    }
}
