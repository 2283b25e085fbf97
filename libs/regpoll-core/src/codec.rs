//! Register codec
//!
//! Turns raw 16-bit word sequences into integers and text and back. Multi-word
//! integers are little-endian by word: word 0 holds the least-significant 16
//! bits. Devices in the field depend on this order, so it must not change.

use crate::error::{RegisterError, Result};
use std::fmt;
use std::str::FromStr;
use tracing::trace;

/// Register data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterType {
    U16,
    U32,
    S16,
    S32,
    String,
}

impl RegisterType {
    /// Width in words of one element
    pub fn width(self) -> u16 {
        match self {
            RegisterType::U16 | RegisterType::S16 | RegisterType::String => 1,
            RegisterType::U32 | RegisterType::S32 => 2,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, RegisterType::S16 | RegisterType::S32)
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, RegisterType::String)
    }

    /// Inclusive range of values representable by one element
    pub fn value_range(self) -> Option<(i64, i64)> {
        match self {
            RegisterType::U16 => Some((0, i64::from(u16::MAX))),
            RegisterType::S16 => Some((i64::from(i16::MIN), i64::from(i16::MAX))),
            RegisterType::U32 => Some((0, i64::from(u32::MAX))),
            RegisterType::S32 => Some((i64::from(i32::MIN), i64::from(i32::MAX))),
            RegisterType::String => None,
        }
    }
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterType::U16 => "u16",
            RegisterType::U32 => "u32",
            RegisterType::S16 => "s16",
            RegisterType::S32 => "s32",
            RegisterType::String => "string",
        };
        f.write_str(name)
    }
}

impl FromStr for RegisterType {
    type Err = RegisterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "u16" | "uint16" => Ok(RegisterType::U16),
            "u32" | "uint32" => Ok(RegisterType::U32),
            "s16" | "int16" | "i16" => Ok(RegisterType::S16),
            "s32" | "int32" | "i32" => Ok(RegisterType::S32),
            "string" => Ok(RegisterType::String),
            other => Err(RegisterError::config(format!(
                "Unknown register type '{other}'"
            ))),
        }
    }
}

/// Decode one integer element from `words`.
pub fn decode_integer(words: &[u16], data_type: RegisterType) -> Result<i64> {
    let width = usize::from(data_type.width());
    if words.len() < width {
        return Err(RegisterError::decode(format!(
            "Not enough words for {data_type}: need {width}, got {}",
            words.len()
        )));
    }

    let raw = words[..width]
        .iter()
        .enumerate()
        .fold(0u32, |acc, (i, &word)| acc | (u32::from(word) << (16 * i)));

    let value = match data_type {
        RegisterType::U16 | RegisterType::U32 => i64::from(raw),
        RegisterType::S16 => i64::from(raw as u16 as i16),
        RegisterType::S32 => i64::from(raw as i32),
        RegisterType::String => {
            return Err(RegisterError::decode(
                "string register has no integer representation",
            ))
        },
    };
    trace!(
        "Decoded {}: words={:04X?}, value={}",
        data_type,
        &words[..width],
        value
    );
    Ok(value)
}

/// Encode one integer element into `width` words, low word first.
pub fn encode_integer(value: i64, data_type: RegisterType) -> Result<Vec<u16>> {
    let (min, max) = data_type.value_range().ok_or_else(|| {
        RegisterError::decode(format!("Cannot encode an integer as {data_type}"))
    })?;
    if value < min || value > max {
        return Err(RegisterError::decode(format!(
            "Value {value} out of range for {data_type} ({min}..={max})"
        )));
    }

    // two's complement truncation to the type's width
    let raw = value as u32;
    Ok((0..data_type.width())
        .map(|i| (raw >> (16 * u32::from(i))) as u16)
        .collect())
}

/// Decode text from register words.
///
/// Each word contributes its high byte then its low byte. Zero bytes are
/// dropped wherever they appear.
pub fn decode_string(words: &[u16]) -> String {
    let bytes: Vec<u8> = words
        .iter()
        .flat_map(|word| word.to_be_bytes())
        .filter(|&b| b != 0)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Decode `length` consecutive elements of `data_type`.
pub fn decode_array(words: &[u16], data_type: RegisterType, length: u16) -> Result<Vec<i64>> {
    let width = usize::from(data_type.width());
    let needed = width * usize::from(length);
    if words.len() < needed {
        return Err(RegisterError::decode(format!(
            "Not enough words for {length} x {data_type}: need {needed}, got {}",
            words.len()
        )));
    }
    words[..needed]
        .chunks_exact(width)
        .map(|element| decode_integer(element, data_type))
        .collect()
}
