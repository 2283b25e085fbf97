//! Command line interface

use crate::config::DEFAULT_CONFIG_PATH;
use crate::error::Result;
use clap::{Parser, Subcommand};
use regpoll_core::{AddressInterval, Mapping, Register, WriteValue};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "regpolld")]
#[command(about = "Register polling service for Modbus TCP devices", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Device address (host:port), overrides the configuration
    #[arg(short, long)]
    pub device: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG when omitted
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Read every register periodically until Ctrl-C
    Poll {
        /// Poll interval in milliseconds, overrides the configuration
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Read one register
    Read { name: String },
    /// Write registers in one batch
    Write {
        #[arg(required = true, value_name = "NAME=VALUE", value_parser = parse_assignment)]
        assignments: Vec<(String, String)>,
    },
    /// Drive a named actuator with one input value
    Actuate {
        name: String,
        #[arg(allow_negative_numbers = true)]
        value: f64,
    },
    /// Show read and write covers
    Intervals,
}

pub fn parse_assignment(s: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing register name in '{s}'"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Numbers go out as numbers unless the register is enum-mapped
pub fn write_value_for(register: &Register, text: &str) -> WriteValue {
    if matches!(register.mapping, Some(Mapping::Enum(_))) {
        return WriteValue::Text(text.to_string());
    }
    match text.parse::<f64>() {
        Ok(number) => WriteValue::Number(number),
        Err(_) => WriteValue::Text(text.to_string()),
    }
}

#[derive(Debug, Serialize)]
struct CoverReport {
    read: Vec<String>,
    write: Vec<String>,
}

/// YAML listing of the read and write covers
pub fn render_covers(read: &[AddressInterval], write: &[AddressInterval]) -> Result<String> {
    let report = CoverReport {
        read: read.iter().map(ToString::to_string).collect(),
        write: write.iter().map(ToString::to_string).collect(),
    };
    Ok(serde_yaml::to_string(&report)?)
}
