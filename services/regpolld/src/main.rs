//! regpolld - Modbus TCP register polling service

use anyhow::{bail, Context};
use clap::Parser;
use regpoll_core::{Device, ModbusTcpClient, Register, Transport, WriteValue, WrittenRegisters};
use regpolld::cli::{self, Cli, Command};
use regpolld::config::ServiceConfig;
use regpolld::logging;
use regpolld::poller::Poller;
use regpolld::{ServiceError, SERVICE_NAME, SERVICE_VERSION};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

type TcpDevice = Device<Transport<ModbusTcpClient>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    logging::init(args.log_level.as_deref())?;

    let mut config = ServiceConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(address) = &args.device {
        config.device.address = address.clone();
    }

    info!(
        "Starting {} v{} - device {}",
        SERVICE_NAME, SERVICE_VERSION, config.device.address
    );

    let registers = config.registers()?;
    let derived = config.derived(&registers)?;
    let actuators = config.actuators(&registers)?;
    let device = build_device(&config, registers)?;

    match args.command {
        Command::Poll { interval_ms } => {
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.poll_interval());
            let poller = Poller::new(Arc::new(device), interval).with_derived(derived);
            poller
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for Ctrl-C: {}", e);
                    }
                })
                .await;
        },
        Command::Read { name } => {
            let value = device.read_register(&name).await?;
            println!("{name}={value}");
        },
        Command::Write { assignments } => write(&device, &assignments).await?,
        Command::Actuate { name, value } => {
            let Some(actuator) = actuators.iter().find(|a| a.name == name) else {
                bail!("unknown actuator: {name}");
            };
            confirm(actuator.actuate(&device, value).await)?;
        },
        Command::Intervals => {
            let (read, write) = device.covers();
            print!("{}", cli::render_covers(read, write)?);
        },
    }

    Ok(())
}

fn build_device(config: &ServiceConfig, registers: Vec<Register>) -> anyhow::Result<TcpDevice> {
    let client = ModbusTcpClient::new(config.tcp_options());
    let transport = Transport::with_policy(client, config.retry_policy());
    Ok(Device::new(
        registers,
        Arc::new(transport),
        config.device_options(),
    )?)
}

async fn write(device: &TcpDevice, assignments: &[(String, String)]) -> anyhow::Result<()> {
    let mut batch: Vec<(String, WriteValue)> = Vec::with_capacity(assignments.len());
    for (name, text) in assignments {
        let register = device.register(name)?;
        batch.push((name.clone(), cli::write_value_for(register, text)));
    }

    confirm(device.write_registers(&batch).await.map_err(ServiceError::from))
}

fn confirm(result: regpolld::Result<WrittenRegisters>) -> anyhow::Result<()> {
    match result {
        Ok(written) => {
            println!("{written}");
            Ok(())
        },
        Err(ServiceError::Register(e)) if e.is_unconfirmed_write() => {
            warn!("Write not confirmed: {}", e);
            bail!("written but unconfirmed: {e}")
        },
        Err(e) => Err(e.into()),
    }
}
