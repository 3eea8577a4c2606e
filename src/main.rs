use anyhow::{bail, Context, Result};
use bluetti_lib::registers::RegisterMap;
use bluetti_lib::schedule::ScheduleLayout;
use bluetti_lib::{BtleplugTransport, ConnectionState, Driver, DriverEvent, DriverEvents};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic, sync::Arc};

mod commandline;
mod daemon;
mod mqtt;
mod settings;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .with_context(|| "Cannot init logging")?
        .start()
        .with_context(|| "Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

fn print_fields() -> Result<()> {
    let map = RegisterMap::device(ScheduleLayout::default())
        .with_context(|| "Cannot build register map")?;
    println!("{:<32} {:>7} {:>5} {:<12} writable", "name", "address", "words", "type");
    for descriptor in map.descriptors() {
        println!(
            "{:<32} {:>7} {:>5} {:<12} {}",
            descriptor.name,
            descriptor.address,
            descriptor.words,
            descriptor.kind.domain_type(),
            if descriptor.writable { "yes" } else { "no" }
        );
    }
    Ok(())
}

async fn wait_until_ready(events: &mut DriverEvents) -> Result<()> {
    loop {
        match events.recv().await {
            Some(DriverEvent::StateChanged(ConnectionState::Ready)) => return Ok(()),
            Some(DriverEvent::StateChanged(state)) => info!("Connection {state}"),
            Some(DriverEvent::ExclusiveLock { address }) => bail!(
                "{address} is connected to another client, close the other app or toggle Bluetooth on the device"
            ),
            Some(DriverEvent::ConnectionDown { reason }) => bail!("Cannot reach device: {reason}"),
            Some(_) => {}
            None => bail!("Driver stopped unexpectedly"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let log_handle = logging_init(args.verbose.log_level_filter())?;

    if args.command == commandline::CliCommands::Fields {
        return print_fields();
    }

    let mut config = settings::load(&args.config, args.address.as_deref())?;
    if let commandline::CliCommands::Daemon {
        interval: Some(interval),
        ..
    } = &args.command
    {
        config.poll_interval = *interval;
        config.validate()?;
    }

    let level = config.debug_level.level_filter().max(args.verbose.log_level_filter());
    if let Err(err) = log_handle.parse_new_spec(level.as_str()) {
        warn!("Cannot change log level to {level}: {err}");
    }

    let transport = BtleplugTransport::new(args.adapter.as_deref())
        .await
        .with_context(|| "Cannot open Bluetooth adapter")?;
    let (driver, mut events) = Driver::start(config, Arc::new(transport))
        .with_context(|| "Cannot start driver")?;

    match args.command {
        commandline::CliCommands::Poll => {
            let snapshot = daemon::wait_for_snapshot(&mut events).await;
            driver.stop().await;
            let snapshot = snapshot?;
            for (name, reading) in &snapshot.fields {
                println!("{name}: {reading}");
            }
            if !snapshot.stale_groups.is_empty() {
                warn!("Groups without data: {}", snapshot.stale_groups.join(", "));
            }
        }
        commandline::CliCommands::Set { field, value } => {
            let outcome = async {
                let value = driver
                    .register_map()
                    .parse_value(&field, &value)
                    .with_context(|| format!("Invalid value for {field}"))?;
                wait_until_ready(&mut events).await?;
                driver
                    .submit_control(&field, value.clone())
                    .await
                    .with_context(|| format!("Cannot set {field}"))?;
                println!("{field} set to {value}");
                Ok::<(), anyhow::Error>(())
            }
            .await;
            driver.stop().await;
            outcome?;
        }
        commandline::CliCommands::Daemon { output, .. } => {
            daemon::run(driver, events, output).await?;
        }
        commandline::CliCommands::Fields => {}
    }

    Ok(())
}
