use anyhow::{bail, Context, Result};
use bluetti_lib::{Driver, DriverEvent, DriverEvents, Snapshot};
use log::{error, info, warn};
use serde_json::json;

use crate::{commandline, mqtt};

fn publish_simple_format<'a>(
    publisher: &'a mqtt::MqttPublisher,
    topic: String,
    value: &'a serde_json::Value,
) -> futures_util::future::BoxFuture<'a, ()> {
    Box::pin(async move {
        let payload = match value {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    publish_simple_format(publisher, format!("{topic}/{k}"), v).await;
                }
                return;
            }
            serde_json::Value::Array(arr) => {
                for (i, v) in arr.iter().enumerate() {
                    publish_simple_format(publisher, format!("{topic}/{i}"), v).await;
                }
                return;
            }
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            // Do not publish null values
            serde_json::Value::Null => return,
        };
        if let Err(e) = publisher.publish(&topic, &payload).await {
            error!("Failed to publish message to topic {topic}: {e}");
        }
    })
}

fn print_snapshot(snapshot: &Snapshot) {
    println!("--- Data at {} ---", snapshot.taken_at.with_timezone(&chrono::Local).to_rfc3339());
    for (name, reading) in &snapshot.fields {
        println!("{name}: {reading}");
    }
    if !snapshot.stale_groups.is_empty() {
        println!("stale: {}", snapshot.stale_groups.join(", "));
    }
    println!("--------------------------");
}

async fn publish_snapshot(
    publisher: &mqtt::MqttPublisher,
    format: &commandline::MqttFormat,
    snapshot: &Snapshot,
) -> Result<()> {
    match format {
        commandline::MqttFormat::Json => {
            let mut data_to_publish = serde_json::Map::new();
            data_to_publish.insert(
                "timestamp".to_string(),
                json!(snapshot.taken_at.to_rfc3339()),
            );
            for (name, reading) in &snapshot.fields {
                data_to_publish.insert(name.clone(), serde_json::to_value(reading)?);
            }
            data_to_publish.insert("stale_groups".to_string(), json!(snapshot.stale_groups));
            let json_payload = serde_json::to_string(&data_to_publish)
                .with_context(|| "Failed to serialize snapshot to JSON string")?;
            info!("MQTT output: Attempting to publish data: {json_payload}");
            publisher.publish(publisher.topic(), &json_payload).await?;
        }
        commandline::MqttFormat::Simple => {
            let base_topic = publisher.topic();
            for (name, reading) in &snapshot.fields {
                let value = serde_json::to_value(reading)?;
                publish_simple_format(publisher, format!("{base_topic}/{name}"), &value).await;
            }
        }
    }
    Ok(())
}

async fn handle_event(
    output: &commandline::DaemonOutput,
    publisher: Option<&mqtt::MqttPublisher>,
    event: DriverEvent,
) -> Result<()> {
    match &event {
        DriverEvent::StateChanged(state) => info!("Connection {state}"),
        DriverEvent::ExclusiveLock { address } => warn!(
            "{address} is connected to another client, close the other app or toggle Bluetooth on the device"
        ),
        DriverEvent::ConnectionDown { reason } => warn!("Connection down: {reason}"),
        DriverEvent::ControlResult { field, outcome } => match outcome {
            Ok(()) => info!("Control write {field} succeeded"),
            Err(err) => error!("Control write {field} failed: {err}"),
        },
        DriverEvent::Snapshot(_) => {}
    }

    match (output, publisher) {
        (commandline::DaemonOutput::Console, _) => {
            if let DriverEvent::Snapshot(snapshot) = &event {
                print_snapshot(snapshot);
            }
        }
        (commandline::DaemonOutput::Mqtt { format, .. }, Some(publisher)) => match &event {
            DriverEvent::Snapshot(snapshot) => {
                publish_snapshot(publisher, format, snapshot).await?;
            }
            DriverEvent::StateChanged(state) => {
                let topic = format!("{}/state", publisher.topic());
                publisher.publish(&topic, &state.to_string()).await?;
            }
            _ => {}
        },
        (commandline::DaemonOutput::Mqtt { .. }, None) => {
            warn!("MQTT output selected, but publisher is not initialized. Skipping publish.");
        }
    }
    Ok(())
}

pub async fn run(
    driver: Driver,
    mut events: DriverEvents,
    output: commandline::DaemonOutput,
) -> Result<()> {
    info!("Starting daemon mode: output={output:?}");

    let mut mqtt_publisher: Option<mqtt::MqttPublisher> = None;

    if let commandline::DaemonOutput::Mqtt { config_file, .. } = &output {
        let config = mqtt::MqttConfig::load(config_file)
            .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
        info!("Successfully loaded MQTT config from {config_file}");
        let publisher =
            mqtt::MqttPublisher::new(config).with_context(|| "Failed to create MQTT publisher")?;
        info!("MQTT Publisher created successfully.");
        mqtt_publisher = Some(publisher);
    }

    let result = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                break signal.with_context(|| "Cannot listen for Ctrl-C").map(|()| {
                    info!("Stopping daemon");
                });
            }
            event = events.recv() => match event {
                Some(event) => {
                    if let Err(e) = handle_event(&output, mqtt_publisher.as_ref(), event).await {
                        error!("Failed to output event: {e:#}");
                    }
                }
                None => break Err(anyhow::anyhow!("Driver stopped unexpectedly")),
            },
        }
    };

    driver.stop().await;
    if let Some(publisher) = mqtt_publisher {
        publisher.disconnect().await;
    }
    result
}

/// Waits for the first snapshot, giving up when the device cannot be reached.
pub async fn wait_for_snapshot(events: &mut DriverEvents) -> Result<Snapshot> {
    loop {
        match events.recv().await {
            Some(DriverEvent::Snapshot(snapshot)) => return Ok(snapshot),
            Some(DriverEvent::StateChanged(state)) => info!("Connection {state}"),
            Some(DriverEvent::ExclusiveLock { address }) => bail!(
                "{address} is connected to another client, close the other app or toggle Bluetooth on the device"
            ),
            Some(DriverEvent::ConnectionDown { reason }) => bail!("Cannot reach device: {reason}"),
            Some(DriverEvent::ControlResult { .. }) => {}
            None => bail!("Driver stopped unexpectedly"),
        }
    }
}
