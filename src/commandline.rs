use crate::{mqtt, settings};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Connect, read every register group once and print the snapshot
    Poll,
    /// Write a writable field, e.g. `set ac_output_on on` or `set ups_mode "PV Priority"`
    Set {
        /// Field name as listed by the `fields` command
        field: String,
        /// New value: on/off for switches, 0-100 for percentages, label or raw number for enums
        value: String,
    },
    /// List the register map: name, address, width, type and whether it is writable
    Fields,
    /// Run in daemon mode, continuously polling and outputting snapshots and events
    Daemon {
        /// Output destination for snapshots
        #[command(subcommand)]
        output: DaemonOutput,
        /// Poll interval, overrides the configuration file (e.g., "20s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Print snapshots and connection events to the standard output (console).
    Console,
    /// Publish snapshots and connection events to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "bluetti power station command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Driver configuration file (YAML)
    #[arg(short, long, default_value_t = settings::DEFAULT_CONFIG_FILE.to_string())]
    pub config: String,

    /// Bluetooth MAC address of the power station, overrides the configuration file
    #[arg(short, long)]
    pub address: Option<String>,

    /// Bluetooth adapter to use (e.g., hci0), defaults to the first adapter
    #[arg(long)]
    pub adapter: Option<String>,

    #[command(subcommand)]
    pub command: CliCommands,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_set_command() {
        let args = CliArgs::parse_from([
            "bluetti",
            "--address",
            "AA:BB:CC:DD:EE:FF",
            "set",
            "ups_mode",
            "PV Priority",
        ]);
        assert_eq!(args.config, settings::DEFAULT_CONFIG_FILE);
        assert_eq!(args.address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(
            args.command,
            CliCommands::Set {
                field: "ups_mode".into(),
                value: "PV Priority".into()
            }
        );
    }

    #[test]
    fn parse_daemon_command() {
        let args = CliArgs::parse_from([
            "bluetti", "-v", "daemon", "--interval", "30s", "mqtt", "--format", "json",
        ]);
        assert_eq!(
            args.command,
            CliCommands::Daemon {
                output: DaemonOutput::Mqtt {
                    config_file: mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string(),
                    format: MqttFormat::Json
                },
                interval: Some(Duration::from_secs(30)),
            }
        );
    }
}
