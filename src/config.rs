use crate::schedule::ScheduleLayout;
use crate::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

pub const MINIMUM_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_PACK_SLOT: u8 = 6;

const PLACEHOLDER_ADDRESS: &str = "XX:XX:XX:XX:XX:XX";

/// Host debug verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum DebugLevel {
    #[default]
    None,
    Plugin,
    PluginAndBle,
    All,
}

impl DebugLevel {
    pub fn level_filter(&self) -> log::LevelFilter {
        match self {
            DebugLevel::None => log::LevelFilter::Warn,
            DebugLevel::Plugin => log::LevelFilter::Info,
            DebugLevel::PluginAndBle => log::LevelFilter::Debug,
            DebugLevel::All => log::LevelFilter::Trace,
        }
    }
}

impl TryFrom<u8> for DebugLevel {
    type Error = Error;

    fn try_from(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(DebugLevel::None),
            1 => Ok(DebugLevel::Plugin),
            2 => Ok(DebugLevel::PluginAndBle),
            10 => Ok(DebugLevel::All),
            other => Err(Error::InvalidConfig(format!(
                "debug level {other} is not one of 0, 1, 2, 10"
            ))),
        }
    }
}

/// Everything the driver needs to talk to one power station.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DriverConfig {
    /// Bluetooth MAC address, e.g. `AA:BB:CC:DD:EE:FF`.
    pub address: String,
    #[serde(default = "DriverConfig::default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default)]
    pub debug_level: DebugLevel,
    #[serde(default = "DriverConfig::default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(default = "DriverConfig::default_retries")]
    pub retries: u8,
    #[serde(default = "DriverConfig::default_max_consecutive_timeouts")]
    pub max_consecutive_timeouts: u32,
    #[serde(default = "DriverConfig::default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(default = "DriverConfig::default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,
    #[serde(default = "DriverConfig::default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Battery packs to poll one by one.
    #[serde(default)]
    pub pack_slots: Vec<u8>,
    #[serde(default = "DriverConfig::default_pack_select_delay", with = "humantime_serde")]
    pub pack_select_delay: Duration,
    #[serde(
        default = "DriverConfig::default_control_settle_delay",
        with = "humantime_serde"
    )]
    pub control_settle_delay: Duration,
    #[serde(default)]
    pub schedule_layout: ScheduleLayout,
}

impl DriverConfig {
    fn default_poll_interval() -> Duration {
        Duration::from_secs(20)
    }

    fn default_request_timeout() -> Duration {
        Duration::from_secs(5)
    }

    fn default_retries() -> u8 {
        3
    }

    fn default_max_consecutive_timeouts() -> u32 {
        3
    }

    fn default_backoff_base() -> Duration {
        Duration::from_secs(5)
    }

    fn default_backoff_max() -> Duration {
        Duration::from_secs(300)
    }

    fn default_connect_timeout() -> Duration {
        Duration::from_secs(30)
    }

    fn default_pack_select_delay() -> Duration {
        Duration::from_secs(1)
    }

    fn default_control_settle_delay() -> Duration {
        Duration::from_secs(5)
    }

    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            poll_interval: Self::default_poll_interval(),
            debug_level: DebugLevel::default(),
            request_timeout: Self::default_request_timeout(),
            retries: Self::default_retries(),
            max_consecutive_timeouts: Self::default_max_consecutive_timeouts(),
            backoff_base: Self::default_backoff_base(),
            backoff_max: Self::default_backoff_max(),
            connect_timeout: Self::default_connect_timeout(),
            pack_slots: Vec::new(),
            pack_select_delay: Self::default_pack_select_delay(),
            control_settle_delay: Self::default_control_settle_delay(),
            schedule_layout: ScheduleLayout::default(),
        }
    }

    /// Raises a too short poll interval to the minimum and rejects unusable
    /// settings.
    pub fn validate(&mut self) -> Result<()> {
        validate_address(&self.address)?;
        if self.poll_interval < MINIMUM_POLL_INTERVAL {
            log::warn!(
                "poll interval {} is below the minimum {}, using the minimum",
                humantime::format_duration(self.poll_interval),
                humantime::format_duration(MINIMUM_POLL_INTERVAL)
            );
            self.poll_interval = MINIMUM_POLL_INTERVAL;
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidConfig("request timeout must not be zero".into()));
        }
        if self.max_consecutive_timeouts == 0 {
            return Err(Error::InvalidConfig(
                "max consecutive timeouts must be at least 1".into(),
            ));
        }
        if self.backoff_base.is_zero() || self.backoff_max < self.backoff_base {
            return Err(Error::InvalidConfig(format!(
                "backoff range {}..{} is empty",
                humantime::format_duration(self.backoff_base),
                humantime::format_duration(self.backoff_max)
            )));
        }
        if let Some(slot) = self
            .pack_slots
            .iter()
            .find(|slot| !(1..=MAX_PACK_SLOT).contains(*slot))
        {
            return Err(Error::InvalidConfig(format!(
                "battery pack {slot} outside 1..={MAX_PACK_SLOT}"
            )));
        }
        self.schedule_layout.validate()
    }
}

fn validate_address(address: &str) -> Result<()> {
    if address.eq_ignore_ascii_case(PLACEHOLDER_ADDRESS) {
        return Err(Error::InvalidConfig(
            "device address is still the placeholder, set the MAC of your power station".into(),
        ));
    }
    let octets: Vec<&str> = address.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(Error::InvalidConfig(format!(
            "'{address}' is not a MAC address"
        )));
    }
    Ok(())
}
