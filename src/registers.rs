//! Register map of the power station.
//!
//! Every logical field is described once in a static [`RegisterDescriptor`]
//! table: where it lives, how many words it spans and which domain type it
//! decodes to. [`RegisterMap`] validates the table at startup and is the only
//! place raw register words are turned into [`DomainValue`]s and back.

use crate::schedule::{ScheduleEntry, ScheduleLayout};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Unit {
    Volt,
    Ampere,
    Hertz,
    KilowattHour,
}

impl Unit {
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Volt => "V",
            Unit::Ampere => "A",
            Unit::Hertz => "Hz",
            Unit::KilowattHour => "kWh",
        }
    }
}

/// Raw value to label mapping of an enumerated register.
#[derive(Debug, PartialEq)]
pub struct EnumTable {
    pub name: &'static str,
    pub values: &'static [(u16, &'static str)],
}

impl EnumTable {
    pub fn label(&self, raw: u16) -> Option<&'static str> {
        self.values
            .iter()
            .find(|(value, _)| *value == raw)
            .map(|(_, label)| *label)
    }

    /// Case-insensitive reverse lookup.
    pub fn raw(&self, label: &str) -> Option<u16> {
        self.values
            .iter()
            .find(|(_, l)| l.eq_ignore_ascii_case(label))
            .map(|(value, _)| *value)
    }
}

pub static OUTPUT_MODE: EnumTable = EnumTable {
    name: "OutputMode",
    values: &[
        (0, "Stop"),
        (1, "Inverter Output"),
        (2, "Bypass Output C"),
        (3, "Bypass Output D"),
        (4, "Load Matching"),
    ],
};

pub static UPS_MODE: EnumTable = EnumTable {
    name: "UpsMode",
    values: &[
        (0, "Customized"),
        (1, "PV Priority"),
        (2, "Standard"),
        (3, "Time Control"),
    ],
};

pub static AUTO_SLEEP_MODE: EnumTable = EnumTable {
    name: "AutoSleepMode",
    values: &[
        (2, "30 Seconds"),
        (3, "1 Minute"),
        (4, "5 Minutes"),
        (5, "Never"),
    ],
};

/// Domain type tag of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DomainType {
    Integer,
    Percentage,
    Power,
    Measurement,
    Switch,
    Enum,
    Text,
    Bitfield,
}

impl fmt::Display for DomainType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", type_name(*self))
    }
}

/// How the raw words of a field are interpreted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    /// Unsigned count; writes are checked against `min..=max`.
    Integer { min: u16, max: u16 },
    /// Clamped to 0..=100 on read.
    Percentage,
    /// Signed 16-bit watts after dividing by `divisor`.
    Power { divisor: f32 },
    /// Unsigned reading after dividing by `divisor`.
    Measurement { divisor: f32, unit: Unit },
    Switch,
    Enum(&'static EnumTable),
    /// Two ASCII characters per word, high byte first.
    Text,
    /// Four words, least significant word first.
    SerialNumber,
    /// `major << 8 | minor`.
    Version,
    /// Packed schedule entries, see [`ScheduleLayout`].
    Schedule,
}

impl FieldKind {
    pub fn domain_type(&self) -> DomainType {
        match self {
            FieldKind::Integer { .. } => DomainType::Integer,
            FieldKind::Percentage => DomainType::Percentage,
            FieldKind::Power { .. } => DomainType::Power,
            FieldKind::Measurement { .. } => DomainType::Measurement,
            FieldKind::Switch => DomainType::Switch,
            FieldKind::Enum(_) => DomainType::Enum,
            FieldKind::Text | FieldKind::SerialNumber | FieldKind::Version => DomainType::Text,
            FieldKind::Schedule => DomainType::Bitfield,
        }
    }
}

/// Immutable description of one logical field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterDescriptor {
    pub name: &'static str,
    pub address: u16,
    pub words: u16,
    pub kind: FieldKind,
    pub writable: bool,
}

impl RegisterDescriptor {
    pub const fn new(name: &'static str, address: u16, kind: FieldKind) -> Self {
        Self {
            name,
            address,
            words: 1,
            kind,
            writable: false,
        }
    }

    pub const fn width(mut self, words: u16) -> Self {
        self.words = words;
        self
    }

    pub const fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.words)
    }
}

/// A contiguous block of registers fetched with one read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterGroup {
    pub name: &'static str,
    pub start: u16,
    pub count: u16,
}

impl RegisterGroup {
    pub fn contains(&self, descriptor: &RegisterDescriptor) -> bool {
        descriptor.address >= self.start
            && descriptor.end() <= u32::from(self.start) + u32::from(self.count)
    }
}

pub const CORE_GROUP: RegisterGroup = RegisterGroup {
    name: "core",
    start: 10,
    count: 40,
};
pub const POWER_GROUP: RegisterGroup = RegisterGroup {
    name: "power",
    start: 70,
    count: 21,
};
pub const PACK_GROUP: RegisterGroup = RegisterGroup {
    name: "pack",
    start: 91,
    count: 37,
};
pub const CONTROL_GROUP: RegisterGroup = RegisterGroup {
    name: "control",
    start: 3001,
    count: 61,
};

/// Groups read by every poll cycle, in order.
pub const POLL_GROUPS: [RegisterGroup; 4] = [CORE_GROUP, POWER_GROUP, PACK_GROUP, CONTROL_GROUP];

/// Writing this register selects which battery pack the pack group reports.
pub const PACK_SELECTOR: &str = "pack_num";

const fn watts(name: &'static str, address: u16) -> RegisterDescriptor {
    RegisterDescriptor::new(name, address, FieldKind::Power { divisor: 1.0 })
}

const fn scaled(name: &'static str, address: u16, divisor: f32, unit: Unit) -> RegisterDescriptor {
    RegisterDescriptor::new(name, address, FieldKind::Measurement { divisor, unit })
}

const fn switch(name: &'static str, address: u16) -> RegisterDescriptor {
    RegisterDescriptor::new(name, address, FieldKind::Switch)
}

/// AC500 register layout.
pub static AC500_REGISTERS: &[RegisterDescriptor] = &[
    // core
    RegisterDescriptor::new("device_type", 10, FieldKind::Text).width(6),
    RegisterDescriptor::new("serial_number", 17, FieldKind::SerialNumber).width(4),
    RegisterDescriptor::new("arm_version", 23, FieldKind::Version),
    RegisterDescriptor::new("dsp_version", 25, FieldKind::Version),
    watts("dc_input_power", 36),
    watts("ac_input_power", 37),
    watts("ac_output_power", 38),
    watts("dc_output_power", 39),
    scaled("power_generation", 41, 10.0, Unit::KilowattHour),
    RegisterDescriptor::new("total_battery_percent", 43, FieldKind::Percentage),
    switch("ac_output_state", 48),
    switch("dc_output_state", 49),
    // power
    RegisterDescriptor::new("ac_output_mode", 70, FieldKind::Enum(&OUTPUT_MODE)),
    scaled("internal_ac_voltage", 71, 10.0, Unit::Volt),
    scaled("internal_current_one", 72, 10.0, Unit::Ampere),
    watts("internal_power_one", 73),
    scaled("internal_ac_frequency", 74, 100.0, Unit::Hertz),
    scaled("internal_current_two", 75, 10.0, Unit::Ampere),
    watts("internal_power_two", 76),
    scaled("ac_input_voltage", 77, 10.0, Unit::Volt),
    scaled("internal_current_three", 78, 10.0, Unit::Ampere),
    watts("internal_power_three", 79),
    scaled("ac_input_frequency", 80, 100.0, Unit::Hertz),
    scaled("internal_dc_input_voltage", 86, 10.0, Unit::Volt),
    watts("internal_dc_input_power", 87),
    scaled("internal_dc_input_current", 88, 10.0, Unit::Ampere),
    watts("ac_charging_power", 89),
    // pack
    RegisterDescriptor::new("pack_num_max", 91, FieldKind::Integer { min: 0, max: 6 }),
    scaled("pack_total_voltage", 92, 10.0, Unit::Volt),
    scaled("pack_voltage", 98, 100.0, Unit::Volt),
    RegisterDescriptor::new("pack_battery_percent", 99, FieldKind::Percentage),
    // control
    RegisterDescriptor::new("ups_mode", 3001, FieldKind::Enum(&UPS_MODE)).writable(),
    RegisterDescriptor::new("ac_output_mode_control", 3002, FieldKind::Enum(&OUTPUT_MODE))
        .writable(),
    switch("split_phase_on", 3004),
    RegisterDescriptor::new(PACK_SELECTOR, 3006, FieldKind::Integer { min: 1, max: 6 })
        .writable(),
    switch("ac_output_on", 3007).writable(),
    switch("dc_output_on", 3008).writable(),
    switch("grid_charge_on", 3011).writable(),
    switch("time_control_on", 3013).writable(),
    RegisterDescriptor::new("battery_range_start", 3015, FieldKind::Percentage).writable(),
    RegisterDescriptor::new("battery_range_end", 3016, FieldKind::Percentage).writable(),
    switch("bluetooth_connected", 3036),
    RegisterDescriptor::new("time_control_programming", 3039, FieldKind::Schedule).width(18),
    RegisterDescriptor::new("auto_sleep_mode", 3061, FieldKind::Enum(&AUTO_SLEEP_MODE))
        .writable(),
];

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DomainValue {
    Integer(i64),
    Percentage(u8),
    /// Watts.
    Power(f32),
    Measurement { value: f32, unit: Unit },
    Switch(bool),
    Enum(&'static str),
    Text(String),
    Schedule(Vec<ScheduleEntry>),
}

impl fmt::Display for DomainValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DomainValue::Integer(value) => write!(f, "{value}"),
            DomainValue::Percentage(value) => write!(f, "{value}%"),
            DomainValue::Power(watts) => write!(f, "{watts} W"),
            DomainValue::Measurement { value, unit } => write!(f, "{value} {}", unit.symbol()),
            DomainValue::Switch(on) => write!(f, "{}", if *on { "on" } else { "off" }),
            DomainValue::Enum(label) => write!(f, "{label}"),
            DomainValue::Text(text) => write!(f, "{text}"),
            DomainValue::Schedule(entries) => {
                let entries: Vec<String> = entries.iter().map(ToString::to_string).collect();
                write!(f, "{}", entries.join(" | "))
            }
        }
    }
}

/// Validated lookup table of field descriptors.
#[derive(Debug, Clone)]
pub struct RegisterMap {
    descriptors: Vec<RegisterDescriptor>,
    index: HashMap<&'static str, usize>,
    schedule_layout: ScheduleLayout,
}

impl RegisterMap {
    /// Builds a map from `descriptors`, rejecting tables that could not be
    /// decoded or written consistently.
    pub fn new(descriptors: &[RegisterDescriptor], schedule_layout: ScheduleLayout) -> Result<Self> {
        schedule_layout.validate()?;
        let mut index = HashMap::with_capacity(descriptors.len());
        for (position, descriptor) in descriptors.iter().enumerate() {
            if index.insert(descriptor.name, position).is_some() {
                return Err(Error::InvalidConfig(format!(
                    "duplicate field '{}'",
                    descriptor.name
                )));
            }
            let expected_width = match descriptor.kind {
                FieldKind::Text => None,
                FieldKind::SerialNumber => Some(4),
                FieldKind::Schedule => Some(schedule_layout.total_words()),
                _ => Some(1),
            };
            let width_ok = match expected_width {
                Some(width) => usize::from(descriptor.words) == width,
                None => descriptor.words >= 1,
            };
            if !width_ok {
                return Err(Error::InvalidConfig(format!(
                    "field '{}' has width {} which does not fit its {} type",
                    descriptor.name,
                    descriptor.words,
                    descriptor.kind.domain_type()
                )));
            }
            if descriptor.writable
                && !matches!(
                    descriptor.kind,
                    FieldKind::Integer { .. }
                        | FieldKind::Percentage
                        | FieldKind::Switch
                        | FieldKind::Enum(_)
                )
            {
                return Err(Error::InvalidConfig(format!(
                    "field '{}' cannot be written",
                    descriptor.name
                )));
            }
            if let FieldKind::Enum(table) = descriptor.kind {
                if table.values.is_empty() {
                    return Err(Error::InvalidConfig(format!(
                        "enum table {} of field '{}' is empty",
                        table.name, descriptor.name
                    )));
                }
            }
        }
        Ok(Self {
            descriptors: descriptors.to_vec(),
            index,
            schedule_layout,
        })
    }

    /// The AC500 map. The schedule field spans as many words as
    /// `schedule_layout` describes, and every field must be covered by a poll
    /// group.
    pub fn device(schedule_layout: ScheduleLayout) -> Result<Self> {
        let schedule_words = u16::try_from(schedule_layout.total_words())
            .map_err(|_| Error::InvalidConfig("schedule layout is too large".into()))?;
        let descriptors: Vec<RegisterDescriptor> = AC500_REGISTERS
            .iter()
            .map(|descriptor| match descriptor.kind {
                FieldKind::Schedule => descriptor.width(schedule_words),
                _ => *descriptor,
            })
            .collect();
        let map = Self::new(&descriptors, schedule_layout)?;
        if let Some(orphan) = map
            .descriptors
            .iter()
            .find(|d| !POLL_GROUPS.iter().any(|group| group.contains(d)))
        {
            return Err(Error::InvalidConfig(format!(
                "field '{}' is not read by any poll group",
                orphan.name
            )));
        }
        Ok(map)
    }

    pub fn descriptors(&self) -> &[RegisterDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, name: &str) -> Result<&RegisterDescriptor> {
        self.index
            .get(name)
            .map(|&position| &self.descriptors[position])
            .ok_or_else(|| Error::UnknownField(name.to_string()))
    }

    /// Names of the fields read by `group`.
    pub fn fields_in(&self, group: &RegisterGroup) -> Vec<&'static str> {
        self.descriptors
            .iter()
            .filter(|d| group.contains(d))
            .map(|d| d.name)
            .collect()
    }

    /// Decodes the raw words of field `name`.
    pub fn decode_field(&self, name: &str, raw: &[u16]) -> Result<DomainValue> {
        let descriptor = self.descriptor(name)?;
        if raw.len() < usize::from(descriptor.words) {
            return Err(Error::TypeMismatch {
                field: name.to_string(),
                expected: "complete register words",
            });
        }
        let raw = &raw[..usize::from(descriptor.words)];
        let value = match descriptor.kind {
            FieldKind::Integer { .. } => DomainValue::Integer(i64::from(raw[0])),
            FieldKind::Percentage => DomainValue::Percentage(raw[0].min(100) as u8),
            FieldKind::Power { divisor } => DomainValue::Power(f32::from(raw[0] as i16) / divisor),
            FieldKind::Measurement { divisor, unit } => DomainValue::Measurement {
                value: f32::from(raw[0]) / divisor,
                unit,
            },
            FieldKind::Switch => DomainValue::Switch(raw[0] != 0),
            FieldKind::Enum(table) => match table.label(raw[0]) {
                Some(label) => DomainValue::Enum(label),
                None => {
                    log::warn!(
                        "Unknown {} value - field={name} raw={}",
                        table.name,
                        raw[0]
                    );
                    return Err(Error::UnknownEnumValue {
                        field: name.to_string(),
                        raw: raw[0],
                    });
                }
            },
            FieldKind::Text => DomainValue::Text(decode_text(raw)),
            FieldKind::SerialNumber => {
                let serial = raw
                    .iter()
                    .rev()
                    .fold(0u64, |acc, word| acc << 16 | u64::from(*word));
                DomainValue::Text(serial.to_string())
            }
            FieldKind::Version => DomainValue::Text(format!("{}.{}", raw[0] >> 8, raw[0] & 0xFF)),
            FieldKind::Schedule => {
                DomainValue::Schedule(self.schedule_layout.decode(name, raw)?)
            }
        };
        Ok(value)
    }

    /// Encodes `value` for the writable field `name`.
    pub fn encode_field(&self, name: &str, value: &DomainValue) -> Result<Vec<u16>> {
        let descriptor = self.descriptor(name)?;
        if !descriptor.writable {
            return Err(Error::ReadOnlyField(name.to_string()));
        }
        let out_of_range = || Error::ValueOutOfRange {
            field: name.to_string(),
            value: value.to_string(),
        };
        let word = match (descriptor.kind, value) {
            (FieldKind::Switch, DomainValue::Switch(on)) => u16::from(*on),
            (FieldKind::Percentage, DomainValue::Percentage(percent)) => {
                if *percent > 100 {
                    return Err(out_of_range());
                }
                u16::from(*percent)
            }
            (FieldKind::Integer { min, max }, DomainValue::Integer(raw)) => {
                match u16::try_from(*raw) {
                    Ok(raw) if (min..=max).contains(&raw) => raw,
                    _ => return Err(out_of_range()),
                }
            }
            (FieldKind::Enum(table), DomainValue::Enum(label)) => {
                table.raw(label).ok_or_else(out_of_range)?
            }
            (FieldKind::Enum(table), DomainValue::Integer(raw)) => match u16::try_from(*raw) {
                Ok(raw) if table.label(raw).is_some() => raw,
                _ => return Err(out_of_range()),
            },
            (kind, _) => {
                return Err(Error::TypeMismatch {
                    field: name.to_string(),
                    expected: type_name(kind.domain_type()),
                })
            }
        };
        Ok(vec![word])
    }

    /// Parses user input for field `name` into its domain value.
    pub fn parse_value(&self, name: &str, text: &str) -> Result<DomainValue> {
        let descriptor = self.descriptor(name)?;
        let text = text.trim();
        let invalid = || Error::ValueOutOfRange {
            field: name.to_string(),
            value: text.to_string(),
        };
        match descriptor.kind {
            FieldKind::Switch => match text.to_ascii_lowercase().as_str() {
                "on" | "true" | "1" => Ok(DomainValue::Switch(true)),
                "off" | "false" | "0" => Ok(DomainValue::Switch(false)),
                _ => Err(invalid()),
            },
            FieldKind::Percentage => text
                .trim_end_matches('%')
                .parse::<u8>()
                .map(DomainValue::Percentage)
                .map_err(|_| invalid()),
            FieldKind::Integer { .. } => text
                .parse::<i64>()
                .map(DomainValue::Integer)
                .map_err(|_| invalid()),
            FieldKind::Enum(table) => {
                if let Some(raw) = table.raw(text) {
                    table.label(raw).map(DomainValue::Enum).ok_or_else(invalid)
                } else {
                    let raw = text.parse::<u16>().map_err(|_| invalid())?;
                    table.label(raw).map(DomainValue::Enum).ok_or_else(invalid)
                }
            }
            kind => Err(Error::TypeMismatch {
                field: name.to_string(),
                expected: type_name(kind.domain_type()),
            }),
        }
    }

    /// Decodes every field lying completely inside the window of `words`
    /// starting at register `start`. Each field keeps its own result.
    pub fn decode_group(
        &self,
        start: u16,
        words: &[u16],
    ) -> Vec<(&'static str, Result<DomainValue>)> {
        let end = u32::from(start) + words.len() as u32;
        self.descriptors
            .iter()
            .filter(|d| d.address >= start && d.end() <= end)
            .map(|d| {
                let offset = usize::from(d.address - start);
                let raw = &words[offset..offset + usize::from(d.words)];
                (d.name, self.decode_field(d.name, raw))
            })
            .collect()
    }
}

fn type_name(domain_type: DomainType) -> &'static str {
    match domain_type {
        DomainType::Integer => "integer",
        DomainType::Percentage => "percentage",
        DomainType::Power => "power",
        DomainType::Measurement => "measurement",
        DomainType::Switch => "switch",
        DomainType::Enum => "enum",
        DomainType::Text => "text",
        DomainType::Bitfield => "bitfield",
    }
}

fn decode_text(raw: &[u16]) -> String {
    raw.iter()
        .flat_map(|word| word.to_be_bytes())
        .filter(|b| b.is_ascii_graphic() || *b == b' ')
        .map(char::from)
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> RegisterMap {
        RegisterMap::device(ScheduleLayout::default()).unwrap()
    }

    #[test]
    fn device_table_is_valid() {
        let map = device();
        assert_eq!(map.descriptors().len(), AC500_REGISTERS.len());
        assert!(map.fields_in(&CONTROL_GROUP).contains(&"time_control_programming"));
        assert_eq!(map.fields_in(&PACK_GROUP).len(), 4);
    }

    #[test]
    fn schedule_layout_sets_field_width() {
        let layout = ScheduleLayout {
            entries: 4,
            ..ScheduleLayout::default()
        };
        let map = RegisterMap::device(layout).unwrap();
        assert_eq!(map.descriptor("time_control_programming").unwrap().words, 12);

        let layout = ScheduleLayout {
            entries: 9,
            ..ScheduleLayout::default()
        };
        assert!(matches!(
            RegisterMap::device(layout),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn summary_payload() {
        let map = RegisterMap::new(
            &[
                RegisterDescriptor::new("percentage", 0, FieldKind::Percentage),
                RegisterDescriptor::new("acOutputW", 1, FieldKind::Power { divisor: 10.0 }),
                RegisterDescriptor::new("dcOutputW", 2, FieldKind::Power { divisor: 10.0 }),
                RegisterDescriptor::new("upsMode", 3, FieldKind::Enum(&UPS_MODE)),
            ],
            ScheduleLayout::default(),
        )
        .unwrap();
        let decoded: HashMap<_, _> = map
            .decode_group(0, &[77, 4500, 0, 1])
            .into_iter()
            .map(|(name, value)| (name, value.unwrap()))
            .collect();
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded["percentage"], DomainValue::Percentage(77));
        assert_eq!(decoded["acOutputW"], DomainValue::Power(450.0));
        assert_eq!(decoded["dcOutputW"], DomainValue::Power(0.0));
        assert_eq!(decoded["upsMode"], DomainValue::Enum("PV Priority"));
    }

    #[test]
    fn decode_device_fields() {
        let map = device();
        assert_eq!(
            map.decode_field("ac_output_power", &[450]).unwrap(),
            DomainValue::Power(450.0)
        );
        assert_eq!(
            map.decode_field("ac_input_power", &[(-120i16) as u16]).unwrap(),
            DomainValue::Power(-120.0)
        );
        assert_eq!(
            map.decode_field("internal_ac_voltage", &[2301]).unwrap(),
            DomainValue::Measurement {
                value: 230.1,
                unit: Unit::Volt
            }
        );
        assert_eq!(
            map.decode_field("arm_version", &[0x0415]).unwrap(),
            DomainValue::Text("4.21".into())
        );
        assert_eq!(
            map.decode_field("serial_number", &[0x0001, 0x0002, 0, 0]).unwrap(),
            DomainValue::Text(0x0002_0001u64.to_string())
        );
        let name = [u16::from_be_bytes(*b"AC"), u16::from_be_bytes(*b"50"), 0x3000, 0, 0, 0];
        assert_eq!(
            map.decode_field("device_type", &name).unwrap(),
            DomainValue::Text("AC500".into())
        );
    }

    #[test]
    fn percentages_clamp() {
        let map = device();
        assert_eq!(
            map.decode_field("total_battery_percent", &[250]).unwrap(),
            DomainValue::Percentage(100)
        );
        assert_eq!(
            map.decode_field("total_battery_percent", &[40000]).unwrap(),
            DomainValue::Percentage(100)
        );
        assert_eq!(
            map.decode_field("total_battery_percent", &[0]).unwrap(),
            DomainValue::Percentage(0)
        );
    }

    #[test]
    fn unknown_enum_value() {
        assert_eq!(
            device().decode_field("ups_mode", &[42]),
            Err(Error::UnknownEnumValue {
                field: "ups_mode".into(),
                raw: 42
            })
        );
    }

    #[test]
    fn group_keeps_bad_fields_separate() {
        let mut words = vec![0u16; 21];
        words[0] = 99;
        words[1] = 2300;
        let decoded = device().decode_group(POWER_GROUP.start, &words);
        let mode = decoded.iter().find(|(name, _)| *name == "ac_output_mode").unwrap();
        assert!(matches!(mode.1, Err(Error::UnknownEnumValue { .. })));
        let voltage = decoded.iter().find(|(name, _)| *name == "internal_ac_voltage").unwrap();
        assert!(voltage.1.is_ok());
    }

    #[test]
    fn encode_writable_fields() {
        let map = device();
        assert_eq!(
            map.encode_field("ac_output_on", &DomainValue::Switch(true)).unwrap(),
            vec![1]
        );
        assert_eq!(
            map.encode_field("ups_mode", &DomainValue::Enum("PV Priority")).unwrap(),
            vec![1]
        );
        assert_eq!(
            map.encode_field("battery_range_end", &DomainValue::Percentage(90)).unwrap(),
            vec![90]
        );
        assert_eq!(
            map.encode_field("auto_sleep_mode", &DomainValue::Integer(5)).unwrap(),
            vec![5]
        );
        assert_eq!(
            map.encode_field("ac_output_mode_control", &DomainValue::Enum("Load Matching"))
                .unwrap(),
            vec![4]
        );
        assert!(matches!(
            map.encode_field("ac_output_mode_control", &DomainValue::Integer(7)),
            Err(Error::ValueOutOfRange { .. })
        ));
        // the status register stays read-only
        assert_eq!(
            map.encode_field("ac_output_mode", &DomainValue::Enum("Stop")),
            Err(Error::ReadOnlyField("ac_output_mode".into()))
        );
    }

    #[test]
    fn encode_rejections() {
        let map = device();
        assert_eq!(
            map.encode_field("ac_output_power", &DomainValue::Power(10.0)),
            Err(Error::ReadOnlyField("ac_output_power".into()))
        );
        assert!(matches!(
            map.encode_field("battery_range_start", &DomainValue::Percentage(101)),
            Err(Error::ValueOutOfRange { .. })
        ));
        assert!(matches!(
            map.encode_field(PACK_SELECTOR, &DomainValue::Integer(7)),
            Err(Error::ValueOutOfRange { .. })
        ));
        assert!(matches!(
            map.encode_field("ups_mode", &DomainValue::Enum("Turbo")),
            Err(Error::ValueOutOfRange { .. })
        ));
        assert!(matches!(
            map.encode_field("grid_charge_on", &DomainValue::Percentage(1)),
            Err(Error::TypeMismatch { .. })
        ));
        assert_eq!(
            map.encode_field("nope", &DomainValue::Switch(true)),
            Err(Error::UnknownField("nope".into()))
        );
    }

    #[test]
    fn parse_user_input() {
        let map = device();
        assert_eq!(
            map.parse_value("dc_output_on", "ON").unwrap(),
            DomainValue::Switch(true)
        );
        assert_eq!(
            map.parse_value("ups_mode", "pv priority").unwrap(),
            DomainValue::Enum("PV Priority")
        );
        assert_eq!(
            map.parse_value("ups_mode", "3").unwrap(),
            DomainValue::Enum("Time Control")
        );
        assert_eq!(
            map.parse_value("battery_range_start", "20%").unwrap(),
            DomainValue::Percentage(20)
        );
        assert!(map.parse_value("ac_output_on", "maybe").is_err());
    }

    #[test]
    fn invalid_tables_rejected() {
        let duplicate = [
            RegisterDescriptor::new("a", 0, FieldKind::Switch),
            RegisterDescriptor::new("a", 1, FieldKind::Switch),
        ];
        assert!(matches!(
            RegisterMap::new(&duplicate, ScheduleLayout::default()),
            Err(Error::InvalidConfig(_))
        ));
        let wide_write = [RegisterDescriptor::new("a", 0, FieldKind::Text)
            .width(2)
            .writable()];
        assert!(matches!(
            RegisterMap::new(&wide_write, ScheduleLayout::default()),
            Err(Error::InvalidConfig(_))
        ));
        let short_schedule =
            [RegisterDescriptor::new("s", 0, FieldKind::Schedule).width(12)];
        assert!(matches!(
            RegisterMap::new(&short_schedule, ScheduleLayout::default()),
            Err(Error::InvalidConfig(_))
        ));
    }
}
