//! Charge/discharge schedule decoding.
//!
//! The time-control registers pack a fixed number of schedule entries into a
//! group of 16-bit words. Where each flag and time sits inside an entry depends
//! on the firmware revision, so the offsets live in a [`ScheduleLayout`] table
//! that can be replaced from configuration instead of being spread through the
//! decoder.

use crate::{Error, Result};
use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A run of bits inside one word of a schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitField {
    /// Word index relative to the start of the entry.
    pub word: usize,
    pub shift: u8,
    pub width: u8,
}

impl BitField {
    pub const fn new(word: usize, shift: u8, width: u8) -> Self {
        Self { word, shift, width }
    }

    fn mask(&self) -> u16 {
        if self.width >= 16 {
            u16::MAX
        } else {
            (1u16 << self.width) - 1
        }
    }

    pub fn extract(&self, entry: &[u16]) -> u16 {
        (entry[self.word] >> self.shift) & self.mask()
    }

    fn validate(&self, name: &str, words_per_entry: usize) -> Result<()> {
        if self.word >= words_per_entry {
            return Err(Error::InvalidConfig(format!(
                "schedule bit field '{name}' uses word {} of a {words_per_entry} word entry",
                self.word
            )));
        }
        if self.width == 0 || u32::from(self.shift) + u32::from(self.width) > 16 {
            return Err(Error::InvalidConfig(format!(
                "schedule bit field '{name}' (shift {}, width {}) does not fit 16 bits",
                self.shift, self.width
            )));
        }
        Ok(())
    }
}

/// Bit offsets of one schedule entry and the number of entries in the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleLayout {
    pub words_per_entry: usize,
    pub entries: usize,
    pub enabled: BitField,
    /// Bit 0 is Monday, bit 6 is Sunday.
    pub days: BitField,
    pub start_hour: BitField,
    pub start_minute: BitField,
    pub end_hour: BitField,
    pub end_minute: BitField,
}

impl Default for ScheduleLayout {
    /// Layout observed on AC500 firmware: six entries of three words. Word 0
    /// carries the enable flag in bit 15 and the day mask in bits 0..7, words 1
    /// and 2 carry start and end time as `hour << 8 | minute`.
    fn default() -> Self {
        Self {
            words_per_entry: 3,
            entries: 6,
            enabled: BitField::new(0, 15, 1),
            days: BitField::new(0, 0, 7),
            start_hour: BitField::new(1, 8, 8),
            start_minute: BitField::new(1, 0, 8),
            end_hour: BitField::new(2, 8, 8),
            end_minute: BitField::new(2, 0, 8),
        }
    }
}

impl ScheduleLayout {
    pub fn total_words(&self) -> usize {
        self.words_per_entry * self.entries
    }

    pub fn validate(&self) -> Result<()> {
        if self.words_per_entry == 0 || self.entries == 0 {
            return Err(Error::InvalidConfig(
                "schedule layout needs at least one word and one entry".into(),
            ));
        }
        for (name, field) in [
            ("enabled", &self.enabled),
            ("days", &self.days),
            ("start_hour", &self.start_hour),
            ("start_minute", &self.start_minute),
            ("end_hour", &self.end_hour),
            ("end_minute", &self.end_minute),
        ] {
            field.validate(name, self.words_per_entry)?;
        }
        if self.days.width > 7 {
            return Err(Error::InvalidConfig(
                "schedule day mask is wider than a week".into(),
            ));
        }
        Ok(())
    }

    /// Unpacks `words` into entries in register order.
    pub fn decode(&self, field: &str, words: &[u16]) -> Result<Vec<ScheduleEntry>> {
        if words.len() < self.total_words() {
            return Err(Error::TypeMismatch {
                field: field.to_string(),
                expected: "complete schedule word group",
            });
        }
        words
            .chunks_exact(self.words_per_entry)
            .take(self.entries)
            .map(|entry| {
                Ok(ScheduleEntry {
                    days: Weekdays(self.days.extract(entry) as u8),
                    start: time(field, &self.start_hour, &self.start_minute, entry)?,
                    end: time(field, &self.end_hour, &self.end_minute, entry)?,
                    enabled: self.enabled.extract(entry) != 0,
                })
            })
            .collect()
    }
}

fn time(field: &str, hour: &BitField, minute: &BitField, entry: &[u16]) -> Result<NaiveTime> {
    let (h, m) = (hour.extract(entry), minute.extract(entry));
    NaiveTime::from_hms_opt(u32::from(h), u32::from(m), 0).ok_or_else(|| Error::ValueOutOfRange {
        field: field.to_string(),
        value: format!("{h:02}:{m:02}"),
    })
}

/// Day-of-week bitmask, bit 0 is Monday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Weekdays(pub u8);

impl Weekdays {
    const NAMES: [&'static str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

    pub fn contains(&self, weekday: chrono::Weekday) -> bool {
        self.0 & (1 << weekday.num_days_from_monday()) != 0
    }
}

impl fmt::Display for Weekdays {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 & 0x7F {
            0 => write!(f, "never"),
            0x7F => write!(f, "daily"),
            mask => {
                let days: Vec<&str> = Self::NAMES
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, name)| *name)
                    .collect();
                write!(f, "{}", days.join(","))
            }
        }
    }
}

/// One decoded time-range rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleEntry {
    pub days: Weekdays,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub enabled: bool,
}

impl fmt::Display for ScheduleEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {:02}:{:02}-{:02}:{:02} ({})",
            self.days,
            self.start.hour(),
            self.start.minute(),
            self.end.hour(),
            self.end.minute(),
            if self.enabled { "enabled" } else { "disabled" }
        )
    }
}
