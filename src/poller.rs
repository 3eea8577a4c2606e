//! Poll cycles and control writes.

use crate::dispatcher::Dispatcher;
use crate::protocol::Command;
use crate::registers::{
    DomainValue, RegisterGroup, RegisterMap, PACK_GROUP, PACK_SELECTOR, POLL_GROUPS,
};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// State of one field in a [`Snapshot`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Value(DomainValue),
    /// The register was read but holds a value without mapping.
    Unknown,
    /// The group holding the field could not be read in this cycle.
    Unavailable,
}

impl Reading {
    pub fn value(&self) -> Option<&DomainValue> {
        match self {
            Reading::Value(value) => Some(value),
            _ => None,
        }
    }
}

impl std::fmt::Display for Reading {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Reading::Value(value) => write!(f, "{value}"),
            Reading::Unknown => write!(f, "unknown"),
            Reading::Unavailable => write!(f, "unavailable"),
        }
    }
}

impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Reading::Value(value) => value.serialize(serializer),
            Reading::Unknown => serializer.serialize_str("unknown"),
            Reading::Unavailable => serializer.serialize_str("unavailable"),
        }
    }
}

/// Result of one poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub fields: BTreeMap<String, Reading>,
    /// Groups that could not be read in this cycle.
    pub stale_groups: Vec<String>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self {
            taken_at: Utc::now(),
            fields: BTreeMap::new(),
            stale_groups: Vec::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Reading> {
        self.fields.get(field)
    }

    pub fn value(&self, field: &str) -> Option<&DomainValue> {
        self.get(field).and_then(Reading::value)
    }

    pub fn is_stale(&self, group: &str) -> bool {
        self.stale_groups.iter().any(|stale| stale == group)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// Issues the fixed group reads of a cycle and the out-of-band control writes.
#[derive(Debug, Clone)]
pub struct Poller {
    map: Arc<RegisterMap>,
    pack_slots: Vec<u8>,
    pack_select_delay: Duration,
}

impl Poller {
    pub fn new(map: Arc<RegisterMap>, pack_slots: Vec<u8>, pack_select_delay: Duration) -> Self {
        Self {
            map,
            pack_slots,
            pack_select_delay,
        }
    }

    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    /// Reads every poll group once. A failing group only marks its own fields
    /// unavailable.
    pub async fn poll_cycle(&self, dispatcher: &Dispatcher) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for group in &POLL_GROUPS {
            let rename = |name: &str| name.to_string();
            self.read_group(dispatcher, group, group.name, rename, &mut snapshot)
                .await;
        }
        for &slot in &self.pack_slots {
            self.read_pack(dispatcher, slot, &mut snapshot).await;
        }
        snapshot
    }

    async fn read_pack(&self, dispatcher: &Dispatcher, slot: u8, snapshot: &mut Snapshot) {
        let label = format!("pack_{slot}");
        let rename = |name: &str| format!("pack_{slot}_{}", name.trim_start_matches("pack_"));
        if let Err(err) = self
            .submit_control(dispatcher, PACK_SELECTOR, &DomainValue::Integer(i64::from(slot)))
            .await
        {
            log::warn!("Selecting battery pack {slot} failed: {err}");
            mark_unavailable(snapshot, &label, self.map.fields_in(&PACK_GROUP), rename);
            return;
        }
        tokio::time::sleep(self.pack_select_delay).await;
        self.read_group(dispatcher, &PACK_GROUP, &label, rename, snapshot)
            .await;
    }

    async fn read_group(
        &self,
        dispatcher: &Dispatcher,
        group: &RegisterGroup,
        label: &str,
        rename: impl Fn(&str) -> String,
        snapshot: &mut Snapshot,
    ) {
        let command = Command::read_holding_registers(group.start, group.count);
        match dispatcher.request(command).await {
            Ok(response) => {
                for (name, result) in self.map.decode_group(group.start, &response.words) {
                    let reading = match result {
                        Ok(value) => Reading::Value(value),
                        Err(err) => {
                            log::warn!("Field {name} reported as unknown: {err}");
                            Reading::Unknown
                        }
                    };
                    snapshot.fields.insert(rename(name), reading);
                }
            }
            Err(err) => {
                log::warn!("Reading group {label} failed: {err}");
                mark_unavailable(snapshot, label, self.map.fields_in(group), rename);
            }
        }
    }

    /// Encodes `value` for `field` and writes it.
    pub async fn submit_control(
        &self,
        dispatcher: &Dispatcher,
        field: &str,
        value: &DomainValue,
    ) -> Result<()> {
        let address = self.map.descriptor(field)?.address;
        let words = self.map.encode_field(field, value)?;
        for (offset, word) in (0u16..).zip(words) {
            dispatcher
                .request(Command::write_single_register(address + offset, word))
                .await?;
        }
        log::debug!("Wrote {field} = {value}");
        Ok(())
    }
}

fn mark_unavailable(
    snapshot: &mut Snapshot,
    label: &str,
    fields: Vec<&'static str>,
    rename: impl Fn(&str) -> String,
) {
    snapshot.stale_groups.push(label.to_string());
    for name in fields {
        snapshot.fields.insert(rename(name), Reading::Unavailable);
    }
}
