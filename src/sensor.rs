// src/sensor.rs
//! "Active talker" sensor view for dashboards: a state string plus
//! attributes, derived from the poller's snapshot.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::metadata::{PollerSnapshot, IDLE_TALKER};

pub const SENSOR_ICON: &str = "mdi:radio-handheld";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TalkerSensor {
    pub name: String,
    pub unique_id: String,
    pub icon: &'static str,
    pub state: String,
    /// Empty until the first record is available.
    pub attributes: Map<String, Value>,
}

impl TalkerSensor {
    pub fn from_snapshot(id: &str, name: &str, snapshot: &PollerSnapshot) -> Self {
        let mut attributes = Map::new();
        let state = match snapshot.current.as_deref() {
            Some(rec) => {
                attributes.insert("talkgroup".into(), rec.talkgroup.clone().into());
                attributes.insert("source".into(), rec.source.clone().into());
                attributes.insert("raw".into(), rec.raw.clone().unwrap_or(Value::Null));
                rec.talker.clone()
            }
            None => IDLE_TALKER.to_string(),
        };
        Self {
            name: format!("{name} Active Talker"),
            unique_id: format!("{id}_active_talker"),
            icon: SENSOR_ICON,
            state,
            attributes,
        }
    }
}
