// src/metadata/normalize.rs
//! Talker metadata normalization: turns whatever JSON the status endpoint
//! returns (raw SDRTrunk export, Icecast `/status-json.xsl`, ad-hoc JSON)
//! into one canonical [`TalkerRecord`].
//!
//! The extraction is driven by [`FIELD_RULES`], an ordered table of candidate
//! keys per output field. The function is total over valid JSON.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Talker shown when nobody is transmitting or no data is available.
pub const IDLE_TALKER: &str = "idle";

/// Canonical "who is talking" record. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TalkerRecord {
    pub talker: String,
    pub talkgroup: Option<String>,
    pub source: Option<String>,
    pub raw: Option<Value>,
}

impl TalkerRecord {
    pub fn idle() -> Self {
        Self {
            talker: IDLE_TALKER.to_string(),
            talkgroup: None,
            source: None,
            raw: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.talker == IDLE_TALKER
    }
}

impl Default for TalkerRecord {
    fn default() -> Self {
        Self::idle()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Talker,
    Talkgroup,
    Source,
}

/// Candidate keys for one output field, tried in order.
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub field: Field,
    pub keys: &'static [&'static str],
}

pub const FIELD_RULES: [FieldRule; 3] = [
    FieldRule {
        field: Field::Talker,
        keys: &["talker", "alias", "title", "metadata"],
    },
    FieldRule {
        field: Field::Talkgroup,
        keys: &["talkgroup", "tg", "genre"],
    },
    FieldRule {
        field: Field::Source,
        keys: &["source", "radio_id", "server_name", "server_description"],
    },
];

/// Normalize an arbitrary status payload into a [`TalkerRecord`].
pub fn normalize(payload: &Value) -> TalkerRecord {
    let working = match payload {
        Value::Array(items) if !items.is_empty() => &items[0],
        other => other,
    };

    let Some(obj) = working.as_object() else {
        return TalkerRecord {
            raw: Some(json!({ "payload": working })),
            ..TalkerRecord::idle()
        };
    };

    let record = icecast_source(obj).unwrap_or(obj);

    let mut out = TalkerRecord {
        raw: Some(payload.clone()),
        ..TalkerRecord::idle()
    };
    for rule in FIELD_RULES.iter() {
        let value = first_present(record, rule.keys);
        match rule.field {
            Field::Talker => {
                if let Some(v) = value {
                    out.talker = v;
                }
            }
            Field::Talkgroup => out.talkgroup = value,
            Field::Source => out.source = value,
        }
    }
    out
}

/// `icestats.source`, or its first element when Icecast lists several mounts.
fn icecast_source(obj: &Map<String, Value>) -> Option<&Map<String, Value>> {
    let source = obj.get("icestats")?.as_object()?.get("source")?;
    match source {
        Value::Array(mounts) => mounts.first()?.as_object(),
        other => other.as_object(),
    }
}

fn first_present(record: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| record.get(*k))
        .find_map(as_text)
}

/// Textual form of a JSON value; `None` for null and empty values.
fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(a) if a.is_empty() => None,
        Value::Object(o) if o.is_empty() => None,
        compound => Some(compound.to_string()),
    }
}
