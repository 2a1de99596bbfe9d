use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::FlagError;
use crate::models::{ContentId, Count};

pub type RawReports = Value;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportMap(BTreeMap<u64, Count>);

impl ReportMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_raw(raw: &RawReports) -> Self {
        let mut clean = BTreeMap::new();
        match raw {
            Value::Object(entries) => {
                for (key, value) in entries {
                    if let (Some(id), Some(count)) = (parse_key(key), parse_count(value)) {
                        clean.insert(id, count);
                    }
                }
            }
            // Sequential integer keys starting at zero are emitted as a JSON
            // list by some writers; the index is the key.
            Value::Array(items) => {
                for (index, value) in items.iter().enumerate() {
                    if let Some(count) = parse_count(value) {
                        clean.insert(index as u64, count);
                    }
                }
            }
            _ => {}
        }
        Self(clean)
    }

    pub fn to_raw(&self) -> RawReports {
        let entries: Map<String, Value> = self
            .0
            .iter()
            .map(|(id, count)| (id.to_string(), Value::from(*count)))
            .collect();
        Value::Object(entries)
    }

    pub fn contains(&self, id: ContentId) -> bool {
        self.0.contains_key(&id.get())
    }

    pub fn count(&self, id: ContentId) -> Count {
        self.0.get(&id.get()).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, id: ContentId) -> Count {
        let entry = self.0.entry(id.get()).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, Count)> + '_ {
        self.0.iter().map(|(id, count)| (*id, *count))
    }
}

fn parse_key(key: &str) -> Option<u64> {
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

fn parse_count(value: &Value) -> Option<Count> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        }),
        Value::String(s) => parse_key(s),
        _ => None,
    }
}

pub fn encode(reports: &ReportMap) -> String {
    STANDARD.encode(reports.to_raw().to_string())
}

pub fn encode_raw(raw: &RawReports) -> String {
    encode(&ReportMap::from_raw(raw))
}

/// Never fails: a token that cannot be read decodes to an empty map.
pub fn decode(token: &str) -> ReportMap {
    match try_decode(token) {
        Ok(reports) => reports,
        Err(err) => {
            debug!(error = %err, "discarding unreadable client marker");
            ReportMap::new()
        }
    }
}

fn try_decode(token: &str) -> Result<ReportMap, FlagError> {
    let bytes = STANDARD
        .decode(token.trim())
        .map_err(|e| FlagError::MalformedClientToken(e.to_string()))?;
    let raw: RawReports = serde_json::from_slice(&bytes)
        .map_err(|e| FlagError::MalformedClientToken(e.to_string()))?;
    if !raw.is_object() && !raw.is_array() {
        return Err(FlagError::MalformedClientToken(
            "expected a mapping of comment ids".to_string(),
        ));
    }
    Ok(ReportMap::from_raw(&raw))
}
