use serde::{Deserialize, Serialize};
use std::fmt;

pub type Count = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(u64);

impl ContentId {
    pub fn new(id: u64) -> Option<Self> {
        (id > 0).then_some(Self(id))
    }

    /// Accepts only a plain run of ASCII digits (surrounding whitespace is
    /// ignored) that evaluates to a positive integer.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        raw.parse::<u64>().ok().and_then(Self::new)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    Visible,
    Held,
}

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub client_address: String,
    pub capability_probe: bool,
    pub marker: Option<String>,
}

impl RequestContext {
    pub fn new(client_address: impl Into<String>) -> Self {
        Self {
            client_address: client_address.into(),
            capability_probe: false,
            marker: None,
        }
    }

    pub fn with_probe(mut self) -> Self {
        self.capability_probe = true;
        self
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    pub content_id: ContentId,
    pub report_count: Count,
    pub status: ContentStatus,
    pub moderated: bool,
}
