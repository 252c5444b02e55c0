//! Core domain model shared across the VCSR pipeline crates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "vcsr-core";

/// One deliverable unit of synced data.
///
/// `id` is the sole dedup key and must be non-empty; adapters drop records
/// with an empty id before they reach the pipeline. `payload` is opaque here,
/// only sink adapters interpret its shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: BTreeMap<String, String>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timestamp: None,
            payload: BTreeMap::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// Classification of one sink call, as seen by the delivery engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SinkStatus {
    /// 2xx: the sink accepted the record.
    Accepted,
    /// 429: the sink's quota window is exhausted; expected, not a fault.
    RateLimited,
    /// 404-style "endpoint temporarily not accepting" signal.
    NotReady,
    /// Any other non-2xx status.
    Rejected(u16),
}

/// Terminal status of one delivery attempt sequence for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    Sent,
    RateLimited,
    Failed,
}

/// Per-pass record accounting, reported whether or not the pass completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassCounts {
    pub fetched: usize,
    pub new: usize,
    pub sent: usize,
    pub failed: usize,
}
