//! Append-only chat message log.
//!
//! One record per inbound text packet and per successful outbound send. Records
//! are never mutated after insertion; callers get shared references or clones.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "IN")]
    Inbound,
    #[serde(rename = "OUT")]
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "IN",
            Direction::Outbound => "OUT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Protocol-assigned id; 0 for locally originated messages.
    pub message_id: u32,
    /// Seconds since the epoch.
    pub timestamp: u32,
    pub from: u32,
    pub to: u32,
    pub from_long_name: String,
    pub from_short_name: String,
    pub to_long_name: String,
    pub to_short_name: String,
    pub payload: String,
    pub direction: Direction,
    pub acked: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub inbound: usize,
    pub outbound: usize,
}

#[derive(Debug, Default, Clone)]
pub struct MessageLedger {
    records: Vec<MessageRecord>,
}

impl MessageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: MessageRecord) {
        self.records.push(record);
    }

    pub fn snapshot(&self) -> Vec<MessageRecord> {
        self.records.clone()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&MessageRecord> {
        self.records.last()
    }

    pub fn stats(&self) -> LedgerStats {
        self.records
            .iter()
            .fold(LedgerStats::default(), |mut acc, r| {
                match r.direction {
                    Direction::Inbound => acc.inbound += 1,
                    Direction::Outbound => acc.outbound += 1,
                }
                acc
            })
    }
}
