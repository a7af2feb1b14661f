//! # Node registry
//!
//! Live view of the mesh: one [`NodeRecord`] per 32-bit node number, ordered by
//! node number. Every node-bearing frame is folded in through
//! [`NodeRegistry::apply`], which enforces monotonic freshness:
//!
//! - unknown node + identity-bearing update: insert
//! - known node + full update: replace only when `last_heard` is strictly newer
//!   and the update carries a non-empty identity
//! - known node + envelope-only update: refresh `last_heard`/SNR (and position,
//!   for position packets) in place when strictly newer
//! - anything else is stale and dropped
//!
//! The record of the connected radio is not stored separately. [`NodeRegistry::self_id`]
//! points into the map, so it always resolves to the merged record.

use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A node is shown as online when heard within this many seconds.
pub const ONLINE_WINDOW_SECS: u32 = 2 * 60 * 60;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeUser {
    pub id: String,
    pub long_name: String,
    pub short_name: String,
    /// Upper-case hardware model name, e.g. `TBEAM`.
    pub hw_model: String,
}

impl NodeUser {
    pub fn is_empty(&self) -> bool {
        self.id.is_empty() && self.long_name.is_empty() && self.short_name.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    /// Latitude in 1e-7 degrees.
    pub latitude_i: i32,
    /// Longitude in 1e-7 degrees.
    pub longitude_i: i32,
    pub altitude: i32,
    pub battery_level: u32,
    /// Fix time, seconds since the epoch.
    pub time: u32,
}

impl NodePosition {
    /// Latitude/longitude in degrees, `None` when the node has no fix.
    pub fn coordinate(&self) -> Option<(f64, f64)> {
        if self.latitude_i == 0 && self.longitude_i == 0 {
            return None;
        }
        Some((
            f64::from(self.latitude_i) * 1e-7,
            f64::from(self.longitude_i) * 1e-7,
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub num: u32,
    pub user: Option<NodeUser>,
    pub position: Option<NodePosition>,
    /// Seconds since the epoch.
    pub last_heard: u32,
    pub snr: f32,
}

impl NodeRecord {
    pub fn long_name(&self) -> &str {
        match &self.user {
            Some(u) if !u.long_name.is_empty() => &u.long_name,
            _ => "Unknown",
        }
    }

    pub fn short_name(&self) -> &str {
        match &self.user {
            Some(u) if !u.short_name.is_empty() => &u.short_name,
            _ => "???",
        }
    }

    /// `(long, short)` display names with the `Unknown` / `???` fallbacks.
    pub fn display_names(&self) -> (String, String) {
        (self.long_name().to_string(), self.short_name().to_string())
    }

    pub fn is_online(&self, now: u32) -> bool {
        self.last_heard != 0 && now.saturating_sub(self.last_heard) <= ONLINE_WINDOW_SECS
    }

    fn has_identity(&self) -> bool {
        self.user.as_ref().is_some_and(|u| !u.is_empty())
    }
}

/// Signal/time metadata carried by every received packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub num: u32,
    pub last_heard: u32,
    pub snr: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeUpdate {
    /// Full node-info frame from the radio's database.
    Snapshot(NodeRecord),
    /// Node-info packet heard on the mesh.
    Identity { envelope: Envelope, user: NodeUser },
    /// Position packet heard on the mesh.
    Position {
        envelope: Envelope,
        position: NodePosition,
    },
    /// Any other packet.
    Heard(Envelope),
}

impl NodeUpdate {
    pub fn num(&self) -> u32 {
        match self {
            NodeUpdate::Snapshot(rec) => rec.num,
            NodeUpdate::Identity { envelope, .. }
            | NodeUpdate::Position { envelope, .. }
            | NodeUpdate::Heard(envelope) => envelope.num,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    /// Envelope fields refreshed in place, identity untouched.
    Refreshed,
    /// Not newer than the stored record; dropped.
    Stale,
    /// Envelope for a node we have no record of; dropped.
    Unknown,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        matches!(
            self,
            MergeOutcome::Inserted | MergeOutcome::Replaced | MergeOutcome::Refreshed
        )
    }
}

#[derive(Debug, Default, Clone)]
pub struct NodeRegistry {
    nodes: BTreeMap<u32, NodeRecord>,
    self_id: Option<u32>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, update: NodeUpdate) -> MergeOutcome {
        let num = update.num();
        let outcome = match update {
            NodeUpdate::Snapshot(rec) => self.merge_full(rec),
            NodeUpdate::Identity { envelope, user } if !user.is_empty() => {
                let position = self.nodes.get(&num).and_then(|r| r.position.clone());
                self.merge_full(NodeRecord {
                    num,
                    user: Some(user),
                    position,
                    last_heard: envelope.last_heard,
                    snr: envelope.snr,
                })
            }
            NodeUpdate::Identity { envelope, .. } | NodeUpdate::Heard(envelope) => {
                self.refresh(envelope, None)
            }
            NodeUpdate::Position { envelope, position } => self.refresh(envelope, Some(position)),
        };
        trace!("node 0x{:08x}: {:?}", num, outcome);
        outcome
    }

    fn merge_full(&mut self, incoming: NodeRecord) -> MergeOutcome {
        let Some(existing) = self.nodes.get_mut(&incoming.num) else {
            self.nodes.insert(incoming.num, incoming);
            return MergeOutcome::Inserted;
        };
        if incoming.last_heard <= existing.last_heard {
            return MergeOutcome::Stale;
        }
        if incoming.has_identity() {
            *existing = incoming;
            MergeOutcome::Replaced
        } else {
            existing.last_heard = incoming.last_heard;
            existing.snr = incoming.snr;
            MergeOutcome::Refreshed
        }
    }

    fn refresh(&mut self, envelope: Envelope, position: Option<NodePosition>) -> MergeOutcome {
        let Some(existing) = self.nodes.get_mut(&envelope.num) else {
            return MergeOutcome::Unknown;
        };
        if envelope.last_heard <= existing.last_heard {
            return MergeOutcome::Stale;
        }
        existing.last_heard = envelope.last_heard;
        existing.snr = envelope.snr;
        if let Some(mut pos) = position {
            // Position packets carry no battery reading.
            if pos.battery_level == 0 {
                if let Some(old) = &existing.position {
                    pos.battery_level = old.battery_level;
                }
            }
            existing.position = Some(pos);
        }
        MergeOutcome::Refreshed
    }

    pub fn get(&self, num: u32) -> Option<&NodeRecord> {
        self.nodes.get(&num)
    }

    pub fn contains(&self, num: u32) -> bool {
        self.nodes.contains_key(&num)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    /// Records in node-number order.
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        self.nodes.values().cloned().collect()
    }

    /// `(long, short)` names for a node, with fallbacks when unknown.
    pub fn names_for(&self, num: u32) -> (String, String) {
        match self.nodes.get(&num) {
            Some(rec) => rec.display_names(),
            None => ("Unknown".to_string(), "???".to_string()),
        }
    }

    pub fn self_id(&self) -> Option<u32> {
        self.self_id
    }

    pub fn set_self(&mut self, num: u32) {
        self.self_id = Some(num);
    }

    pub fn clear_self(&mut self) {
        self.self_id = None;
    }

    pub fn self_record(&self) -> Option<&NodeRecord> {
        self.self_id.and_then(|id| self.nodes.get(&id))
    }
}
