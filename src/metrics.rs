//! Per-supervisor diagnostic counters.
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct LinkMetrics {
    pulls: AtomicU64,
    empty_pulls: AtomicU64,
    frames_decoded: AtomicU64,
    decode_errors: AtomicU64,
    stale_node_updates: AtomicU64,
    unknown_node_updates: AtomicU64,
    discarded_results: AtomicU64,
    reconnects_scheduled: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_pulls(&self) {
        bump(&self.pulls);
    }
    pub fn inc_empty_pulls(&self) {
        bump(&self.empty_pulls);
    }
    pub fn inc_frames_decoded(&self) {
        bump(&self.frames_decoded);
    }
    pub fn inc_decode_errors(&self) {
        bump(&self.decode_errors);
    }
    pub fn inc_stale_node_updates(&self) {
        bump(&self.stale_node_updates);
    }
    pub fn inc_unknown_node_updates(&self) {
        bump(&self.unknown_node_updates);
    }
    pub fn inc_discarded_results(&self) {
        bump(&self.discarded_results);
    }
    pub fn inc_reconnects_scheduled(&self) {
        bump(&self.reconnects_scheduled);
    }
    pub fn inc_messages_in(&self) {
        bump(&self.messages_in);
    }
    pub fn inc_messages_out(&self) {
        bump(&self.messages_out);
    }

    pub fn snapshot(&self) -> Snapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Snapshot {
            pulls: load(&self.pulls),
            empty_pulls: load(&self.empty_pulls),
            frames_decoded: load(&self.frames_decoded),
            decode_errors: load(&self.decode_errors),
            stale_node_updates: load(&self.stale_node_updates),
            unknown_node_updates: load(&self.unknown_node_updates),
            discarded_results: load(&self.discarded_results),
            reconnects_scheduled: load(&self.reconnects_scheduled),
            messages_in: load(&self.messages_in),
            messages_out: load(&self.messages_out),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub pulls: u64,
    pub empty_pulls: u64,
    pub frames_decoded: u64,
    pub decode_errors: u64,
    pub stale_node_updates: u64,
    pub unknown_node_updates: u64,
    pub discarded_results: u64,
    pub reconnects_scheduled: u64,
    pub messages_in: u64,
    pub messages_out: u64,
}
