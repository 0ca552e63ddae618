//! Per-host timer bookkeeping.
//!
//! Timer state for a host is created lazily on first use — most hosts never
//! arm a timer. Cancellation marks the entry invalid in place rather than
//! removing it: the fired event may already be in flight through the global
//! queue, and firing an invalidated timer must be a no-op.

use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;
use tracing::trace;

/// Identifier of a timer within a host.
pub type TimerId = u64;

/// What runs when a timer expires.
pub type TimerCallback = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    expire_at: SystemTime,
    callback: Option<TimerCallback>,
    valid: bool,
}

#[derive(Default)]
struct TimerSet {
    next: TimerId,
    entries: BTreeMap<TimerId, TimerEntry>,
}

/// Timer tables for every host on this worker, keyed by node id.
#[derive(Default)]
pub struct TimerManager {
    sets: HashMap<u32, TimerSet>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for `node`, returning its id. The caller schedules the
    /// matching fired event.
    pub fn create(
        &mut self,
        node: u32,
        expire_at: SystemTime,
        callback: TimerCallback,
    ) -> TimerId {
        let set = self.sets.entry(node).or_default();
        let id = set.next;
        set.next += 1;
        set.entries.insert(
            id,
            TimerEntry {
                expire_at,
                callback: Some(callback),
                valid: true,
            },
        );
        trace!(node, id, "timer armed");
        id
    }

    /// Cancel a timer. The entry stays until its fired event drains; firing
    /// it later is a no-op.
    pub fn invalidate(&mut self, node: u32, id: TimerId) {
        if let Some(entry) = self.sets.get_mut(&node).and_then(|s| s.entries.get_mut(&id)) {
            entry.valid = false;
            entry.callback = None;
        }
    }

    /// Cancel every timer belonging to `node`.
    pub fn invalidate_all(&mut self, node: u32) {
        if let Some(set) = self.sets.get_mut(&node) {
            for entry in set.entries.values_mut() {
                entry.valid = false;
                entry.callback = None;
            }
        }
    }

    /// Consume a timer on expiry. Returns the callback if the timer is still
    /// valid, `None` if it was cancelled or unknown.
    pub fn fire(&mut self, node: u32, id: TimerId) -> Option<TimerCallback> {
        let set = self.sets.get_mut(&node)?;
        let entry = set.entries.remove(&id)?;
        if entry.valid {
            entry.callback
        } else {
            trace!(node, id, "cancelled timer fired");
            None
        }
    }

    /// When the timer would have expired, if it is still armed.
    pub fn expiry(&self, node: u32, id: TimerId) -> Option<SystemTime> {
        let entry = self.sets.get(&node)?.entries.get(&id)?;
        entry.valid.then_some(entry.expire_at)
    }

    /// Drop all timer state for `node` on host teardown.
    pub fn discard(&mut self, node: u32) {
        self.sets.remove(&node);
    }

    /// Timers still armed for `node`.
    pub fn armed(&self, node: u32) -> usize {
        self.sets
            .get(&node)
            .map_or(0, |s| s.entries.values().filter(|e| e.valid).count())
    }
}
