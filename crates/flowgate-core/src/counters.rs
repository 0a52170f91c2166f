//! Engine-wide activity counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global engine statistics.
#[derive(Debug, Default)]
pub struct Counters {
    /// Flows created with at least one filter attached
    pub flows_attached: AtomicU64,
    /// Flows torn down
    pub flows_freed: AtomicU64,
    pub attach_events: AtomicU64,
    pub data_events: AtomicU64,
    pub disconnect_events: AtomicU64,
    pub closed_events: AtomicU64,
    /// Event deliveries refused because a channel was full
    pub flow_control_hits: AtomicU64,
    pub verdicts: AtomicU64,
    /// Actions that named an unknown or detached flow
    pub invalid_actions: AtomicU64,
    pub drops: AtomicU64,
    /// Data refused because policy changed under an existing flow
    pub policy_drops: AtomicU64,
    /// Bytes passed without queuing
    pub fast_path_bytes: AtomicU64,
    pub reinjected_out_bytes: AtomicU64,
    pub reinjected_in_bytes: AtomicU64,
    pub reinject_failures: AtomicU64,
    /// Bytes discarded by a drop verdict
    pub flushed_drop_bytes: AtomicU64,
    /// Bytes discarded at socket close
    pub flushed_close_bytes: AtomicU64,
    pub tail_drops: AtomicU64,
    pub close_wait_timeouts: AtomicU64,
    pub reclaimed_flows: AtomicU64,
    pub stats_messages: AtomicU64,
}

/// Point-in-time copy of [`Counters`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub flows_attached: u64,
    pub flows_freed: u64,
    pub attach_events: u64,
    pub data_events: u64,
    pub disconnect_events: u64,
    pub closed_events: u64,
    pub flow_control_hits: u64,
    pub verdicts: u64,
    pub invalid_actions: u64,
    pub drops: u64,
    pub policy_drops: u64,
    pub fast_path_bytes: u64,
    pub reinjected_out_bytes: u64,
    pub reinjected_in_bytes: u64,
    pub reinject_failures: u64,
    pub flushed_drop_bytes: u64,
    pub flushed_close_bytes: u64,
    pub tail_drops: u64,
    pub close_wait_timeouts: u64,
    pub reclaimed_flows: u64,
    pub stats_messages: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CountersSnapshot {
            flows_attached: get(&self.flows_attached),
            flows_freed: get(&self.flows_freed),
            attach_events: get(&self.attach_events),
            data_events: get(&self.data_events),
            disconnect_events: get(&self.disconnect_events),
            closed_events: get(&self.closed_events),
            flow_control_hits: get(&self.flow_control_hits),
            verdicts: get(&self.verdicts),
            invalid_actions: get(&self.invalid_actions),
            drops: get(&self.drops),
            policy_drops: get(&self.policy_drops),
            fast_path_bytes: get(&self.fast_path_bytes),
            reinjected_out_bytes: get(&self.reinjected_out_bytes),
            reinjected_in_bytes: get(&self.reinjected_in_bytes),
            reinject_failures: get(&self.reinject_failures),
            flushed_drop_bytes: get(&self.flushed_drop_bytes),
            flushed_close_bytes: get(&self.flushed_close_bytes),
            tail_drops: get(&self.tail_drops),
            close_wait_timeouts: get(&self.close_wait_timeouts),
            reclaimed_flows: get(&self.reclaimed_flows),
            stats_messages: get(&self.stats_messages),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_updates() {
        let counters = Counters::new();
        Counters::bump(&counters.verdicts);
        Counters::bump(&counters.verdicts);
        Counters::add(&counters.fast_path_bytes, 1500);

        let snap = counters.snapshot();
        assert_eq!(snap.verdicts, 2);
        assert_eq!(snap.fast_path_bytes, 1500);
        assert_eq!(snap.drops, 0);
    }
}
