//! Per (flow, filter) attachment state.

use crate::queue::BufferQueue;
use crate::registry::FilterUnit;
use flowgate_proto::Direction;
use std::time::{Duration, Instant};

/// Externally visible state of a filter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Attach notification not delivered yet
    Unattached,
    /// Attach delivered, waiting for the first action
    AttachSent,
    /// The agent has answered at least once
    DataFlowing,
    /// The last delivery hit back pressure
    FlowControlled,
    /// No longer gating data
    Detached,
}

impl EntryState {
    pub fn is_detached(&self) -> bool {
        matches!(self, Self::Detached)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unattached,
    AttachSent,
    DataFlowing,
}

/// Queues and offsets for one direction of an entry.
#[derive(Debug, Default)]
pub struct DirectionalState {
    /// Bytes not yet released by this filter
    pub control: BufferQueue,
    /// Bytes released by this filter, waiting to move on
    pub pending: BufferQueue,
    pub pass_offset: u64,
    pub peek_offset: u64,
    /// Everything below this offset has been shown to the agent
    pub peeked_offset: u64,
}

impl DirectionalState {
    /// Next range to show the agent, as `(start, len)`.
    ///
    /// The range never crosses a chunk boundary nor the peek offset.
    pub fn next_peek_range(&self) -> Option<(u64, u64)> {
        for (at, chunk) in self.control.iter() {
            let chunk_end = at + chunk.len() as u64;
            if chunk_end <= self.peeked_offset {
                continue;
            }
            let start = self.peeked_offset.max(at);
            let end = chunk_end.min(self.peek_offset);
            if end <= start {
                return None;
            }
            return Some((start, end - start));
        }
        None
    }

    pub fn invariants_hold(&self) -> bool {
        self.pass_offset <= self.peek_offset
            && self.control.start_offset() <= self.peeked_offset
            && self.pending.end_offset() <= self.control.start_offset()
            && self.control.is_consistent()
            && self.pending.is_consistent()
    }
}

/// One filter's view of one flow.
#[derive(Debug)]
pub struct FilterEntry {
    /// Registry slot; cleared once the filter lets go of the flow
    unit: Option<FilterUnit>,
    /// Slot unit this entry was created for
    origin_unit: FilterUnit,
    order_key: u32,
    phase: Phase,
    detached: bool,
    pub(crate) flow_controlled: bool,
    pub(crate) sent_disconnect_out: bool,
    pub(crate) sent_disconnect_in: bool,
    pub(crate) sent_closed: bool,
    pub(crate) last_event: Option<Instant>,
    pub(crate) last_action: Option<Instant>,
    pub(crate) stats_interval: Option<Duration>,
    pub(crate) stats_reported_at: Option<Instant>,
    pub(crate) reported_out: u64,
    pub(crate) reported_in: u64,
    pub(crate) local_reported: bool,
    pub out: DirectionalState,
    pub inbound: DirectionalState,
}

impl FilterEntry {
    pub fn new(unit: FilterUnit, order_key: u32) -> Self {
        Self {
            unit: Some(unit),
            origin_unit: unit,
            order_key,
            phase: Phase::Unattached,
            detached: false,
            flow_controlled: false,
            sent_disconnect_out: false,
            sent_disconnect_in: false,
            sent_closed: false,
            last_event: None,
            last_action: None,
            stats_interval: None,
            stats_reported_at: None,
            reported_out: 0,
            reported_in: 0,
            local_reported: false,
            out: DirectionalState::default(),
            inbound: DirectionalState::default(),
        }
    }

    /// Registry slot, while linked.
    pub fn unit(&self) -> Option<FilterUnit> {
        self.unit
    }

    pub fn origin_unit(&self) -> FilterUnit {
        self.origin_unit
    }

    pub fn order_key(&self) -> u32 {
        self.order_key
    }

    pub fn state(&self) -> EntryState {
        if self.detached {
            EntryState::Detached
        } else if self.flow_controlled {
            EntryState::FlowControlled
        } else {
            match self.phase {
                Phase::Unattached => EntryState::Unattached,
                Phase::AttachSent => EntryState::AttachSent,
                Phase::DataFlowing => EntryState::DataFlowing,
            }
        }
    }

    pub fn dir(&self, direction: Direction) -> &DirectionalState {
        match direction {
            Direction::Outbound => &self.out,
            Direction::Inbound => &self.inbound,
        }
    }

    pub fn dir_mut(&mut self, direction: Direction) -> &mut DirectionalState {
        match direction {
            Direction::Outbound => &mut self.out,
            Direction::Inbound => &mut self.inbound,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.unit.is_some()
    }

    pub fn attach_sent(&self) -> bool {
        self.phase != Phase::Unattached
    }

    pub fn data_started(&self) -> bool {
        self.phase == Phase::DataFlowing
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Still gating data: linked, announced, not detached.
    pub fn is_active(&self) -> bool {
        self.unit.is_some() && self.attach_sent() && !self.detached
    }

    pub(crate) fn mark_attach_sent(&mut self, now: Instant) {
        if self.phase == Phase::Unattached {
            self.phase = Phase::AttachSent;
        }
        self.last_event = Some(now);
    }

    pub(crate) fn mark_data_started(&mut self, now: Instant) {
        self.phase = Phase::DataFlowing;
        self.last_action = Some(now);
    }

    /// Returns `true` on the first call.
    pub(crate) fn mark_detached(&mut self) -> bool {
        !std::mem::replace(&mut self.detached, true)
    }

    /// Sever the registry link. Returns the unit it was linked to.
    pub(crate) fn unlink(&mut self) -> Option<FilterUnit> {
        self.detached = true;
        self.unit.take()
    }

    /// Whether any bytes are held beyond this entry's pass offset.
    pub fn holds_unpassed(&self, direction: Direction, flow_last: u64) -> bool {
        flow_last > self.dir(direction).pass_offset
    }

    pub fn control_queues_empty(&self) -> bool {
        self.out.control.is_empty() && self.inbound.control.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Chunk;

    #[test]
    fn test_state_transitions() {
        let mut entry = FilterEntry::new(FilterUnit(1), 10);
        assert_eq!(entry.state(), EntryState::Unattached);
        assert!(!entry.is_active());

        entry.mark_attach_sent(Instant::now());
        assert_eq!(entry.state(), EntryState::AttachSent);
        assert!(entry.is_active());

        entry.flow_controlled = true;
        assert_eq!(entry.state(), EntryState::FlowControlled);
        entry.flow_controlled = false;

        entry.mark_data_started(Instant::now());
        assert_eq!(entry.state(), EntryState::DataFlowing);

        assert!(entry.mark_detached());
        assert!(!entry.mark_detached());
        assert!(entry.state().is_detached());
        assert!(!entry.is_active());

        assert_eq!(entry.unlink(), Some(FilterUnit(1)));
        assert_eq!(entry.unlink(), None);
        assert_eq!(entry.origin_unit(), FilterUnit(1));
    }

    #[test]
    fn test_peek_range_clamped() {
        let mut state = DirectionalState::default();
        state.control.append(Chunk::new(vec![1u8; 10]));
        state.control.append(Chunk::new(vec![2u8; 10]));

        assert_eq!(state.next_peek_range(), None);

        state.peek_offset = 15;
        assert_eq!(state.next_peek_range(), Some((0, 10)));

        state.peeked_offset = 10;
        assert_eq!(state.next_peek_range(), Some((10, 5)));

        state.peeked_offset = 15;
        assert_eq!(state.next_peek_range(), None);
        assert!(state.invariants_hold());
    }
}
