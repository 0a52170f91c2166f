//! Flow State
//!
//! One `FlowState` per connection-oriented socket, or per address pair on
//! a connectionless socket. It owns every filter entry for the flow and
//! the per-direction accounting of bytes held back from the transport.
//!
//! Flow state is only touched with its socket locked. The [`FlowLink`]
//! is the shared, lock-free part: registry slots keep weak references to
//! it, and action handlers pin it to find their way back to the socket.

use crate::entry::FilterEntry;
use crate::queue::BufferQueue;
use crate::registry::FilterUnit;
use crate::socket::SocketCore;
use flowgate_proto::{
    Direction, FlowId, FlowOrigin, SocketInfo, TraceEntry, TraceOp, OFFSET_MAX,
};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;
use xxhash_rust::xxh3::xxh3_64;

/// Timing trace capacity per flow.
pub const MAX_TRACE_ENTRIES: usize = 16;

/// Shared identity of a flow.
///
/// The strong count is the flow's reference count: the owning socket holds
/// one, and every in-flight operation that pinned the flow holds another.
#[derive(Debug)]
pub struct FlowLink {
    flow_id: FlowId,
    pub(crate) socket: Weak<SocketCore>,
}

impl FlowLink {
    pub(crate) fn new(flow_id: FlowId, socket: Weak<SocketCore>) -> Self {
        Self { flow_id, socket }
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }
}

/// Hash identifying a flow within its socket (never zero).
pub fn flow_hash(local: Option<SocketAddr>, remote: Option<SocketAddr>) -> u32 {
    let mut key = Vec::with_capacity(40);
    for addr in [local, remote] {
        match addr {
            Some(SocketAddr::V4(a)) => {
                key.extend_from_slice(&a.ip().octets());
                key.extend_from_slice(&a.port().to_be_bytes());
            }
            Some(SocketAddr::V6(a)) => {
                key.extend_from_slice(&a.ip().octets());
                key.extend_from_slice(&a.port().to_be_bytes());
            }
            None => key.push(0),
        }
    }
    let hash = xxh3_64(&key);
    match (hash ^ (hash >> 32)) as u32 {
        0 => 1,
        h => h,
    }
}

/// Flow-level accounting of held bytes for one direction.
#[derive(Debug, Default)]
pub struct PendingAccounting {
    /// Offset of the first byte not yet handed back to the transport
    pub first: u64,
    /// Offset one past the last byte submitted
    pub last: u64,
    /// Buffer memory held
    pub footprint: u64,
    /// Buffers held
    pub buffers: u64,
    /// Datagrams refused for exceeding thresholds
    pub tail_drops: u64,
    /// Lowest pass offset across linked entries
    pub pass_offset: u64,
    /// Released bytes waiting to be handed back to the transport
    pub reinject: BufferQueue,
    /// A re-injection failed and must be retried when space frees up
    pub retry_reinject: bool,
}

impl PendingAccounting {
    /// Bytes held back, bounded by buffer memory.
    pub fn pending(&self) -> u64 {
        (self.last - self.first).min(self.footprint)
    }

    /// Socket buffer space charged for held bytes.
    pub fn space(&self) -> u64 {
        (self.last - self.first).max(self.footprint)
    }

    pub fn outstanding(&self) -> u64 {
        self.last - self.first
    }

    pub(crate) fn release(&mut self, len: u64, footprint: u64) {
        self.first += len;
        self.footprint = self.footprint.saturating_sub(footprint);
        self.buffers = self.buffers.saturating_sub(1);
    }
}

/// Lifecycle flags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlowFlags {
    pub dropped: bool,
    pub close_wait: bool,
    pub socket_closed: bool,
    pub shut_read: bool,
    pub shut_write: bool,
    /// Deferred write shutdown has been completed at the transport
    pub write_shutdown_done: bool,
    /// At least one verdict has arrived
    pub initial_verdict: bool,
    pub no_close_wait: bool,
    /// Flow state has been torn down
    pub freed: bool,
}

/// Coarse lifecycle position of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowPhase {
    Unattached,
    Attached,
    Dropped,
    Closed,
    Freed,
}

/// State of one filtered flow.
#[derive(Debug)]
pub struct FlowState {
    pub(crate) link: Arc<FlowLink>,
    pub(crate) origin: FlowOrigin,
    pub(crate) local: Option<SocketAddr>,
    pub(crate) remote: Option<SocketAddr>,
    /// Required control unit the flow was attached with
    pub(crate) control_unit: u32,
    pub(crate) policy_generation: u64,
    pub(crate) out: PendingAccounting,
    pub(crate) inbound: PendingAccounting,
    /// Sorted by ascending order key
    pub(crate) entries: Vec<FilterEntry>,
    pub(crate) flags: FlowFlags,
    pub(crate) bytes_out: u64,
    pub(crate) bytes_in: u64,
    pub(crate) first_event: Option<Instant>,
    pub(crate) trace: Vec<TraceEntry>,
    pub(crate) created: Instant,
}

impl FlowState {
    pub(crate) fn new(
        link: Arc<FlowLink>,
        origin: FlowOrigin,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        control_unit: u32,
        policy_generation: u64,
        now: Instant,
    ) -> Self {
        Self {
            link,
            origin,
            local,
            remote,
            control_unit,
            policy_generation,
            out: PendingAccounting::default(),
            inbound: PendingAccounting::default(),
            entries: Vec::new(),
            flags: FlowFlags::default(),
            bytes_out: 0,
            bytes_in: 0,
            first_event: None,
            trace: Vec::new(),
            created: now,
        }
    }

    pub fn id(&self) -> FlowId {
        self.link.flow_id()
    }

    /// Current number of strong references to the flow.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.link)
    }

    pub fn phase(&self) -> FlowPhase {
        if self.flags.freed {
            FlowPhase::Freed
        } else if self.flags.dropped {
            FlowPhase::Dropped
        } else if self.flags.socket_closed {
            FlowPhase::Closed
        } else if self.entries.is_empty() {
            FlowPhase::Unattached
        } else {
            FlowPhase::Attached
        }
    }

    pub fn pending(&self, direction: Direction) -> &PendingAccounting {
        match direction {
            Direction::Outbound => &self.out,
            Direction::Inbound => &self.inbound,
        }
    }

    pub(crate) fn pending_mut(&mut self, direction: Direction) -> &mut PendingAccounting {
        match direction {
            Direction::Outbound => &mut self.out,
            Direction::Inbound => &mut self.inbound,
        }
    }

    pub fn entries(&self) -> &[FilterEntry] {
        &self.entries
    }

    pub(crate) fn entry_index(&self, unit: FilterUnit) -> Option<usize> {
        self.entries.iter().position(|e| e.unit() == Some(unit))
    }

    /// Whether any filter still gates this flow.
    pub fn filters_attached(&self) -> bool {
        self.entries.iter().any(FilterEntry::is_active)
    }

    pub fn has_linked_entries(&self) -> bool {
        self.entries.iter().any(FilterEntry::is_linked)
    }

    /// Per-flow view of the socket identity, with this flow's addresses.
    pub(crate) fn socket_info(&self, socket: &SocketInfo) -> SocketInfo {
        SocketInfo {
            local: self.local.or(socket.local),
            remote: self.remote.or(socket.remote),
            ..socket.clone()
        }
    }

    pub(crate) fn add_bytes(&mut self, direction: Direction, len: u64) {
        match direction {
            Direction::Outbound => self.bytes_out += len,
            Direction::Inbound => self.bytes_in += len,
        }
    }

    /// Append to the timing trace; silently stops once full.
    pub(crate) fn record(&mut self, op: TraceOp, now: Instant) {
        let first = *self.first_event.get_or_insert(now);
        if self.trace.len() < MAX_TRACE_ENTRIES {
            self.trace.push(TraceEntry {
                op,
                elapsed_ms: now.duration_since(first).as_millis() as u64,
            });
        }
    }

    /// Recompute the fast-path threshold.
    ///
    /// Only done while nothing is held, so newly submitted bytes can never
    /// overtake bytes still queued.
    pub(crate) fn refresh_pass_offset(&mut self, direction: Direction) {
        if self.pending(direction).outstanding() != 0 {
            return;
        }
        let min = self
            .entries
            .iter()
            .filter(|e| e.is_linked())
            .map(|e| e.dir(direction).pass_offset)
            .min()
            .unwrap_or(OFFSET_MAX);
        self.pending_mut(direction).pass_offset = min;
    }

    /// Whether the remote end is on this host.
    pub(crate) fn remote_is_loopback(&self) -> bool {
        self.remote.is_some_and(|a| a.ip().is_loopback())
    }
}
